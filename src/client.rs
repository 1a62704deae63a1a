use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{ClientConfig, Credentials, load_credentials};
use crate::error::Result;
use crate::refdes::ReferenceDesignator;
use crate::time::unix_time_millis;
use crate::transport::{HttpTransport, Reply, Transport};
use crate::util::build_url;

const SENSOR_INV: &str = "12576/sensor/inv";
const STREAM_PORT: &str = "12575/stream";
const ANNOTATION_PORT: &str = "12580/anno/find";
const VOCAB_PORT: &str = "12586/vocab";
const DEPLOYMENT_PORT: &str = "12587/events/deployment/query";

/// One stream of an instrument with its availability window, as reported by
/// the table of contents and the `metadata/times` endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamTimes {
    pub stream: String,
    pub method: String,
    #[serde(rename = "beginTime")]
    pub begin_time: String,
    #[serde(rename = "endTime")]
    pub end_time: String,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub sensor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TocInstrument {
    pub reference_designator: String,
    #[serde(default)]
    pub streams: Vec<StreamTimes>,
}

#[derive(Debug, Deserialize)]
struct Toc {
    #[serde(default)]
    instruments: Vec<TocInstrument>,
}

pub(crate) fn parse_toc(text: &str) -> Result<Vec<TocInstrument>> {
    let toc: Toc = serde_json::from_str(text)?;
    Ok(toc.instruments)
}

/// Human-readable names for a reference designator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VocabEntry {
    pub refdes: String,
    #[serde(default)]
    pub instrument: Option<String>,
    #[serde(default, rename = "tocL1")]
    pub toc_l1: Option<String>,
    #[serde(default, rename = "tocL2")]
    pub toc_l2: Option<String>,
    #[serde(default, rename = "tocL3")]
    pub toc_l3: Option<String>,
    #[serde(default)]
    pub preferred_stream: Option<String>,
}

/// Stream metadata fields are sometimes `{"value": ...}` objects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Labeled {
    Value { value: String },
    Plain(String),
}

impl Labeled {
    pub fn as_str(&self) -> &str {
        match self {
            Labeled::Value { value } => value,
            Labeled::Plain(s) => s,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamMeta {
    pub name: String,
    #[serde(default)]
    pub stream_type: Option<Labeled>,
    #[serde(default)]
    pub stream_content: Option<Labeled>,
}

impl StreamMeta {
    pub fn stream_type(&self) -> &str {
        self.stream_type.as_ref().map(Labeled::as_str).unwrap_or("")
    }

    pub fn stream_content(&self) -> &str {
        self.stream_content.as_ref().map(Labeled::as_str).unwrap_or("")
    }
}

/// Authenticated client for the OOI M2M endpoints.
///
/// Cloning is cheap; every clone shares the same transport and connection pool.
#[derive(Clone)]
pub struct Client {
    base_url: String,
    credentials: Credentials,
    progress: bool,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client from environment variables and/or the credentials file.
    ///
    /// This is equivalent to `Client::new(None, None)`.
    pub fn from_env() -> Result<Self> {
        Self::new(None, None)
    }

    /// Creates a client using (in order of precedence):
    /// - explicit `username`/`token` arguments
    /// - environment variables `OOI_USERNAME` / `OOI_TOKEN`
    /// - credentials file from `OOI_M2M_CREDENTIALS` or `~/.ooi-m2m/credentials.json`
    pub fn new(username: Option<String>, token: Option<String>) -> Result<Self> {
        let creds = load_credentials(username, token)?;
        Self::from_config(ClientConfig::new(creds))
    }

    pub fn from_config(cfg: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&cfg)?;
        Ok(Self::with_transport(cfg, Arc::new(transport)))
    }

    /// Uses `transport` for all traffic instead of the pooled HTTP client.
    pub fn with_transport(cfg: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            credentials: cfg.credentials,
            progress: cfg.progress,
            transport,
        }
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn progress(&self) -> bool {
        self.progress
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Root of the data export endpoint.
    pub fn data_url(&self) -> String {
        build_url(&self.base_url, &[SENSOR_INV])
    }

    pub(crate) fn toc_url(&self) -> String {
        build_url(&self.base_url, &[SENSOR_INV, "toc"])
    }

    pub(crate) fn vocab_url(&self) -> String {
        build_url(&self.base_url, &[VOCAB_PORT])
    }

    pub(crate) fn streams_url(&self) -> String {
        build_url(&self.base_url, &[STREAM_PORT])
    }

    pub fn toc(&self) -> Result<Vec<TocInstrument>> {
        let toc: Toc = self.api_json(&self.toc_url(), &[])?;
        Ok(toc.instruments)
    }

    pub fn vocab(&self) -> Result<Vec<VocabEntry>> {
        self.api_json(&self.vocab_url(), &[])
    }

    pub fn streams(&self) -> Result<Vec<StreamMeta>> {
        self.api_json(&self.streams_url(), &[])
    }

    pub fn stream_metadata(&self, name: &str) -> Result<StreamMeta> {
        self.api_json(&build_url(&self.base_url, &[STREAM_PORT, "byname", name]), &[])
    }

    /// Streams the instrument currently produces, with their time windows.
    pub fn instrument_stream_times(&self, rd: &ReferenceDesignator) -> Result<Vec<StreamTimes>> {
        let url = build_url(
            &self.base_url,
            &[
                SENSOR_INV,
                rd.subsite.as_str(),
                rd.node.as_str(),
                rd.sensor.as_str(),
                "metadata",
                "times",
            ],
        );
        self.api_json(&url, &[])
    }

    pub fn deployments(&self, refdes: &str) -> Result<Vec<serde_json::Value>> {
        self.api_json(
            &build_url(&self.base_url, &[DEPLOYMENT_PORT]),
            &[("refdes".to_string(), refdes.to_string())],
        )
    }

    pub fn annotations(
        &self,
        refdes: &str,
        method: &str,
        stream: &str,
        begin: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Vec<serde_json::Value>> {
        let query = [
            ("beginDT".to_string(), unix_time_millis(begin).to_string()),
            ("endDT".to_string(), unix_time_millis(end).to_string()),
            ("method".to_string(), method.to_string()),
            ("refdes".to_string(), refdes.to_string()),
            ("stream".to_string(), stream.to_string()),
        ];
        self.api_json(&build_url(&self.base_url, &[ANNOTATION_PORT]), &query)
    }

    /// Authenticated GET returning the raw reply, whatever its status.
    pub fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<Reply> {
        self.transport.get(url, query, Some(&self.credentials))
    }

    /// Authenticated GET returning the body text, failing on non-success.
    pub fn fetch_text(&self, url: &str) -> Result<String> {
        let reply = self.fetch(url, &[])?;
        if !reply.is_success() {
            return Err(reply.to_error());
        }
        Ok(reply.text())
    }

    /// Unauthenticated GET of a public document, failing on non-success.
    pub fn fetch_public_text(&self, url: &str) -> Result<String> {
        let reply = self.transport.get(url, &[], None)?;
        if !reply.is_success() {
            return Err(reply.to_error());
        }
        Ok(reply.text())
    }

    fn api_json<T: DeserializeOwned>(&self, url: &str, query: &[(String, String)]) -> Result<T> {
        debug!(url, "M2M request");
        let reply = self.fetch(url, query)?;
        if !reply.is_success() {
            return Err(reply.to_error());
        }
        reply.json()
    }
}
