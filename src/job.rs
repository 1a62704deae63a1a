use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, M2mErrorResponse, Result, format_m2m_error};
use crate::transport::Reply;
use crate::util::urljoin;

/// Where an export job's results will land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub reference_designator: String,
    /// Browsable THREDDS catalog of the result files.
    pub catalog_url: String,
    /// Async results root; `status.txt` appears here once the job is done.
    pub status_root: String,
    pub request_uuid: Option<String>,
}

impl JobHandle {
    pub fn status_url(&self) -> String {
        urljoin(&self.status_root, "status.txt")
    }
}

/// Outcome of submitting one export request.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Asynchronous export (netcdf); poll the handle.
    Job(JobHandle),
    /// Synchronous export (json); the records came back directly.
    Inline {
        reference_designator: String,
        records: Vec<serde_json::Value>,
    },
}

impl Submission {
    pub fn reference_designator(&self) -> &str {
        match self {
            Submission::Job(h) => &h.reference_designator,
            Submission::Inline {
                reference_designator,
                ..
            } => reference_designator,
        }
    }

    pub fn job(&self) -> Option<&JobHandle> {
        match self {
            Submission::Job(h) => Some(h),
            Submission::Inline { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobReply {
    #[serde(default, rename = "allURLs")]
    all_urls: Vec<String>,
    #[serde(default, rename = "requestUUID")]
    request_uuid: Option<String>,
}

/// Interprets the export endpoint's reply for `refdes`.
pub fn parse_submission(reply: &Reply, refdes: &str) -> Result<Submission> {
    if !reply.is_success() {
        return Err(reply.to_error());
    }

    let value: serde_json::Value = reply.json()?;
    if let serde_json::Value::Array(records) = value {
        return Ok(Submission::Inline {
            reference_designator: refdes.to_string(),
            records,
        });
    }

    let embedded: M2mErrorResponse =
        serde_json::from_value(value.clone()).unwrap_or_else(|_| M2mErrorResponse {
            status_code: value
                .get("status_code")
                .and_then(|c| c.as_u64())
                .and_then(|c| u16::try_from(c).ok()),
            message: value.get("message").map(|m| m.to_string()),
            ..Default::default()
        });
    if let Some(code) = embedded.embedded_failure() {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Err(format_m2m_error(status, &reply.url, &embedded));
    }

    let job: JobReply = serde_json::from_value(value)
        .map_err(|e| Error::MalformedReply(format!("{} ({})", e, reply.url)))?;
    let mut urls = job.all_urls.into_iter();
    match (urls.next(), urls.next()) {
        (Some(catalog_url), Some(status_root)) => Ok(Submission::Job(JobHandle {
            reference_designator: refdes.to_string(),
            catalog_url,
            status_root,
            request_uuid: job.request_uuid,
        })),
        _ => Err(Error::MalformedReply(format!(
            "export reply for {} lacks catalog and status URLs ({})",
            refdes, reply.url
        ))),
    }
}
