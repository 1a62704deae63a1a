use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid reference designator `{0}`: expected at least 4 dash-separated segments")]
    InvalidReferenceDesignator(String),

    #[error("too many instruments to request data for: max is {max}, you have {requested}")]
    TooManyInstruments { requested: usize, max: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cannot parse timestamp `{0}`")]
    TimeParse(String),

    #[error("invalid time range specified: {begin} to {end}")]
    InvalidTimeRange { begin: String, end: String },

    #[error("no matching stream available for {0}")]
    NoStream(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Status {
        status: u16,
        url: String,
        message: String,
    },

    #[error("malformed upstream reply: {0}")]
    MalformedReply(String),

    #[error("gave up after {0:?}")]
    TimedOut(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Errors raised before any network call; retrying them never helps.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidReferenceDesignator(_)
                | Error::TooManyInstruments { .. }
                | Error::InvalidRequest(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Status { status, .. } => crate::util::retriable_status(*status),
            Error::TimedOut(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct M2mErrorResponse {
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) status_code: Option<u16>,
    #[serde(default)]
    pub(crate) reason: Option<String>,
    #[serde(default)]
    pub(crate) detail: Option<String>,
}

impl M2mErrorResponse {
    /// The export endpoint answers some failures with HTTP 200 and an
    /// embedded `status_code`.
    pub(crate) fn embedded_failure(&self) -> Option<u16> {
        self.status_code.filter(|code| *code != 200)
    }
}

pub(crate) fn format_m2m_error(status: StatusCode, url: &str, e: &M2mErrorResponse) -> Error {
    let message = e
        .message
        .as_deref()
        .or(e.reason.as_deref())
        .unwrap_or("")
        .trim();
    let detail = e.detail.as_deref().unwrap_or("").trim();
    let status_in_body = e.status_code.unwrap_or(status.as_u16());

    let message = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        format!(
            "OOI M2M authentication failed (HTTP {}).\n- Check the API username and token from your ooinet user profile\n- Set OOI_USERNAME/OOI_TOKEN or store them with save_credentials\n\nServer message: {}\n{}\nrequest: {}",
            status_in_body, message, detail, url
        )
    } else if status == StatusCode::NOT_FOUND {
        format!(
            "OOI M2M endpoint not found (HTTP 404).\n- The instrument, method or stream may not exist upstream\n- Check the configured base url (default https://ooinet.oceanobservatories.org/api/m2m)\n\nServer message: {}\n{}\nrequest: {}",
            message, detail, url
        )
    } else if status_in_body == 500 {
        format!(
            "OOI M2M is currently down (HTTP 500) for url ({})\n{}",
            url, message
        )
    } else {
        format!(
            "API request failed: HTTP {} for url ({})\n{}\n{}",
            status_in_body, url, message, detail
        )
    };

    Error::Status {
        status: status_in_body,
        url: url.to_string(),
        message,
    }
}
