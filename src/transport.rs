use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{ClientConfig, Credentials};
use crate::error::{Error, M2mErrorResponse, Result, format_m2m_error};
use crate::util::{backoff, guess_filename_from_url, retriable_status};

/// A fully buffered HTTP reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub url: String,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::MalformedReply(format!(
                "failed to parse JSON (url={}, status={}): {}",
                self.url, self.status, e
            ))
        })
    }

    /// Converts a non-success reply into an actionable [`Error::Status`].
    pub(crate) fn to_error(&self) -> Error {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::from_slice::<M2mErrorResponse>(&self.body).unwrap_or_else(|_| {
            M2mErrorResponse {
                message: Some(self.text()),
                ..Default::default()
            }
        });
        format_m2m_error(status, &self.url, &body)
    }
}

/// The network seam. Everything above this trait is testable with canned replies.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, query: &[(String, String)], auth: Option<&Credentials>) -> Result<Reply>;

    /// Fetches `url` into `target`, returning the written path.
    fn download(&self, url: &str, target: &Path) -> Result<PathBuf> {
        let reply = self.get(url, &[], None)?;
        if !reply.is_success() {
            return Err(reply.to_error());
        }
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(target, &reply.body)?;
        Ok(target.to_path_buf())
    }
}

/// Pooled blocking HTTP transport shared by every worker of a session.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    retry_max: usize,
    backoff_factor: Duration,
    sleep_max: Duration,
    progress: bool,
}

impl HttpTransport {
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ooi-m2m-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("ooi-m2m-rs")),
        );

        let mut builder = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(cfg.timeout)
            .pool_max_idle_per_host(cfg.pool_size);

        if !cfg.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            retry_max: cfg.retry_max.max(1),
            backoff_factor: cfg.backoff_factor,
            sleep_max: cfg.sleep_max,
            progress: cfg.progress,
        })
    }

    fn robust_request<F>(&self, mut f: F) -> Result<Response>
    where
        F: FnMut() -> std::result::Result<Response, reqwest::Error>,
    {
        let mut tries = 0usize;
        loop {
            match f() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if retriable_status(status) {
                        tries += 1;
                        if tries >= self.retry_max {
                            return Ok(resp);
                        }
                        let delay = backoff(self.backoff_factor, tries, self.sleep_max);
                        debug!(status, attempt = tries, ?delay, url = %resp.url(), "retrying");
                        thread::sleep(delay);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    tries += 1;
                    if tries >= self.retry_max {
                        return Err(Error::Http(err));
                    }
                    // timeouts / transient connection errors
                    let delay = backoff(self.backoff_factor, tries, self.sleep_max);
                    debug!(attempt = tries, ?delay, error = %err, "retrying");
                    thread::sleep(delay);
                }
            }
        }
    }

    fn progress_bar(&self, downloaded: u64) -> Option<ProgressBar> {
        if !self.progress {
            return None;
        }
        let pb = ProgressBar::no_length();
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
        ) {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_position(downloaded);
        Some(pb)
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, query: &[(String, String)], auth: Option<&Credentials>) -> Result<Reply> {
        let resp = self.robust_request(|| {
            let mut req = self.http.get(url).query(query);
            if let Some(c) = auth {
                req = req.basic_auth(&c.username, Some(&c.token));
            }
            req.send()
        })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.bytes()?.to_vec();
        debug!(status, url = %final_url, bytes = body.len(), "GET");
        Ok(Reply {
            status,
            url: final_url,
            body,
        })
    }

    fn download(&self, url: &str, target: &Path) -> Result<PathBuf> {
        let target = if target.as_os_str().is_empty() {
            guess_filename_from_url(url)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("download"))
        } else {
            target.to_path_buf()
        };

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut downloaded: u64 = 0;
        let mut mode_append = false;
        let mut range_from: Option<u64> = None;

        if target.exists() {
            downloaded = std::fs::metadata(&target)?.len();
            if downloaded > 0 {
                mode_append = true;
                range_from = Some(downloaded);
            }
        }

        let pb = self.progress_bar(downloaded);

        let mut tries = 0usize;
        'download_attempt: while tries < self.retry_max {
            let resp = self.robust_request(|| {
                let mut req = self.http.get(url);
                if let Some(from) = range_from {
                    req = req.header(RANGE, format!("bytes={}-", from));
                }
                req.send()
            })?;

            let status = resp.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE && range_from.is_some() {
                // already complete on disk
                if let Some(pb) = &pb {
                    pb.finish_and_clear();
                }
                return Ok(target);
            }
            if !status.is_success() {
                return Err(Error::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                    message: format!("download failed: HTTP {} for url ({})", status, url),
                });
            }
            if range_from.is_some() && status != StatusCode::PARTIAL_CONTENT {
                // server ignored the range; start over
                mode_append = false;
                downloaded = 0;
            }

            let expected = resp.content_length().map(|n| n + downloaded);
            if let Some(pb) = &pb {
                if let Some(total) = expected {
                    pb.set_length(total);
                }
                pb.set_position(downloaded);
            }

            let mut resp = resp;
            let mut out = OpenOptions::new()
                .create(true)
                .write(true)
                .append(mode_append)
                .truncate(!mode_append)
                .open(&target)?;

            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = match resp.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tries += 1;
                        if tries >= self.retry_max {
                            return Err(Error::Io(e));
                        }

                        // resume
                        out.flush().ok();
                        downloaded = std::fs::metadata(&target)?.len();
                        range_from = Some(downloaded);
                        mode_append = true;
                        warn!(url, downloaded, error = %e, "download interrupted, resuming");
                        thread::sleep(backoff(self.backoff_factor, tries, self.sleep_max));
                        continue 'download_attempt;
                    }
                };

                out.write_all(&buf[..n])?;
                downloaded += n as u64;
                if let Some(pb) = &pb {
                    pb.inc(n as u64);
                }
            }

            out.flush()?;

            match expected {
                Some(total) if downloaded < total => {
                    tries += 1;
                    downloaded = std::fs::metadata(&target)?.len();
                    range_from = Some(downloaded);
                    mode_append = true;
                    thread::sleep(backoff(self.backoff_factor, tries, self.sleep_max));
                }
                _ => {
                    if let Some(pb) = &pb {
                        pb.finish_and_clear();
                    }
                    return Ok(target);
                }
            }
        }

        Err(Error::DataUnavailable(format!(
            "download failed: {} byte(s) received from {}",
            downloaded, url
        )))
    }
}
