use std::time::Duration;

pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 500 | 502 | 503 | 504 | 429 | 408)
}

/// Delay before retry number `attempt` (1-based): `factor * 2^(attempt-1)`,
/// capped at `max`.
pub(crate) fn backoff(factor: Duration, attempt: usize, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(30) as i32;
    let next = Duration::from_secs_f64(factor.as_secs_f64() * 2f64.powi(exp));
    if next > max { max } else { next }
}

pub(crate) fn guess_filename_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().and_then(|s| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    })
}

pub(crate) fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Joins path segments with `/`, trimming redundant slashes at the seams.
pub(crate) fn build_url<S: AsRef<str>>(base: &str, segments: &[S]) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for s in segments {
        let s = s.as_ref().trim_matches('/');
        if s.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(s);
    }
    out
}

/// Splits a comma-separated filter into trimmed, non-empty terms.
pub(crate) fn split_terms(s: &str) -> Vec<String> {
    s.split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}
