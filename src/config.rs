use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://ooinet.oceanobservatories.org/api/m2m";
pub const CREDENTIALS_ENV: &str = "OOI_M2M_CREDENTIALS";
const DATA_SOURCE_KEY: &str = "ooi";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    /// API token from the ooinet user profile.
    pub token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base M2M URL, typically `https://ooinet.oceanobservatories.org/api/m2m`.
    pub base_url: String,
    pub credentials: Credentials,
    /// Whether to verify TLS certificates. The OOI endpoints have shipped
    /// certificates that fail verification, so this defaults to `false`.
    pub verify: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry_max: usize,
    pub backoff_factor: Duration,
    pub sleep_max: Duration,
    /// Idle connections kept per host by the shared HTTP pool.
    pub pool_size: usize,
    /// Show progress indicators while polling and downloading.
    pub progress: bool,
}

impl ClientConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials,
            verify: false,
            timeout: Duration::from_secs(120),
            retry_max: 10,
            backoff_factor: Duration::from_millis(300),
            sleep_max: Duration::from_secs(120),
            pool_size: 100,
            progress: true,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredCredentials {
    username: String,
    api_key: String,
}

/// Resolves credentials in order of precedence:
/// - explicit `username`/`token` arguments
/// - environment variables `OOI_USERNAME` / `OOI_TOKEN`
/// - the credentials file (`OOI_M2M_CREDENTIALS` or `~/.ooi-m2m/credentials.json`)
pub fn load_credentials(username: Option<String>, token: Option<String>) -> Result<Credentials> {
    let mut username = username.or_else(|| std::env::var("OOI_USERNAME").ok());
    let mut token = token.or_else(|| std::env::var("OOI_TOKEN").ok());

    let candidates = credential_candidates();
    if username.is_none() || token.is_none() {
        for path in &candidates {
            if path.exists() {
                let stored = read_credentials_file(path)?;
                if username.is_none() {
                    username = Some(stored.username);
                }
                if token.is_none() {
                    token = Some(stored.token);
                }
                break;
            }
        }
    }

    let searched = if candidates.is_empty() {
        "no credentials file location available".to_string()
    } else {
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let username = username
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "missing username (set OOI_USERNAME or store credentials in one of: {})",
                searched
            ))
        })?;
    let token = token.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
        Error::Config(format!(
            "missing API token (set OOI_TOKEN or store credentials in one of: {})",
            searched
        ))
    })?;

    Ok(Credentials::new(username.trim(), token.trim()))
}

pub fn read_credentials_file(path: &Path) -> Result<Credentials> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read credentials file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)?;
    let entry = doc.remove(DATA_SOURCE_KEY).ok_or_else(|| {
        Error::Config(format!(
            "credentials file {} has no `{}` entry",
            path.display(),
            DATA_SOURCE_KEY
        ))
    })?;
    let stored: StoredCredentials = serde_json::from_value(entry)?;
    Ok(Credentials::new(stored.username, stored.api_key))
}

/// Writes `creds` to `path`, keeping any other data sources already stored there.
///
/// The parent directory is created and checked for write access first; on unix
/// the file is restricted to owner read/write.
pub fn save_credentials(path: &Path, creds: &Credentials) -> Result<()> {
    if creds.username.trim().is_empty() || creds.token.trim().is_empty() {
        return Err(Error::Config("username and token must not be empty".into()));
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
            check_writable(parent)?;
        }
    }

    let mut doc: serde_json::Map<String, serde_json::Value> = if path.exists() {
        serde_json::from_str(&std::fs::read_to_string(path)?).unwrap_or_default()
    } else {
        serde_json::Map::new()
    };
    doc.insert(
        DATA_SOURCE_KEY.to_string(),
        serde_json::to_value(StoredCredentials {
            username: creds.username.clone(),
            api_key: creds.token.clone(),
        })?,
    );

    std::fs::write(path, serde_json::to_vec_pretty(&doc)?)?;
    restrict_to_owner(path)?;
    Ok(())
}

pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ooi-m2m").join("credentials.json"))
}

fn credential_candidates() -> Vec<PathBuf> {
    if let Ok(p) = std::env::var(CREDENTIALS_ENV) {
        return vec![PathBuf::from(p)];
    }
    default_credentials_path().into_iter().collect()
}

fn check_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".permission_test");
    std::fs::write(&probe, b"testing\n").map_err(|e| {
        Error::Config(format!(
            "no read-write permission in {}: {}",
            dir.display(),
            e
        ))
    })?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}
