//! Registry credentials and the sources they are resolved from.
//!
//! The registry client asks a [`CredentialSource`] for the credential of a
//! registry host before any network operation. Sources:
//!
//! - [`CredentialStore`]: per-registry JSON credential file
//! - [`DockerConfigCredentials`]: `auths` entries of `~/.docker/config.json`
//! - [`EnvCredentials`]: `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`
//! - [`ChainedCredentials`]: first non-anonymous answer of several sources

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use cont_core::error::{ContError, Result};
use serde::Deserialize;

/// Credential for one registry host.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credential {
    #[default]
    Anonymous,
    Basic { username: String, secret: String },
}

impl Credential {
    pub fn basic(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("secret", &"<redacted>")
                .finish(),
        }
    }
}

/// Resolves the credential to use for a registry host.
pub trait CredentialSource: Send + Sync {
    /// Credential for `host`, `Credential::Anonymous` if none is configured.
    fn credential_for(&self, host: &str) -> Result<Credential>;
}

/// Always anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousCredentials;

impl CredentialSource for AnonymousCredentials {
    fn credential_for(&self, _host: &str) -> Result<Credential> {
        Ok(Credential::Anonymous)
    }
}

/// Per-registry credential entry.
#[derive(Debug, Clone, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

/// Credential file format.
#[derive(Debug, Default, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    registries: HashMap<String, CredentialEntry>,
}

/// Read-only credential file for container registries.
///
/// Read from `~/.cont/auth/credentials.json` unless configured otherwise:
///
/// ```json
/// {"registries": {"ghcr.io": {"username": "user", "password": "token"}}}
/// ```
///
/// The file is maintained outside the daemon and read on every lookup.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a credential store at the default path.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ContError::ConfigError("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self {
            path: home.join(".cont").join("auth").join("credentials.json"),
        })
    }

    /// Create a credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Credential for a registry, if the file has one. Keys are matched
    /// after Docker Hub normalization.
    pub fn get(&self, registry: &str) -> Result<Option<Credential>> {
        let file = self.load()?;
        let wanted = normalize_registry(registry);
        Ok(file
            .registries
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, e)| Credential::basic(&e.username, &e.password)))
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            ContError::AuthError {
                registry: "*".to_string(),
                message: format!(
                    "Failed to read credential store {}: {}",
                    self.path.display(),
                    e
                ),
            }
        })?;
        serde_json::from_str(&data).map_err(|e| ContError::AuthError {
            registry: "*".to_string(),
            message: format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ),
        })
    }
}

impl CredentialSource for CredentialStore {
    fn credential_for(&self, host: &str) -> Result<Credential> {
        Ok(self.get(host)?.unwrap_or_default())
    }
}

/// `auths` section of a Docker client config file.
#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Credentials from a Docker client config file (`~/.docker/config.json`).
///
/// Only inline `auths` entries are read; credential helpers are not invoked.
pub struct DockerConfigCredentials {
    path: PathBuf,
}

impl DockerConfigCredentials {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `$DOCKER_CONFIG/config.json`, falling back to `~/.docker/config.json`.
    pub fn default_path() -> Option<Self> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(Self::new(Path::new(&dir).join("config.json")));
        }
        dirs::home_dir().map(|home| Self::new(home.join(".docker").join("config.json")))
    }

    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|e| ContError::AuthError {
            registry: "*".to_string(),
            message: format!("Failed to parse {}: {}", self.path.display(), e),
        })
    }
}

impl CredentialSource for DockerConfigCredentials {
    fn credential_for(&self, host: &str) -> Result<Credential> {
        let config = self.load()?;
        let wanted = normalize_registry(host);

        // Keys may be bare hosts or URLs like "https://index.docker.io/v1/".
        let entry = config.auths.iter().find_map(|(key, entry)| {
            let key_host = key
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or_default();
            (normalize_registry(key_host) == wanted).then_some(entry)
        });
        let Some(entry) = entry else {
            return Ok(Credential::Anonymous);
        };

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Credential::basic(username, password));
        }
        match &entry.auth {
            Some(auth) => decode_basic_auth(host, auth),
            None => Ok(Credential::Anonymous),
        }
    }
}

/// Decode a base64 `user:password` auth string.
fn decode_basic_auth(host: &str, auth: &str) -> Result<Credential> {
    let invalid = |message: String| ContError::AuthError {
        registry: host.to_string(),
        message,
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .map_err(|e| invalid(format!("Invalid base64 auth entry: {}", e)))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| invalid("Auth entry is not UTF-8".to_string()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("Auth entry is not in user:password form".to_string()))?;
    Ok(Credential::basic(username, password))
}

/// Credentials from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, for every host.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn credential_for(&self, _host: &str) -> Result<Credential> {
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) if !username.is_empty() => {
                Ok(Credential::basic(username, password))
            }
            _ => Ok(Credential::Anonymous),
        }
    }
}

/// Asks each source in order; the first non-anonymous credential wins.
#[derive(Default)]
pub struct ChainedCredentials {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl ChainedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl CredentialSource for ChainedCredentials {
    fn credential_for(&self, host: &str) -> Result<Credential> {
        for source in &self.sources {
            let credential = source.credential_for(host).map_err(|e| match e {
                auth @ ContError::AuthError { .. } => auth,
                other => ContError::AuthError {
                    registry: host.to_string(),
                    message: other.to_string(),
                },
            })?;
            if !credential.is_anonymous() {
                return Ok(credential);
            }
        }
        Ok(Credential::Anonymous)
    }
}

/// Normalize registry names (e.g., "docker.io" and "index.docker.io" → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}
