//! Process-wide daemon state.
//!
//! Built once at startup and shared by every connection: the configuration
//! and the image puller (which owns the content store handle).

use std::sync::Arc;

use cont_core::config::{DaemonConfig, RegistryConfig};
use cont_core::error::{ContError, Result};
use cont_runtime::oci::{
    ChainedCredentials, ContentStore, CredentialSource, CredentialStore,
    DockerConfigCredentials, EnvCredentials, ImagePuller, ImageReference, OciTransport, Platform,
    RegistryClient, RegistryTransport, RetryPolicy,
};

/// Shared state for the control plane.
pub struct DaemonContext {
    pub config: DaemonConfig,
    pub puller: Arc<ImagePuller>,
}

impl DaemonContext {
    /// Build the production context: registry access over the network with
    /// credentials from the configured sources.
    pub fn from_config(config: DaemonConfig) -> Result<Self> {
        let transport = Arc::new(OciTransport::new(&config.registry));
        let credentials = Arc::new(credential_chain(&config.registry)?);
        Self::with_transport(config, transport, credentials)
    }

    /// Build a context around a specific registry transport.
    pub fn with_transport(
        config: DaemonConfig,
        transport: Arc<dyn RegistryTransport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        config.validate()?;
        ImageReference::parse(&config.default_image).map_err(|e| {
            ContError::ConfigError(format!(
                "default_image '{}' is not a valid reference: {}",
                config.default_image, e
            ))
        })?;

        let store = Arc::new(ContentStore::open(&config.store_dir)?);
        let client = RegistryClient::new(transport, credentials, RetryPolicy::from(&config.retry));
        let puller = ImagePuller::new(store, client).with_platform(platform(&config.registry));

        tracing::debug!(
            store = %config.store_dir.display(),
            os = %puller.platform().os,
            architecture = %puller.platform().architecture,
            "Daemon context ready"
        );

        Ok(Self {
            config,
            puller: Arc::new(puller),
        })
    }
}

/// Configured credential file, then Docker config, then environment.
fn credential_chain(registry: &RegistryConfig) -> Result<ChainedCredentials> {
    let mut chain = ChainedCredentials::new();

    match &registry.credentials_file {
        Some(path) => chain = chain.with(CredentialStore::new(path.clone())),
        None => {
            if let Ok(store) = CredentialStore::default_path() {
                chain = chain.with(store);
            }
        }
    }

    match &registry.docker_config {
        Some(path) => chain = chain.with(DockerConfigCredentials::new(path.clone())),
        None => {
            if let Some(docker) = DockerConfigCredentials::default_path() {
                chain = chain.with(docker);
            }
        }
    }

    Ok(chain.with(EnvCredentials))
}

/// Target platform: host Linux unless overridden.
fn platform(registry: &RegistryConfig) -> Platform {
    let mut platform = Platform::host_linux();
    if let Some(ref os) = registry.platform_os {
        platform.os = os.clone();
    }
    if let Some(ref arch) = registry.platform_arch {
        platform.architecture = arch.clone();
    }
    platform
}

#[cfg(test)]
mod tests {
    use super::*;
    use cont_runtime::oci::{AnonymousCredentials, MemoryTransport};
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> DaemonConfig {
        DaemonConfig {
            store_dir: tmp.path().join("store"),
            socket_path: tmp.path().join("cont.sock"),
            ..Default::default()
        }
    }

    #[test]
    fn test_with_transport_opens_store() {
        let tmp = TempDir::new().unwrap();
        let ctx = DaemonContext::with_transport(
            config(&tmp),
            Arc::new(MemoryTransport::new()),
            Arc::new(AnonymousCredentials),
        )
        .unwrap();
        assert!(tmp.path().join("store/oci-layout").is_file());
        assert_eq!(ctx.puller.store().root(), tmp.path().join("store"));
    }

    #[test]
    fn test_invalid_default_image() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.default_image = "nginx@sha256:nothex".to_string();
        let err = DaemonContext::with_transport(
            cfg,
            Arc::new(MemoryTransport::new()),
            Arc::new(AnonymousCredentials),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ContError::ConfigError(_)));
    }

    #[test]
    fn test_platform_override() {
        let registry = RegistryConfig {
            platform_arch: Some("arm64".to_string()),
            ..Default::default()
        };
        let p = platform(&registry);
        assert_eq!(p.architecture, "arm64");
        assert_eq!(p.os, "linux");
    }

    #[test]
    fn test_credential_chain_uses_configured_files() {
        let tmp = TempDir::new().unwrap();
        let store_path = tmp.path().join("credentials.json");
        std::fs::write(
            &store_path,
            r#"{"registries": {"ghcr.io": {"username": "user", "password": "pass"}}}"#,
        )
        .unwrap();
        let registry = RegistryConfig {
            credentials_file: Some(store_path),
            docker_config: Some(tmp.path().join("docker.json")),
            ..Default::default()
        };

        let chain = credential_chain(&registry).unwrap();
        assert_eq!(chain.len(), 3);
        assert!(!chain.credential_for("ghcr.io").unwrap().is_anonymous());
    }
}
