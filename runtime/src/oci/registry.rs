//! OCI registry client.
//!
//! Network access goes through a [`RegistryTransport`]. The production
//! transport, [`OciTransport`], speaks the distribution API via the
//! `oci-distribution` crate. [`RegistryClient`] layers credential lookup,
//! retry and digest verification on top of whichever transport it is given.

use std::sync::Arc;

use async_trait::async_trait;
use cont_core::config::RegistryConfig;
use cont_core::error::{ContError, Result};
use dashmap::DashMap;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::credentials::{Credential, CredentialSource};
use super::digest::Digest;
use super::manifest::{
    is_index_media_type, is_manifest_media_type, sniff_media_type, Descriptor,
    ACCEPTED_MANIFEST_MEDIA_TYPES,
};
use super::reference::ImageReference;
use super::retry::RetryPolicy;

/// Resolved manifest bodies kept for the following fetch.
const MAX_RESOLVED_BODIES: usize = 64;

/// Failure reported by a registry transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Reference, tag or blob does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Registry rejected the credential
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Timeout, connection failure, 5xx or 429
    #[error("transient failure: {0}")]
    Transient(String),

    /// Any other failure; retrying will not help
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Classify an HTTP status code.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = format!("HTTP {}: {}", code, message.into());
        match code {
            401 | 403 => TransportError::Unauthorized(message),
            404 => TransportError::NotFound(message),
            408 | 429 => TransportError::Transient(message),
            500..=599 => TransportError::Transient(message),
            _ => TransportError::Fatal(message),
        }
    }
}

impl From<OciDistributionError> for TransportError {
    fn from(err: OciDistributionError) -> Self {
        let message = err.to_string();
        match err {
            OciDistributionError::RequestError(_) => TransportError::Transient(message),
            OciDistributionError::ServerError { code, .. } => {
                TransportError::from_status(code, message)
            }
            OciDistributionError::UnauthorizedError { .. }
            | OciDistributionError::AuthenticationFailure(_) => {
                TransportError::Unauthorized(message)
            }
            OciDistributionError::ImageManifestNotFoundError(_) => {
                TransportError::NotFound(message)
            }
            _ if message.contains("MANIFEST_UNKNOWN")
                || message.contains("NAME_UNKNOWN")
                || message.contains("BLOB_UNKNOWN") =>
            {
                TransportError::NotFound(message)
            }
            _ if message.contains("TOOMANYREQUESTS") => TransportError::Transient(message),
            _ => TransportError::Fatal(message),
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Minimal registry operations the pull pipeline needs.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Establish a session for `reference`'s repository.
    async fn authenticate(
        &self,
        reference: &ImageReference,
        credential: &Credential,
    ) -> TransportResult<()>;

    /// Resolve a tag or digest to the descriptor of its top-level manifest.
    async fn resolve(
        &self,
        reference: &ImageReference,
        credential: &Credential,
    ) -> TransportResult<Descriptor>;

    /// Fetch the bytes of a manifest or blob in `reference`'s repository.
    async fn fetch(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        credential: &Credential,
    ) -> TransportResult<Vec<u8>>;
}

/// Registry transport backed by `oci-distribution`.
pub struct OciTransport {
    client: Client,
    /// Manifest bodies downloaded while resolving, handed out by the next fetch
    resolved: DashMap<Digest, Vec<u8>>,
}

impl OciTransport {
    /// Create a transport. Hosts in `config.insecure` are reached over plain HTTP.
    pub fn new(config: &RegistryConfig) -> Self {
        let protocol = if config.insecure.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(config.insecure.clone())
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        Self {
            client,
            resolved: DashMap::new(),
        }
    }

    fn to_oci_reference(reference: &ImageReference) -> Reference {
        match &reference.digest {
            Some(digest) => Reference::with_digest(
                reference.registry.clone(),
                reference.repository.clone(),
                digest.to_string(),
            ),
            None => Reference::with_tag(
                reference.registry.clone(),
                reference.repository.clone(),
                reference.target(),
            ),
        }
    }

    fn to_oci_descriptor(descriptor: &Descriptor) -> TransportResult<OciDescriptor> {
        let size = i64::try_from(descriptor.size).map_err(|_| {
            TransportError::Fatal(format!(
                "Declared size {} of {} is out of range",
                descriptor.size, descriptor.digest
            ))
        })?;
        Ok(OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.to_string(),
            size,
            urls: None,
            annotations: None,
        })
    }

    fn to_oci_auth(credential: &Credential) -> RegistryAuth {
        match credential {
            Credential::Anonymous => RegistryAuth::Anonymous,
            Credential::Basic { username, secret } => {
                RegistryAuth::Basic(username.clone(), secret.clone())
            }
        }
    }
}

#[async_trait]
impl RegistryTransport for OciTransport {
    async fn authenticate(
        &self,
        reference: &ImageReference,
        credential: &Credential,
    ) -> TransportResult<()> {
        let oci_ref = Self::to_oci_reference(reference);
        self.client
            .auth(&oci_ref, &Self::to_oci_auth(credential), RegistryOperation::Pull)
            .await?;
        Ok(())
    }

    async fn resolve(
        &self,
        reference: &ImageReference,
        credential: &Credential,
    ) -> TransportResult<Descriptor> {
        let oci_ref = Self::to_oci_reference(reference);
        let (body, _digest) = self
            .client
            .pull_manifest_raw(
                &oci_ref,
                &Self::to_oci_auth(credential),
                ACCEPTED_MANIFEST_MEDIA_TYPES,
            )
            .await?;

        let media_type = sniff_media_type(&body).ok_or_else(|| {
            TransportError::Fatal(format!("Registry returned an unrecognised manifest for {}", reference))
        })?;
        let descriptor = Descriptor::for_bytes(media_type, &body);

        // Bodies of manifests that were already stored are never fetched.
        if self.resolved.len() >= MAX_RESOLVED_BODIES {
            self.resolved.clear();
        }
        self.resolved.insert(descriptor.digest.clone(), body);
        Ok(descriptor)
    }

    async fn fetch(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        credential: &Credential,
    ) -> TransportResult<Vec<u8>> {
        if let Some((_, body)) = self.resolved.remove(&descriptor.digest) {
            return Ok(body);
        }

        let auth = Self::to_oci_auth(credential);
        let by_digest = Reference::with_digest(
            reference.registry.clone(),
            reference.repository.clone(),
            descriptor.digest.to_string(),
        );

        if is_manifest_media_type(&descriptor.media_type)
            || is_index_media_type(&descriptor.media_type)
        {
            let (body, _) = self
                .client
                .pull_manifest_raw(&by_digest, &auth, &[descriptor.media_type.as_str()])
                .await?;
            return Ok(body);
        }

        let oci_descriptor = Self::to_oci_descriptor(descriptor)?;

        // Blob requests reuse the token obtained for the repository.
        self.client
            .auth(&by_digest, &auth, RegistryOperation::Pull)
            .await?;
        // The declared size is unverified; the buffer grows with the body.
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&by_digest, &oci_descriptor, &mut data)
            .await?;
        Ok(data)
    }
}

/// Registry client: credentials, retry and integrity checks over a transport.
#[derive(Clone)]
pub struct RegistryClient {
    transport: Arc<dyn RegistryTransport>,
    credentials: Arc<dyn CredentialSource>,
    retry: RetryPolicy,
}

impl RegistryClient {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        credentials: Arc<dyn CredentialSource>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            credentials,
            retry,
        }
    }

    /// Look up the credential for the reference's registry and open a session.
    ///
    /// Returns the credential to pass to [`resolve`](Self::resolve) and
    /// [`fetch`](Self::fetch).
    pub async fn authenticate(&self, reference: &ImageReference) -> Result<Credential> {
        let credential = self
            .credentials
            .credential_for(&reference.registry)
            .map_err(|e| match e {
                auth @ ContError::AuthError { .. } => auth,
                other => ContError::AuthError {
                    registry: reference.registry.clone(),
                    message: other.to_string(),
                },
            })?;

        self.retry
            .retry("authenticate", TransportError::is_retryable, || {
                self.transport.authenticate(reference, &credential)
            })
            .await
            .map_err(|e| match e {
                TransportError::Transient(message) => ContError::ResolutionError {
                    reference: reference.to_string(),
                    message: format!("registry unreachable: {}", message),
                },
                other => ContError::AuthError {
                    registry: reference.registry.clone(),
                    message: other.to_string(),
                },
            })?;

        tracing::debug!(
            registry = %reference.registry,
            anonymous = credential.is_anonymous(),
            "Authenticated to registry"
        );
        Ok(credential)
    }

    /// Resolve a reference to its top-level descriptor.
    ///
    /// A digest-pinned reference must resolve to exactly that digest.
    pub async fn resolve(
        &self,
        reference: &ImageReference,
        credential: &Credential,
    ) -> Result<Descriptor> {
        let descriptor = self
            .retry
            .retry("resolve", TransportError::is_retryable, || {
                self.transport.resolve(reference, credential)
            })
            .await
            .map_err(|e| match e {
                TransportError::Unauthorized(message) => ContError::AuthError {
                    registry: reference.registry.clone(),
                    message,
                },
                other => ContError::ResolutionError {
                    reference: reference.to_string(),
                    message: other.to_string(),
                },
            })?;

        if let Some(ref pinned) = reference.digest {
            if *pinned != descriptor.digest {
                return Err(ContError::IntegrityError {
                    expected: pinned.to_string(),
                    actual: descriptor.digest.to_string(),
                });
            }
        }
        Ok(descriptor)
    }

    /// Fetch the bytes behind a descriptor, verified against its size and digest.
    ///
    /// Bytes that fail verification are discarded and reported as an
    /// integrity error; they are never returned.
    pub async fn fetch(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        credential: &Credential,
    ) -> Result<Vec<u8>> {
        let bytes = self
            .retry
            .retry("fetch", TransportError::is_retryable, || {
                self.transport.fetch(reference, descriptor, credential)
            })
            .await
            .map_err(|e| match e {
                TransportError::Unauthorized(message) => ContError::AuthError {
                    registry: reference.registry.clone(),
                    message,
                },
                other => ContError::FetchError {
                    target: descriptor.digest.to_string(),
                    message: other.to_string(),
                },
            })?;

        let actual = Digest::of(&bytes);
        if actual != descriptor.digest {
            return Err(ContError::IntegrityError {
                expected: descriptor.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        if bytes.len() as u64 != descriptor.size {
            return Err(ContError::IntegrityError {
                expected: format!("{} ({} bytes)", descriptor.digest, descriptor.size),
                actual: format!("{} bytes", bytes.len()),
            });
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::credentials::AnonymousCredentials;
    use crate::oci::manifest::OCI_MANIFEST_MEDIA_TYPE;
    use crate::oci::memory::{MemoryTransport, LAYER_MEDIA_TYPE};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2,
        }
    }

    fn client(transport: Arc<MemoryTransport>) -> RegistryClient {
        RegistryClient::new(transport, Arc::new(AnonymousCredentials), fast_retry())
    }

    struct BrokenSource;

    impl CredentialSource for BrokenSource {
        fn credential_for(&self, _host: &str) -> Result<Credential> {
            Err(ContError::Other("helper crashed".to_string()))
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(TransportError::from_status(503, "").is_retryable());
        assert!(TransportError::from_status(429, "").is_retryable());
        assert!(matches!(
            TransportError::from_status(404, ""),
            TransportError::NotFound(_)
        ));
        assert!(matches!(
            TransportError::from_status(401, ""),
            TransportError::Unauthorized(_)
        ));
        assert!(!TransportError::from_status(400, "").is_retryable());
    }

    #[tokio::test]
    async fn test_resolve_and_fetch() {
        let transport = Arc::new(MemoryTransport::new());
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();
        let top = transport.publish_image(&reference, &[b"layer-a", b"layer-b"]);

        let client = client(transport.clone());
        let credential = client.authenticate(&reference).await.unwrap();
        let descriptor = client.resolve(&reference, &credential).await.unwrap();
        assert_eq!(descriptor.digest, top.digest);

        let bytes = client.fetch(&reference, &descriptor, &credential).await.unwrap();
        assert!(descriptor.digest.verify(&bytes));
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_tag() {
        let transport = Arc::new(MemoryTransport::new());
        let reference = ImageReference::parse("example.registry/library/app:missing").unwrap();
        let err = client(transport)
            .resolve(&reference, &Credential::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, ContError::ResolutionError { .. }));
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_failures() {
        let transport = Arc::new(MemoryTransport::new());
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();
        let top = transport.publish_image(&reference, &[b"layer"]);
        transport.fail_next_fetches(vec![
            TransportError::Transient("503".to_string()),
            TransportError::Transient("timeout".to_string()),
        ]);

        let bytes = client(transport.clone())
            .fetch(&reference, &top, &Credential::Anonymous)
            .await
            .unwrap();
        assert!(top.digest.verify(&bytes));
        assert_eq!(transport.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_budget() {
        let transport = Arc::new(MemoryTransport::new());
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();
        let top = transport.publish_image(&reference, &[b"layer"]);
        transport.fail_next_fetches(vec![TransportError::Transient("503".to_string()); 5]);

        let err = client(transport.clone())
            .fetch(&reference, &top, &Credential::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, ContError::FetchError { .. }));
        assert_eq!(transport.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_permanent_failure_not_retried() {
        let transport = Arc::new(MemoryTransport::new());
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();
        let top = transport.publish_image(&reference, &[b"layer"]);
        transport.fail_next_fetches(vec![TransportError::Fatal("400 bad request".to_string())]);

        let err = client(transport.clone())
            .fetch(&reference, &top, &Credential::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, ContError::FetchError { .. }));
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_detects_corruption() {
        let transport = Arc::new(MemoryTransport::new());
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();
        let top = transport.publish_image(&reference, &[b"layer"]);
        transport.corrupt(&top.digest);

        let err = client(transport)
            .fetch(&reference, &top, &Credential::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, ContError::IntegrityError { .. }));
    }

    #[tokio::test]
    async fn test_credential_source_failure_is_auth_error() {
        let transport = Arc::new(MemoryTransport::new());
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();
        let client = RegistryClient::new(transport, Arc::new(BrokenSource), fast_retry());

        match client.authenticate(&reference).await.unwrap_err() {
            ContError::AuthError { registry, .. } => assert_eq!(registry, "example.registry"),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Answers every resolve with a manifest other than the one asked for.
    struct SwappedManifest;

    #[async_trait]
    impl RegistryTransport for SwappedManifest {
        async fn authenticate(&self, _: &ImageReference, _: &Credential) -> TransportResult<()> {
            Ok(())
        }

        async fn resolve(
            &self,
            _: &ImageReference,
            _: &Credential,
        ) -> TransportResult<Descriptor> {
            Ok(Descriptor::for_bytes(OCI_MANIFEST_MEDIA_TYPE, br#"{"schemaVersion":2}"#))
        }

        async fn fetch(
            &self,
            _: &ImageReference,
            descriptor: &Descriptor,
            _: &Credential,
        ) -> TransportResult<Vec<u8>> {
            Err(TransportError::NotFound(descriptor.digest.to_string()))
        }
    }

    fn layer_descriptor(size: u64) -> Descriptor {
        Descriptor {
            size,
            ..Descriptor::for_bytes(LAYER_MEDIA_TYPE, b"layer")
        }
    }

    #[tokio::test]
    async fn test_pinned_digest_mismatch_is_integrity_error() {
        let pinned = Digest::of(b"the manifest we asked for");
        let reference =
            ImageReference::parse(&format!("example.registry/library/app@{}", pinned)).unwrap();
        let client = RegistryClient::new(
            Arc::new(SwappedManifest),
            Arc::new(AnonymousCredentials),
            fast_retry(),
        );

        match client.resolve(&reference, &Credential::Anonymous).await.unwrap_err() {
            ContError::IntegrityError { expected, .. } => assert_eq!(expected, pinned.to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_to_oci_reference_with_tag() {
        let reference = ImageReference::parse("ghcr.io/cont/app:v0.1.0").unwrap();
        let oci_ref = OciTransport::to_oci_reference(&reference);
        assert_eq!(oci_ref.to_string(), "ghcr.io/cont/app:v0.1.0");
    }

    #[test]
    fn test_to_oci_reference_with_digest() {
        let digest = Digest::of(b"manifest");
        let reference = ImageReference::parse(&format!("ghcr.io/cont/app@{}", digest)).unwrap();
        let oci_ref = OciTransport::to_oci_reference(&reference);
        assert_eq!(oci_ref.digest(), Some(digest.as_str()));
        assert_eq!(oci_ref.repository(), "cont/app");
    }

    #[test]
    fn test_to_oci_reference_default_tag() {
        let reference = ImageReference::parse("nginx").unwrap();
        let oci_ref = OciTransport::to_oci_reference(&reference);
        assert_eq!(oci_ref.registry(), "docker.io");
        assert_eq!(oci_ref.tag(), Some("latest"));
    }

    #[test]
    fn test_to_oci_auth() {
        assert!(matches!(
            OciTransport::to_oci_auth(&Credential::Anonymous),
            RegistryAuth::Anonymous
        ));
        match OciTransport::to_oci_auth(&Credential::basic("user", "pass")) {
            RegistryAuth::Basic(user, pass) => {
                assert_eq!(user, "user");
                assert_eq!(pass, "pass");
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[test]
    fn test_oci_distribution_error_classification() {
        let server = |code| OciDistributionError::ServerError {
            code,
            url: "https://example.registry/v2/".to_string(),
            message: "boom".to_string(),
        };
        assert!(TransportError::from(server(503)).is_retryable());
        assert!(TransportError::from(server(429)).is_retryable());
        assert!(matches!(
            TransportError::from(server(404)),
            TransportError::NotFound(_)
        ));
        assert!(matches!(
            TransportError::from(server(400)),
            TransportError::Fatal(_)
        ));
        assert!(matches!(
            TransportError::from(OciDistributionError::UnauthorizedError {
                url: "https://example.registry/v2/".to_string(),
            }),
            TransportError::Unauthorized(_)
        ));
        assert!(matches!(
            TransportError::from(OciDistributionError::AuthenticationFailure("denied".to_string())),
            TransportError::Unauthorized(_)
        ));
        assert!(matches!(
            TransportError::from(OciDistributionError::ImageManifestNotFoundError(
                "app:latest".to_string()
            )),
            TransportError::NotFound(_)
        ));
        assert!(matches!(
            TransportError::from(OciDistributionError::GenericError(Some(
                "BLOB_UNKNOWN: blob unknown to registry".to_string()
            ))),
            TransportError::NotFound(_)
        ));
        assert!(TransportError::from(OciDistributionError::GenericError(Some(
            "TOOMANYREQUESTS: slow down".to_string()
        )))
        .is_retryable());
        assert!(!TransportError::from(OciDistributionError::GenericError(None)).is_retryable());
    }

    #[test]
    fn test_oci_descriptor_size_conversion() {
        let converted = OciTransport::to_oci_descriptor(&layer_descriptor(5)).unwrap();
        assert_eq!(converted.size, 5);

        let err = OciTransport::to_oci_descriptor(&layer_descriptor(u64::MAX)).unwrap_err();
        assert!(matches!(err, TransportError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_oversized_blob_is_fetch_error() {
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();
        let client = RegistryClient::new(
            Arc::new(OciTransport::new(&RegistryConfig::default())),
            Arc::new(AnonymousCredentials),
            fast_retry(),
        );

        // Rejected before any request is made
        let err = client
            .fetch(&reference, &layer_descriptor(u64::MAX), &Credential::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, ContError::FetchError { .. }));
    }

    #[tokio::test]
    async fn test_rejected_credential_is_auth_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.require_credential(Credential::basic("user", "right"));
        let reference = ImageReference::parse("example.registry/library/app:latest").unwrap();

        let err = client(transport).authenticate(&reference).await.unwrap_err();
        assert!(matches!(err, ContError::AuthError { .. }));
    }
}
