//! In-process registry transport.
//!
//! Serves images published into memory through the [`RegistryTransport`]
//! interface. Test support, compiled with the `test-util` feature. Supports
//! failure injection (queued fetch errors, corrupted blobs, required
//! credentials, a per-fetch delay) and counts the fetches it serves.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::credentials::Credential;
use super::digest::Digest;
use super::manifest::{sniff_media_type, Descriptor, OCI_MANIFEST_MEDIA_TYPE};
use super::reference::ImageReference;
use super::registry::{RegistryTransport, TransportError, TransportResult};

pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Registry held entirely in memory.
#[derive(Default)]
pub struct MemoryTransport {
    blobs: DashMap<Digest, Vec<u8>>,
    /// "registry/repository" → tag → manifest digest
    tags: DashMap<String, HashMap<String, Digest>>,
    corrupted: DashMap<Digest, ()>,
    pending_failures: Mutex<VecDeque<TransportError>>,
    required: Mutex<Option<Credential>>,
    fetch_delay: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob and return its descriptor.
    pub fn push_blob(&self, media_type: &str, bytes: &[u8]) -> Descriptor {
        let descriptor = Descriptor::for_bytes(media_type, bytes);
        self.blobs
            .insert(descriptor.digest.clone(), bytes.to_vec());
        descriptor
    }

    /// Point a tag at a manifest digest.
    pub fn tag(&self, reference: &ImageReference, digest: &Digest) {
        self.tags
            .entry(repository_key(reference))
            .or_default()
            .insert(reference.target(), digest.clone());
    }

    /// Publish a single-platform image with the given layers and tag it.
    ///
    /// Returns the manifest descriptor.
    pub fn publish_image(&self, reference: &ImageReference, layers: &[&[u8]]) -> Descriptor {
        let config_body = format!(r#"{{"architecture":"amd64","os":"linux","layers":{}}}"#, layers.len());
        let config = self.push_blob(CONFIG_MEDIA_TYPE, config_body.as_bytes());
        let layer_descriptors: Vec<Descriptor> = layers
            .iter()
            .map(|bytes| self.push_blob(LAYER_MEDIA_TYPE, bytes))
            .collect();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "config": config,
            "layers": layer_descriptors,
        });
        let body = manifest.to_string();
        let descriptor = self.push_blob(OCI_MANIFEST_MEDIA_TYPE, body.as_bytes());
        self.tag(reference, &descriptor.digest);
        descriptor
    }

    /// Queue errors returned by the next fetches, in order.
    pub fn fail_next_fetches(&self, errors: Vec<TransportError>) {
        if let Ok(mut pending) = self.pending_failures.lock() {
            pending.extend(errors);
        }
    }

    /// Serve altered bytes for a digest from now on.
    pub fn corrupt(&self, digest: &Digest) {
        self.corrupted.insert(digest.clone(), ());
    }

    /// Reject every operation that does not present this credential.
    pub fn require_credential(&self, credential: Credential) {
        if let Ok(mut required) = self.required.lock() {
            *required = Some(credential);
        }
    }

    /// Sleep this long inside every fetch.
    pub fn set_fetch_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.fetch_delay.lock() {
            *current = delay;
        }
    }

    /// Number of fetch calls served, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_credential(&self, credential: &Credential) -> TransportResult<()> {
        match self.required.lock() {
            Ok(required) => match required.as_ref() {
                Some(wanted) if wanted != credential => Err(TransportError::Unauthorized(
                    "credential rejected".to_string(),
                )),
                _ => Ok(()),
            },
            Err(_) => Err(TransportError::Fatal("registry state poisoned".to_string())),
        }
    }
}

fn repository_key(reference: &ImageReference) -> String {
    format!("{}/{}", reference.registry, reference.repository)
}

#[async_trait]
impl RegistryTransport for MemoryTransport {
    async fn authenticate(
        &self,
        _reference: &ImageReference,
        credential: &Credential,
    ) -> TransportResult<()> {
        self.check_credential(credential)
    }

    async fn resolve(
        &self,
        reference: &ImageReference,
        credential: &Credential,
    ) -> TransportResult<Descriptor> {
        self.check_credential(credential)?;

        let digest = match &reference.digest {
            Some(digest) => digest.clone(),
            None => self
                .tags
                .get(&repository_key(reference))
                .and_then(|tags| tags.get(&reference.target()).cloned())
                .ok_or_else(|| TransportError::NotFound(format!("manifest unknown: {}", reference)))?,
        };
        let body = self
            .blobs
            .get(&digest)
            .map(|b| b.value().clone())
            .ok_or_else(|| TransportError::NotFound(format!("manifest unknown: {}", digest)))?;
        let media_type = sniff_media_type(&body)
            .ok_or_else(|| TransportError::Fatal(format!("{} is not a manifest", digest)))?;

        Ok(Descriptor::for_bytes(media_type, &body))
    }

    async fn fetch(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
        credential: &Credential,
    ) -> TransportResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = self.fetch_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .pending_failures
            .lock()
            .ok()
            .and_then(|mut pending| pending.pop_front());
        if let Some(err) = queued {
            return Err(err);
        }

        self.check_credential(credential)?;

        let mut bytes = self
            .blobs
            .get(&descriptor.digest)
            .map(|b| b.value().clone())
            .ok_or_else(|| TransportError::NotFound(format!("blob unknown: {}", descriptor.digest)))?;
        if self.corrupted.contains_key(&descriptor.digest) {
            match bytes.first_mut() {
                Some(first) => *first ^= 0xff,
                None => bytes.push(0),
            }
        }
        Ok(bytes)
    }
}
