//! Image acquisition pipeline.
//!
//! Resolves a reference, copies the manifest, config and layers into the
//! content store (skipping digests already present), parses the manifest and
//! reports the layer inventory.

use std::path::PathBuf;
use std::sync::Arc;

use cont_core::error::{ContError, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::credentials::Credential;
use super::digest::Digest;
use super::manifest::{is_index_media_type, Descriptor, ImageIndex, Manifest, Platform};
use super::reference::ImageReference;
use super::registry::RegistryClient;
use super::store::ContentStore;

/// Outcome of a successful pull.
#[derive(Debug, Clone)]
pub struct PullResult {
    /// OCI image layout holding the manifest and blobs
    pub output_location: PathBuf,
    /// Reference that was pulled
    pub reference: ImageReference,
    /// Top-level descriptor the reference resolved to (manifest or index)
    pub descriptor: Descriptor,
    /// Descriptor of the image manifest that was parsed
    pub manifest_descriptor: Descriptor,
    pub manifest: Manifest,
    /// Blobs fetched from the registry by this pull
    pub transferred: usize,
}

impl PullResult {
    /// Layers in application order.
    pub fn layers(&self) -> &[Descriptor] {
        &self.manifest.layers
    }
}

/// Pulls images from a registry into a shared content store.
pub struct ImagePuller {
    store: Arc<ContentStore>,
    client: RegistryClient,
    platform: Platform,
    /// One lock per digest being copied
    inflight: DashMap<Digest, Arc<Mutex<()>>>,
}

impl ImagePuller {
    /// Create a puller selecting Linux images for the host architecture.
    pub fn new(store: Arc<ContentStore>, client: RegistryClient) -> Self {
        Self {
            store,
            client,
            platform: Platform::host_linux(),
            inflight: DashMap::new(),
        }
    }

    /// Select a different platform from multi-platform images.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Check whether a reference can be served from the store alone.
    pub async fn is_present(&self, reference: &ImageReference) -> Result<bool> {
        Ok(self.store.resolve_local(reference).await?.is_some())
    }

    /// Pull an image into the store.
    ///
    /// Blobs stored before a failure are kept.
    pub async fn pull(&self, reference: &ImageReference) -> Result<PullResult> {
        tracing::info!(reference = %reference, "Pulling image");

        let credential = self.client.authenticate(reference).await?;
        let top = self.client.resolve(reference, &credential).await?;
        tracing::debug!(
            reference = %reference,
            digest = %top.digest,
            media_type = %top.media_type,
            "Resolved reference"
        );

        let mut transferred = 0;
        self.copy(reference, &top, &credential, &mut transferred)
            .await?;

        let manifest_descriptor = if is_index_media_type(&top.media_type) {
            let index = ImageIndex::parse(&self.store.get(&top.digest).await?)?;
            let entry = index.select(&self.platform).cloned().ok_or_else(|| {
                ContError::ManifestParseError(format!(
                    "No manifest for {}/{} in image index {}",
                    self.platform.os, self.platform.architecture, top.digest
                ))
            })?;
            self.copy(reference, &entry, &credential, &mut transferred)
                .await?;
            entry
        } else {
            top.clone()
        };

        let manifest = Manifest::parse(&self.store.get(&manifest_descriptor.digest).await?)?;

        self.copy(reference, &manifest.config, &credential, &mut transferred)
            .await?;
        for layer in &manifest.layers {
            self.copy(reference, layer, &credential, &mut transferred)
                .await?;
        }

        self.store.tag(reference, &top).await?;

        for (index, layer) in manifest.layers.iter().enumerate() {
            tracing::info!(
                index,
                digest = %layer.digest,
                size = layer.size,
                media_type = %layer.media_type,
                "Layer"
            );
        }
        tracing::info!(
            reference = %reference,
            digest = %manifest_descriptor.digest,
            layers = manifest.layers.len(),
            size = manifest.total_size(),
            transferred,
            output = %self.store.root().display(),
            "Image pulled successfully"
        );

        Ok(PullResult {
            output_location: self.store.root().to_path_buf(),
            reference: reference.clone(),
            descriptor: top,
            manifest_descriptor,
            manifest,
            transferred,
        })
    }

    /// Ensure a descriptor's bytes are in the store, fetching them if absent.
    ///
    /// Concurrent copies of one digest are serialized; later callers find the
    /// blob already stored.
    async fn copy(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        credential: &Credential,
        transferred: &mut usize,
    ) -> Result<()> {
        let lock = self
            .inflight
            .entry(descriptor.digest.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock().await;
        let result = self.copy_locked(reference, descriptor, credential).await;
        drop(guard);
        // Map entry plus our clone: nobody else is waiting on this digest.
        self.inflight
            .remove_if(&descriptor.digest, |_, l| Arc::strong_count(l) <= 2);

        if result? {
            *transferred += 1;
        }
        Ok(())
    }

    async fn copy_locked(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        credential: &Credential,
    ) -> Result<bool> {
        if self.store.has(&descriptor.digest).await? {
            tracing::debug!(digest = %descriptor.digest, "Blob already present, skipping");
            return Ok(false);
        }

        tracing::debug!(
            digest = %descriptor.digest,
            size = descriptor.size,
            media_type = %descriptor.media_type,
            "Fetching blob"
        );
        let bytes = self.client.fetch(reference, descriptor, credential).await?;
        self.store.put(&descriptor.digest, &bytes).await?;
        Ok(true)
    }
}
