//! Content-addressable blob store laid out as an OCI image layout.
//!
//! ```text
//! store_dir/
//! ├── oci-layout            (layout marker)
//! ├── index.json            (tagged references)
//! ├── ingest/               (in-progress writes)
//! └── blobs/sha256/<hex>    (manifests, configs, layers)
//! ```
//!
//! Blobs are immutable once published. A write lands in `ingest/` under a
//! unique name and is published with a hard link, which fails if the target
//! already exists, so concurrent writers of one digest never overwrite each
//! other and readers never see a partial blob.

use std::path::{Path, PathBuf};

use cont_core::error::{ContError, Result};
use tokio::sync::Mutex;

use super::digest::Digest;
use super::manifest::{Descriptor, ImageIndex, REF_NAME_ANNOTATION};
use super::reference::ImageReference;

const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Disk-backed content-addressable store.
pub struct ContentStore {
    /// Root of the OCI image layout
    root: PathBuf,
    /// Serializes read-modify-write cycles of `index.json`
    index_lock: Mutex<()>,
}

impl ContentStore {
    /// Open (or initialize) a store at `root`.
    ///
    /// Leftovers in `ingest/` belong to writes that never completed and are
    /// removed.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [root.join("blobs").join("sha256"), root.join("ingest")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ContError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create store directory {}: {}", dir.display(), e),
                ))
            })?;
        }

        let swept = sweep_ingest(&root.join("ingest"))?;
        if swept > 0 {
            tracing::info!(root = %root.display(), files = swept, "Removed incomplete writes");
        }

        let layout = root.join("oci-layout");
        if !layout.exists() {
            std::fs::write(&layout, OCI_LAYOUT_CONTENT)?;
        }
        let index = root.join("index.json");
        if !index.exists() {
            std::fs::write(&index, serde_json::to_vec_pretty(&ImageIndex::empty())?)?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            index_lock: Mutex::new(()),
        })
    }

    /// Root directory of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for a digest (whether or not it exists).
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    /// Check whether a blob is present.
    pub async fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?)
    }

    /// Store bytes under their digest.
    ///
    /// Returns `true` if this call published the blob and `false` if it was
    /// already present. Bytes that do not hash to `digest` are rejected with
    /// an integrity error and nothing is written.
    pub async fn put(&self, digest: &Digest, bytes: &[u8]) -> Result<bool> {
        let actual = Digest::of(bytes);
        if actual != *digest {
            return Err(ContError::IntegrityError {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let target = self.blob_path(digest);
        if tokio::fs::try_exists(&target).await? {
            return Ok(false);
        }

        let ingest = self
            .root
            .join("ingest")
            .join(format!("{}-{}", digest.hex(), uuid::Uuid::new_v4()));
        let published = self.publish(&ingest, &target, bytes).await;
        // The ingest file is only a staging name; the published link keeps the data.
        let _ = tokio::fs::remove_file(&ingest).await;
        let published = published?;

        tracing::debug!(
            digest = %digest,
            size = bytes.len(),
            published,
            "Stored blob"
        );
        Ok(published)
    }

    async fn publish(&self, ingest: &Path, target: &Path, bytes: &[u8]) -> Result<bool> {
        let mut file = tokio::fs::File::create(ingest).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
        file.sync_all().await?;
        drop(file);

        match tokio::fs::hard_link(ingest, target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a blob.
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ContError::NotFoundError(format!("blob {}", digest)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record `reference` as pointing at `descriptor` in `index.json`.
    ///
    /// Replaces any previous entry for the same reference.
    pub async fn tag(&self, reference: &ImageReference, descriptor: &Descriptor) -> Result<()> {
        let name = reference.full_reference();
        let _guard = self.index_lock.lock().await;

        let mut index = self.read_index().await?;
        index
            .manifests
            .retain(|entry| entry.annotations.get(REF_NAME_ANNOTATION) != Some(&name));

        let mut entry = descriptor.clone();
        entry
            .annotations
            .insert(REF_NAME_ANNOTATION.to_string(), name.clone());
        index.manifests.push(entry);

        self.write_index(&index).await?;
        tracing::debug!(reference = %name, digest = %descriptor.digest, "Tagged image");
        Ok(())
    }

    /// Resolve a reference without touching the network.
    ///
    /// Digest references resolve whenever the blob is present; tag references
    /// need an `index.json` entry whose blob is present.
    pub async fn resolve_local(&self, reference: &ImageReference) -> Result<Option<Descriptor>> {
        let name = reference.full_reference();
        let index = self.read_index().await?;

        let found = index.manifests.into_iter().find(|entry| {
            entry.annotations.get(REF_NAME_ANNOTATION) == Some(&name)
                || reference.digest.as_ref() == Some(&entry.digest)
        });

        match found {
            Some(descriptor) => {
                let present = self.has(&descriptor.digest).await?;
                Ok(present.then_some(descriptor))
            }
            None => Ok(None),
        }
    }

    /// All tagged descriptors.
    pub async fn list(&self) -> Result<Vec<Descriptor>> {
        Ok(self.read_index().await?.manifests)
    }

    async fn read_index(&self) -> Result<ImageIndex> {
        let path = self.root.join("index.json");
        match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                ContError::SerializationError(format!(
                    "Failed to parse store index {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageIndex::empty()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write index atomically (write tmp, rename).
    async fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let path = self.root.join("index.json");
        let tmp_path = self.root.join(format!("index.json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(index)?).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

/// Remove every entry of the ingest directory. Returns how many were removed.
fn sweep_ingest(ingest: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(ingest)? {
        let path = entry?.path();
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ContError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to remove {}: {}", path.display(), e),
                )))
            }
        }
    }
    Ok(removed)
}
