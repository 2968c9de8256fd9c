//! OCI image acquisition.
//!
//! Pulls images from a registry into a local content-addressable store laid
//! out as an OCI image layout:
//!
//! ```text
//! ImagePuller (pipeline)
//!   ├── RegistryClient ── credentials, retry, digest checks
//!   │     └── RegistryTransport ── OciTransport (MemoryTransport with `test-util`)
//!   └── ContentStore ── oci-layout, index.json, blobs/sha256/<hex>
//! ```

pub mod credentials;
pub mod digest;
pub mod manifest;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod retry;
pub mod store;

pub use credentials::{
    AnonymousCredentials, ChainedCredentials, Credential, CredentialSource, CredentialStore,
    DockerConfigCredentials, EnvCredentials,
};
pub use digest::Digest;
pub use manifest::{Descriptor, ImageIndex, Manifest, Platform};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryTransport;
pub use pull::{ImagePuller, PullResult};
pub use reference::ImageReference;
pub use registry::{OciTransport, RegistryClient, RegistryTransport, TransportError};
pub use retry::RetryPolicy;
pub use store::ContentStore;
