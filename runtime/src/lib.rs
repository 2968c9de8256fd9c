//! Cont runtime: image acquisition for the container-control daemon.
//!
//! Resolves image references against OCI registries and copies manifests,
//! configs and layers into a local content-addressable store.

#![allow(clippy::result_large_err)]

pub mod oci;

pub use oci::{
    ContentStore, Credential, CredentialSource, Descriptor, Digest, ImagePuller, ImageReference,
    Manifest, OciTransport, PullResult, RegistryClient, RegistryTransport, RetryPolicy,
};
