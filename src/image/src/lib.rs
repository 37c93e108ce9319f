//! rootpull image engine.
//!
//! Pulls container images from OCI/Docker v2-compatible registries and
//! materializes their filesystem into a directory that can be booted with a
//! container-spawn tool. The crate covers the narrow path of "fetch layers,
//! merge them correctly, stop":
//!
//! - [`ImageUrl`] parses user-typed references into canonical form.
//! - [`ProviderRegistry`] resolves a registry URL to an authenticated
//!   HTTP client.
//! - [`Remote`] negotiates manifests and downloads blobs.
//! - [`Store`] caches layer blobs by digest and extracts them onto
//!   destinations, recording what it did for later purging.
//!
//! ```no_run
//! use rootpull_image::{default_registry, ImageUrl, Remote, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn pull() -> rootpull_core::Result<()> {
//! let cancel = CancellationToken::new();
//! let registry = default_registry();
//!
//! let url = ImageUrl::parse("ubuntu:22.04")?;
//! let remote = Remote::new(&registry, url, "", cancel.clone()).await?;
//!
//! let store = Store::new("/var/cache/rootpull");
//! store.extract(&cancel, &remote, std::path::Path::new("/var/roots/ubuntu")).await?;
//! # Ok(())
//! # }
//! ```

pub mod lock;
pub mod manifest;
pub mod provider;
pub mod providers;
pub mod remote;
pub mod store;
pub mod untar;
pub mod url;

// Re-export the common surface
pub use lock::{PathLock, PathLockGuard};
pub use manifest::{LayerDescriptor, Manifest, ManifestList, Platform};
pub use provider::{default_registry, Provider, ProviderRegistry};
pub use remote::Remote;
pub use store::Store;
pub use url::ImageUrl;
