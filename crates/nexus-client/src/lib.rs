//! Client for a Nexus raw repository used as a remote artifact cache tier
//!
//! Artifacts are stored at `<prefix>/<key>-<version>` inside one repository.
//! Lookups mirror restore-key semantics: the primary key is searched exactly
//! for the requested version, later keys are searched as version-agnostic
//! path prefixes.
//!
//! # Example
//!
//! ```no_run
//! use nexus_client::{Credentials, NexusClient};
//!
//! # async fn example() -> Result<(), nexus_client::NexusError> {
//! let client = NexusClient::new(
//!     "https://nexus.example.com/repository/gh-cache/runners",
//!     Some(Credentials::new("ci", "secret")),
//! )?;
//!
//! let keys = vec!["cargo-abc123".to_string(), "cargo-".to_string()];
//! if let Some(hit) = client.find_cache(&keys, "v1").await? {
//!     println!("{} -> {}", hit.cache_key, hit.archive_location);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod types;

pub use client::NexusClient;
pub use error::{NexusError, Result};
pub use types::{Credentials, RemoteHit, RemoteLocation, SearchAsset, SearchAssetsResponse};
