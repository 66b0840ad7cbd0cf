//! File-based blob storage for cache payloads
//!
//! Blobs are addressed by the integer id of their cache record. Uploads land
//! as independent chunk files keyed by offset, so chunks may arrive out of
//! order, in parallel, or more than once. Finalizing assembles the chunks into
//! the served blob and reports how many bytes it really holds.

mod error;
mod store;

pub use error::{BlobStoreError, Result};
pub use store::BlobStore;
