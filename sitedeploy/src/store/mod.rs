//! Storage adapters.
//!
//! - [`ArtifactStore`]: append-only storage for intermediate and final
//!   artifacts. Artifacts are immutable and uniquely addressed, so
//!   concurrent writers never need coordination.
//! - [`ContentStore`]: the serving store that sync publishes into.

mod artifact;
mod content;

pub use artifact::{ArtifactStore, ArtifactSummary, FsArtifactStore, InMemoryArtifactStore};
pub use content::{
    ContentStore, DirectoryContentStore, InMemoryContentStore, ObjectMeta, StoredObject,
};

#[cfg(test)]
pub(crate) use content::MockContentStore;

use md5::{Digest, Md5};

/// S3-style ETag: hex MD5 of the body.
#[must_use]
pub fn etag(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}
