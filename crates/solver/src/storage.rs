//! Cache storage and worker contracts consumed by the scheduler.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use kiln_graph::Digest;

use crate::error::Result;
use crate::sharedref::{ImmutableRef, RefHandle, SharedRef};

/// A recorded link between two cache ids.
///
/// Links point from an input's key to the key of the vertex consuming it,
/// qualified by the consuming input slot, the consumed output, and the
/// selector on the edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheInfoLink {
    /// Digest of the consuming vertex.
    pub digest: Digest,
    /// Input slot on the consuming vertex.
    pub input: usize,
    /// Output of the consuming vertex the link targets.
    pub output: usize,
    /// Selector on the input edge (empty when absent).
    pub selector: String,
}

/// A stored result entry under some cache id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult {
    /// Identifier of the stored result.
    pub id: String,
    /// When the result was recorded.
    pub created_at: DateTime<Utc>,
}

/// One content blob of a remote result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Media type of the blob.
    pub media_type: String,
    /// Content digest of the blob.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: u64,
}

/// Serves blob bytes by digest.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Fetch the blob with the given digest.
    async fn get(&self, digest: &Digest) -> Result<Bytes>;
}

/// A result in transferable form: ordered descriptors plus the provider the
/// blobs can be read from. This is the only shape in which results leave the
/// process.
#[derive(Clone)]
pub struct Remote {
    /// Ordered layer descriptors.
    pub descriptors: Vec<Descriptor>,
    /// Where the descriptor blobs can be read from.
    pub provider: Arc<dyn ContentProvider>,
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

/// Identifier of a remote result: the digest over its descriptor digests in
/// order.
pub fn remote_id(remote: &Remote) -> String {
    let mut buf = Vec::new();
    for desc in &remote.descriptors {
        buf.extend_from_slice(desc.digest.to_string().as_bytes());
    }
    Digest::from_bytes(&buf).to_string()
}

/// Storage of cache keys, their links, and their result entries.
///
/// Implementations representing imported (read-only) caches must reject the
/// write operations with an error instead of dropping them silently. The
/// scheduler treats failed writes as non-fatal: it logs and keeps going.
#[async_trait]
pub trait CacheKeyStorage: Send + Sync {
    /// Whether any state exists under `id`.
    async fn exists(&self, id: &Digest) -> bool;
    /// All result entries recorded under `id`.
    async fn walk_results(&self, id: &Digest) -> Result<Vec<CacheResult>>;
    /// Target ids reachable from `id` over `link`.
    async fn walk_links(&self, id: &Digest, link: &CacheInfoLink) -> Result<Vec<Digest>>;
    /// All incoming links of `id`, as `(source id, link)` pairs.
    async fn walk_backlinks(&self, id: &Digest) -> Result<Vec<(Digest, CacheInfoLink)>>;
    /// Ids that have `result_id` recorded as one of their results.
    async fn walk_ids_by_result(&self, result_id: &str) -> Result<Vec<Digest>>;
    /// Record a link from `id` to `target`.
    async fn add_link(&self, id: &Digest, link: CacheInfoLink, target: &Digest) -> Result<()>;
    /// Record a result entry under `id`.
    async fn add_result(&self, id: &Digest, result: CacheResult) -> Result<()>;
    /// Whether the exact link is already recorded.
    async fn has_link(&self, id: &Digest, link: &CacheInfoLink, target: &Digest) -> bool;
    /// Drop a stored result by id.
    async fn release(&self, result_id: &str) -> Result<()>;
}

/// Storage of the results themselves.
#[async_trait]
pub trait CacheResultStorage: Send + Sync {
    /// Persist a live result, returning its record.
    async fn save(&self, result: &RefHandle) -> Result<CacheResult>;
    /// Rehydrate a stored result into a live shared reference.
    ///
    /// A missing or released result is [`crate::SolverError::NotFound`],
    /// which the scheduler recovers as a cache miss.
    async fn load(&self, result: &CacheResult) -> Result<SharedRef>;
    /// Fetch the transferable form of a stored result.
    async fn load_remote(&self, result: &CacheResult) -> Result<Remote>;
    /// Whether a result with this id exists.
    async fn exists(&self, id: &str) -> bool;
}

/// Worker back-end surface the solver needs.
///
/// Remote-backed result storages compose [`Worker::from_remote`] inside their
/// `load`; the scheduler itself never inspects blob bytes.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Rehydrate a remote result into a live reference.
    async fn from_remote(&self, remote: &Remote) -> Result<Box<dyn ImmutableRef>>;
    /// Read one file out of an artifact. Used to load nested build
    /// definitions.
    async fn read_file(&self, artifact: &dyn ImmutableRef, path: &str) -> Result<Bytes>;
}
