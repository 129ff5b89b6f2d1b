#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Solver core of `kiln`: deduplicated, cache-aware evaluation of
//! content-addressed build graphs, with cooperative cancellation and
//! progress streaming.

mod error;
mod job;
mod key;
mod memstore;
mod ops;
mod progress;
mod sharedref;
mod solve;
mod storage;

pub use error::{Result, SolverError};
pub use job::SolveOptions;
pub use key::{op_key, output_key, vertex_cache_key};
pub use memstore::MemoryCacheStorage;
pub use ops::{
    Executor, NestedSolver, OpContext, OpResolver, Operation, SourceProvider, StandardResolver,
};
pub use progress::{
    LogStream, ProgressRecord, ProgressStream, VertexLog, VertexProgress, VertexStatus,
    VertexUpdate,
};
pub use sharedref::{ImmutableRef, MutableRef, RefHandle, Reference, SharedRef};
pub use solve::{Solver, SolverConfig};
pub use storage::{
    CacheInfoLink, CacheKeyStorage, CacheResult, CacheResultStorage, ContentProvider, Descriptor,
    Remote, Worker, remote_id,
};
