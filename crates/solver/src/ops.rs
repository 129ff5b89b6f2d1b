//! Operation dispatch and the built-in runners.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use kiln_graph::{BuildOp, Definition, Digest, ExecOp, Op, SourceIdentifier, SourceOp, Vertex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SolverError};
use crate::key;
use crate::progress::{LogStream, VertexProgress};
use crate::sharedref::{RefHandle, Reference};
use crate::storage::Worker;

const SOURCE_CACHE_TYPE: &str = "kiln.source.v0";
const EXEC_CACHE_TYPE: &str = "kiln.exec.v0";
const BUILD_CACHE_TYPE: &str = "kiln.build.v0";

/// Capability to solve a nested definition within the current job.
#[async_trait]
pub trait NestedSolver: Send + Sync {
    /// Evaluate the definition's target and return its output handle.
    async fn solve_nested(&self, definition: &Definition) -> Result<RefHandle>;
}

/// Execution context handed to an operation.
///
/// Carries the cancellation signal (deadlines arrive as cancellation with a
/// deadline source), the vertex-scoped progress emitter, and the
/// nested-solve capability.
pub struct OpContext {
    cancel: CancellationToken,
    progress: VertexProgress,
    nested: Arc<dyn NestedSolver>,
}

impl OpContext {
    pub(crate) fn new(
        cancel: CancellationToken,
        progress: VertexProgress,
        nested: Arc<dyn NestedSolver>,
    ) -> Self {
        Self {
            cancel,
            progress,
            nested,
        }
    }

    /// The cancellation signal for this computation.
    ///
    /// Fires only when every waiter has canceled; operations should stop
    /// promptly and clean up, releasing any mutable references they acquired.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation has been requested.
    pub fn canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish a status counter for this vertex.
    pub fn status(&self, id: &str, name: &str, current: u64, total: Option<u64>) {
        self.progress.status(id, name, current, total);
    }

    /// Publish a chunk of operation output for this vertex.
    pub fn log(&self, stream: LogStream, data: impl Into<Bytes>) {
        self.progress.log(stream, data);
    }

    /// Solve a nested definition within the current job.
    pub async fn solve_nested(&self, definition: &Definition) -> Result<RefHandle> {
        self.nested.solve_nested(definition).await
    }
}

/// One vertex's executable implementation.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Deterministic fingerprint of the operation itself; input identity is
    /// folded in by the cache-key engine.
    async fn cache_key(&self, ctx: &OpContext) -> Result<Digest>;

    /// Execute with materialized inputs, producing one reference per
    /// declared output.
    async fn run(&self, ctx: &OpContext, inputs: &[RefHandle]) -> Result<Vec<Reference>>;

    /// Refined keys incorporating live input content, queried against the
    /// cache before the operation runs. The refinement is optional;
    /// operations without one return nothing.
    async fn content_keys(
        &self,
        ctx: &OpContext,
        input_content_keys: &[Vec<Digest>],
        inputs: &[RefHandle],
    ) -> Result<Vec<Digest>> {
        let _ = (ctx, input_content_keys, inputs);
        Ok(Vec::new())
    }
}

/// Turns a vertex into its operation implementation.
///
/// The built-in [`StandardResolver`] covers the closed tag set; worker
/// back-ends may substitute their own resolver for specialised variants.
pub trait OpResolver: Send + Sync {
    /// Resolve `vertex.op` into a runnable implementation.
    fn resolve(&self, vertex: &Arc<Vertex>) -> Result<Arc<dyn Operation>>;
}

/// Resolves and fetches source artifacts.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetch the artifact behind the identifier.
    async fn fetch(
        &self,
        id: &SourceIdentifier,
        attrs: &BTreeMap<String, String>,
        ctx: &OpContext,
    ) -> Result<Reference>;

    /// Resolve the identifier to a content fingerprint without fetching,
    /// when the scheme supports it (e.g. remote git ref resolution).
    ///
    /// `None` means the source has no cheap fingerprint and the cache falls
    /// back to the request-shaped key alone.
    async fn resolve(
        &self,
        id: &SourceIdentifier,
        attrs: &BTreeMap<String, String>,
        ctx: &OpContext,
    ) -> Result<Option<Digest>>;
}

/// Executes command-running operations against materialized mounts.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the command with its mounts bound to the given input references,
    /// returning one reference per declared output. A non-zero exit must
    /// surface as [`SolverError::OperationFailed`].
    async fn exec(
        &self,
        op: &ExecOp,
        inputs: &[RefHandle],
        ctx: &OpContext,
    ) -> Result<Vec<Reference>>;
}

/// Default resolver: dispatches on the operation tag.
pub struct StandardResolver {
    source: Arc<dyn SourceProvider>,
    exec: Arc<dyn Executor>,
    worker: Arc<dyn Worker>,
}

impl StandardResolver {
    /// Resolver over the given back-ends.
    pub fn new(
        source: Arc<dyn SourceProvider>,
        exec: Arc<dyn Executor>,
        worker: Arc<dyn Worker>,
    ) -> Self {
        Self {
            source,
            exec,
            worker,
        }
    }
}

impl OpResolver for StandardResolver {
    fn resolve(&self, vertex: &Arc<Vertex>) -> Result<Arc<dyn Operation>> {
        match &vertex.op {
            Op::Source(op) => {
                let id = SourceIdentifier::parse(&op.identifier)
                    .map_err(|err| SolverError::InvalidDefinition(err.to_string()))?;
                Ok(Arc::new(SourceRunner {
                    id,
                    op: op.clone(),
                    provider: self.source.clone(),
                }))
            }
            Op::Exec(op) => Ok(Arc::new(ExecRunner {
                op: op.clone(),
                executor: self.exec.clone(),
            })),
            Op::Build(op) => Ok(Arc::new(BuildRunner {
                op: op.clone(),
                worker: self.worker.clone(),
            })),
        }
    }
}

struct SourceRunner {
    id: SourceIdentifier,
    op: SourceOp,
    provider: Arc<dyn SourceProvider>,
}

#[async_trait]
impl Operation for SourceRunner {
    async fn cache_key(&self, _ctx: &OpContext) -> Result<Digest> {
        key::op_key(SOURCE_CACHE_TYPE, &self.op)
    }

    async fn run(&self, ctx: &OpContext, inputs: &[RefHandle]) -> Result<Vec<Reference>> {
        if !inputs.is_empty() {
            return Err(SolverError::Internal(format!(
                "source {} given {} inputs",
                self.op.identifier,
                inputs.len()
            )));
        }
        let reference = self.provider.fetch(&self.id, &self.op.attrs, ctx).await?;
        Ok(vec![reference])
    }

    async fn content_keys(
        &self,
        ctx: &OpContext,
        _input_content_keys: &[Vec<Digest>],
        _inputs: &[RefHandle],
    ) -> Result<Vec<Digest>> {
        let resolved = self.provider.resolve(&self.id, &self.op.attrs, ctx).await?;
        Ok(resolved.into_iter().collect())
    }
}

struct ExecRunner {
    op: ExecOp,
    executor: Arc<dyn Executor>,
}

#[async_trait]
impl Operation for ExecRunner {
    async fn cache_key(&self, _ctx: &OpContext) -> Result<Digest> {
        key::op_key(EXEC_CACHE_TYPE, &self.op)
    }

    async fn run(&self, ctx: &OpContext, inputs: &[RefHandle]) -> Result<Vec<Reference>> {
        let outputs = self.executor.exec(&self.op, inputs, ctx).await?;
        let arity = Op::Exec(self.op.clone()).output_arity();
        if outputs.len() != arity {
            return Err(SolverError::Internal(format!(
                "exec produced {} outputs, declared {arity}",
                outputs.len()
            )));
        }
        Ok(outputs)
    }
}

struct BuildRunner {
    op: BuildOp,
    worker: Arc<dyn Worker>,
}

#[async_trait]
impl Operation for BuildRunner {
    async fn cache_key(&self, _ctx: &OpContext) -> Result<Digest> {
        key::op_key(BUILD_CACHE_TYPE, &self.op)
    }

    async fn run(&self, ctx: &OpContext, inputs: &[RefHandle]) -> Result<Vec<Reference>> {
        let input = inputs.get(self.op.input).ok_or_else(|| {
            SolverError::InvalidDefinition(format!(
                "build input {} out of range ({} inputs)",
                self.op.input,
                inputs.len()
            ))
        })?;

        let raw = self
            .worker
            .read_file(input.immutable(), &self.op.filename)
            .await?;
        let definition: Definition = serde_json::from_slice(&raw).map_err(|err| {
            SolverError::InvalidDefinition(format!(
                "nested definition {}: {err}",
                self.op.filename
            ))
        })?;

        let handle = ctx.solve_nested(&definition).await?;
        Ok(vec![Reference::Immutable(handle.into_origin())])
    }
}
