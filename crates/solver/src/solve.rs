//! The job scheduler: deduplicated, cancellable vertex evaluation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use kiln_graph::{Definition, Digest, Vertex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SolverError};
use crate::job::{Job, JobRegistry, SolveOptions};
use crate::key;
use crate::ops::{NestedSolver, OpContext, OpResolver, Operation};
use crate::progress::{JobTags, ProgressBus, ProgressRecord, ProgressStream, VertexProgress, VertexUpdate};
use crate::sharedref::{RefHandle, Reference, SharedRef};
use crate::storage::{CacheInfoLink, CacheKeyStorage, CacheResult, CacheResultStorage};

/// Solver tunables.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Capacity of each job's progress channel.
    pub progress_capacity: usize,
    /// How long a cancelled operation gets to clean up before its task is
    /// dropped.
    pub cancel_grace: Duration,
}

impl SolverConfig {
    /// Default progress channel capacity.
    pub const DEFAULT_PROGRESS_CAPACITY: usize = 1024;
    /// Default teardown grace period.
    pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            progress_capacity: Self::DEFAULT_PROGRESS_CAPACITY,
            cancel_grace: Self::DEFAULT_CANCEL_GRACE,
        }
    }
}

/// Evaluates build graphs into output references.
///
/// Every vertex is realized at most once per `(digest, ignore_cache)` across
/// all concurrent jobs; later requests fan into the in-flight computation
/// and share its outcome.
pub struct Solver {
    inner: Arc<SolverInner>,
}

struct SolverInner {
    config: SolverConfig,
    resolver: Arc<dyn OpResolver>,
    keys: Arc<dyn CacheKeyStorage>,
    results: Arc<dyn CacheResultStorage>,
    bus: Arc<ProgressBus>,
    jobs: JobRegistry,
    inflight: Mutex<HashMap<InflightKey, Arc<Computation>>>,
}

/// Dedup identity of a computation: the vertex digest plus the effective
/// ignore-cache setting it runs under.
type InflightKey = (Digest, bool);

impl Solver {
    /// Solver over the given operation resolver and cache stores.
    pub fn new(
        resolver: Arc<dyn OpResolver>,
        keys: Arc<dyn CacheKeyStorage>,
        results: Arc<dyn CacheResultStorage>,
    ) -> Self {
        Self::with_config(resolver, keys, results, SolverConfig::default())
    }

    /// Solver with explicit tunables.
    pub fn with_config(
        resolver: Arc<dyn OpResolver>,
        keys: Arc<dyn CacheKeyStorage>,
        results: Arc<dyn CacheResultStorage>,
        config: SolverConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SolverInner {
                bus: Arc::new(ProgressBus::new(config.progress_capacity)),
                config,
                resolver,
                keys,
                results,
                jobs: JobRegistry::default(),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Evaluate the definition's target and return its output reference.
    ///
    /// Blocks until completion, failure, or cancellation. The caller owns the
    /// returned handle and releases it when done. The job's progress channel
    /// closes when this returns.
    pub async fn solve(
        &self,
        job_id: &str,
        definition: &Definition,
        options: SolveOptions,
    ) -> Result<RefHandle> {
        let job = self.inner.jobs.register(job_id, options)?;
        if let Some(timeout) = options.timeout {
            let token = job.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            });
        }

        let result = self.solve_job(&job, definition).await;
        self.inner.jobs.remove(job_id);
        self.inner.bus.close(job_id);
        result
    }

    async fn solve_job(&self, job: &Arc<Job>, definition: &Definition) -> Result<RefHandle> {
        let (target, index) = kiln_graph::load(definition)?;
        debug!(job = %job.id, target = %target.digest, "solve");
        let done = eval_vertex(self.inner.clone(), Waiter::Job(job.clone()), target).await?;
        let shared = done.outputs.get(index).ok_or_else(|| {
            SolverError::Internal(format!("target output {index} missing"))
        })?;
        shared.share()
    }

    /// Stream progress records for a job until it terminates.
    ///
    /// Subscribing before the solve starts is allowed; the stream then covers
    /// the job from its first record.
    pub fn status(&self, job_id: &str) -> ProgressStream {
        self.inner.bus.subscribe(job_id)
    }

    /// Signal cooperative cancellation of a job.
    ///
    /// Returns `false` when no such job is active. Shared computations keep
    /// running as long as any other job still waits on them.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.inner.jobs.cancel(job_id)
    }
}

/// Terminal product of one vertex computation, shared by all waiters.
struct VertexDone {
    output_keys: Vec<Digest>,
    content_keys: Vec<Digest>,
    outputs: Vec<SharedRef>,
    cached: bool,
}

type Outcome = Result<Arc<VertexDone>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    KeyComputing,
    CacheLookup,
    Running,
    Done,
    Failed,
}

struct CompState {
    phase: Phase,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    outcome: Option<Outcome>,
}

struct WaiterEntry {
    paths: usize,
    canceled: bool,
}

#[derive(Default)]
struct WaiterTable {
    entries: HashMap<String, WaiterEntry>,
    refs: usize,
}

/// One in-flight (or recently finished) vertex realization.
struct Computation {
    key: InflightKey,
    vertex: Arc<Vertex>,
    jobwide_ignore: bool,
    state: Mutex<CompState>,
    waiters: Mutex<WaiterTable>,
    tags: Arc<Mutex<JobTags>>,
    children: Mutex<Vec<Arc<Computation>>>,
    done_tx: watch::Sender<Option<Outcome>>,
    terminal: AtomicBool,
    /// Fires only once every waiter has canceled or detached.
    cancel: CancellationToken,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

enum GuardExit {
    Observed,
    Canceled,
    Detached,
}

/// A waiter attached to a computation: a client job, or a dependent
/// computation evaluating its inputs.
#[derive(Clone)]
enum Waiter {
    Job(Arc<Job>),
    Parent(Arc<Computation>),
}

impl Waiter {
    fn key(&self) -> String {
        match self {
            Waiter::Job(job) => format!("job:{}", job.id),
            Waiter::Parent(comp) => format!("vertex:{}:{}", comp.key.0, comp.key.1),
        }
    }

    fn token(&self) -> CancellationToken {
        match self {
            Waiter::Job(job) => job.cancel.clone(),
            Waiter::Parent(comp) => comp.cancel.clone(),
        }
    }

    fn jobwide_ignore(&self) -> bool {
        match self {
            Waiter::Job(job) => job.options.ignore_cache,
            Waiter::Parent(comp) => comp.jobwide_ignore,
        }
    }
}

struct WaiterGuard {
    inner: Arc<SolverInner>,
    comp: Arc<Computation>,
    wkey: String,
    token: CancellationToken,
    active: bool,
}

impl WaiterGuard {
    async fn wait(mut self) -> Outcome {
        let token = self.token.clone();
        let mut rx = self.comp.done_tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                self.settle(GuardExit::Observed);
                return outcome;
            }
            let sender_gone = tokio::select! {
                changed = rx.changed() => changed.is_err(),
                _ = token.cancelled() => {
                    self.settle(GuardExit::Canceled);
                    return Err(SolverError::Canceled);
                }
            };
            if sender_gone {
                self.settle(GuardExit::Detached);
                return Err(SolverError::Internal(
                    "shared computation dropped before completing".to_string(),
                ));
            }
        }
    }

    fn settle(&mut self, exit: GuardExit) {
        self.active = false;
        self.comp.guard_done(&self.inner, &self.wkey, exit);
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.active {
            self.comp
                .guard_done(&self.inner, &self.wkey, GuardExit::Detached);
        }
    }
}

impl Computation {
    fn new(key: InflightKey, vertex: Arc<Vertex>, jobwide_ignore: bool) -> Self {
        Self {
            key,
            vertex,
            jobwide_ignore,
            state: Mutex::new(CompState {
                phase: Phase::Pending,
                started_at: None,
                completed_at: None,
                outcome: None,
            }),
            waiters: Mutex::new(WaiterTable::default()),
            tags: Arc::new(Mutex::new(JobTags::default())),
            children: Mutex::new(Vec::new()),
            done_tx: watch::Sender::new(None),
            terminal: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn attach(self: &Arc<Self>, inner: &Arc<SolverInner>, waiter: &Waiter) -> WaiterGuard {
        let wkey = waiter.key();
        {
            let mut table = lock(&self.waiters);
            table.refs += 1;
            let entry = table.entries.entry(wkey.clone()).or_insert(WaiterEntry {
                paths: 0,
                canceled: false,
            });
            entry.paths += 1;
        }
        WaiterGuard {
            inner: inner.clone(),
            comp: self.clone(),
            wkey,
            token: waiter.token(),
            active: true,
        }
    }

    fn guard_done(self: &Arc<Self>, inner: &Arc<SolverInner>, wkey: &str, exit: GuardExit) {
        let mut cancel_comp = false;
        let mut remove = false;
        {
            let mut table = lock(&self.waiters);
            table.refs -= 1;
            if let Some(entry) = table.entries.get_mut(wkey) {
                entry.paths = entry.paths.saturating_sub(1);
                match exit {
                    GuardExit::Observed => {}
                    GuardExit::Canceled => entry.canceled = true,
                    GuardExit::Detached => {
                        if entry.paths == 0 {
                            entry.canceled = true;
                        }
                    }
                }
            }
            let terminal = self.terminal.load(Ordering::Acquire);
            if !terminal
                && !table.entries.is_empty()
                && table.entries.values().all(|e| e.canceled)
            {
                cancel_comp = true;
            }
            if table.refs == 0 && terminal {
                remove = true;
            }
        }
        if cancel_comp {
            debug!(vertex = %self.vertex.digest, "all waiters canceled");
            // Unpublish before signalling, so a new job starts a fresh
            // computation instead of fanning into this doomed one.
            remove_inflight(inner, self);
            self.cancel.cancel();
        }
        if remove {
            remove_inflight(inner, self);
        }
    }

    fn add_child(&self, child: &Arc<Computation>) {
        let mut children = lock(&self.children);
        if !children.iter().any(|c| Arc::ptr_eq(c, child)) {
            children.push(child.clone());
        }
    }

    /// Register a job's interest in this vertex and everything below it,
    /// replaying the lifecycle position it missed.
    fn tag_job(self: &Arc<Self>, inner: &Arc<SolverInner>, job_id: &str) {
        {
            let mut tags = lock(&self.tags);
            if tags.jobs.contains_key(job_id) {
                return;
            }
            tags.jobs.insert(job_id.to_string(), Default::default());
        }

        let (phase, started_at, outcome) = {
            let state = lock(&self.state);
            (state.phase, state.started_at, state.outcome.clone())
        };
        match phase {
            Phase::Running => {
                // Synthetic started replay for a late subscriber.
                self.send_started(inner, job_id, started_at.unwrap_or_else(Utc::now));
            }
            Phase::Done | Phase::Failed => {
                if let Some(outcome) = outcome {
                    self.send_terminal(inner, job_id, &outcome);
                }
            }
            Phase::Pending | Phase::KeyComputing | Phase::CacheLookup => {}
        }

        let children = lock(&self.children).clone();
        for child in children {
            child.tag_job(inner, job_id);
        }
    }

    fn tag_snapshot(&self) -> Vec<String> {
        lock(&self.tags).job_ids()
    }

    fn update_record(
        &self,
        started: Option<DateTime<Utc>>,
        completed: Option<DateTime<Utc>>,
        cached: bool,
        error: Option<String>,
    ) -> ProgressRecord {
        ProgressRecord::Vertex(VertexUpdate {
            digest: self.vertex.digest,
            inputs: self.vertex.inputs.iter().map(|i| i.vertex.digest).collect(),
            name: self.vertex.name.clone(),
            started,
            completed,
            cached,
            error,
        })
    }

    fn send_started(&self, inner: &Arc<SolverInner>, job_id: &str, started_at: DateTime<Utc>) {
        {
            let mut tags = lock(&self.tags);
            match tags.jobs.get_mut(job_id) {
                Some(tag) if !tag.started_sent => tag.started_sent = true,
                _ => return,
            }
        }
        let record = self.update_record(Some(started_at), None, false, None);
        inner.bus.publish(job_id, record);
    }

    fn terminal_record(&self, outcome: &Outcome) -> ProgressRecord {
        let (started_at, completed_at) = {
            let state = lock(&self.state);
            (state.started_at, state.completed_at)
        };
        let completed_at = completed_at.unwrap_or_else(Utc::now);
        match outcome {
            Ok(done) if done.cached => self.update_record(
                Some(started_at.unwrap_or(completed_at)),
                Some(completed_at),
                true,
                None,
            ),
            Ok(_) => self.update_record(started_at, Some(completed_at), false, None),
            Err(err) => self.update_record(
                started_at,
                Some(completed_at),
                false,
                Some(err.to_string()),
            ),
        }
    }

    fn send_terminal(&self, inner: &Arc<SolverInner>, job_id: &str, outcome: &Outcome) {
        {
            let mut tags = lock(&self.tags);
            match tags.jobs.get_mut(job_id) {
                Some(tag) if !tag.terminal_sent => {
                    tag.started_sent = true;
                    tag.terminal_sent = true;
                }
                _ => return,
            }
        }
        inner.bus.publish(job_id, self.terminal_record(outcome));
    }

    fn set_phase(&self, phase: Phase) {
        lock(&self.state).phase = phase;
    }

    fn set_running(&self, inner: &Arc<SolverInner>) {
        let started_at = Utc::now();
        {
            let mut state = lock(&self.state);
            state.phase = Phase::Running;
            state.started_at = Some(started_at);
        }
        for job_id in self.tag_snapshot() {
            self.send_started(inner, &job_id, started_at);
        }
    }

    fn finish(self: &Arc<Self>, inner: &Arc<SolverInner>, outcome: Outcome) {
        {
            let mut state = lock(&self.state);
            state.phase = if outcome.is_ok() {
                Phase::Done
            } else {
                Phase::Failed
            };
            state.completed_at = Some(Utc::now());
            state.outcome = Some(outcome.clone());
        }
        self.terminal.store(true, Ordering::Release);

        for job_id in self.tag_snapshot() {
            self.send_terminal(inner, &job_id, &outcome);
        }
        self.done_tx.send_replace(Some(outcome));

        let remove = lock(&self.waiters).refs == 0;
        if remove {
            remove_inflight(inner, self);
        }
    }
}

fn remove_inflight(inner: &Arc<SolverInner>, comp: &Arc<Computation>) {
    let mut inflight = lock(&inner.inflight);
    if let Some(current) = inflight.get(&comp.key) {
        if Arc::ptr_eq(current, comp) {
            inflight.remove(&comp.key);
        }
    }
}

/// Attach to (or install) the shared computation for `vertex` and wait for
/// its outcome.
fn eval_vertex(
    inner: Arc<SolverInner>,
    waiter: Waiter,
    vertex: Arc<Vertex>,
) -> BoxFuture<'static, Outcome> {
    async move {
        let jobwide_ignore = waiter.jobwide_ignore();
        let ignore = vertex.metadata.ignore_cache || jobwide_ignore;
        let key = (vertex.digest, ignore);

        let (comp, owner) = {
            let mut inflight = lock(&inner.inflight);
            match inflight.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let comp = Arc::new(Computation::new(key, vertex.clone(), jobwide_ignore));
                    inflight.insert(key, comp.clone());
                    (comp, true)
                }
            }
        };

        let guard = comp.attach(&inner, &waiter);
        match &waiter {
            Waiter::Job(job) => comp.tag_job(&inner, &job.id),
            Waiter::Parent(parent) => {
                parent.add_child(&comp);
                for job_id in parent.tag_snapshot() {
                    comp.tag_job(&inner, &job_id);
                }
            }
        }

        if owner {
            let inner = inner.clone();
            let comp = comp.clone();
            tokio::spawn(async move {
                let outcome = compute(inner.clone(), comp.clone()).await;
                comp.finish(&inner, outcome);
            });
        }

        guard.wait().await
    }
    .boxed()
}

struct NestedSolve {
    inner: Arc<SolverInner>,
    comp: Arc<Computation>,
}

#[async_trait::async_trait]
impl NestedSolver for NestedSolve {
    async fn solve_nested(&self, definition: &Definition) -> Result<RefHandle> {
        let (target, index) = kiln_graph::load(definition)?;
        let done = eval_vertex(
            self.inner.clone(),
            Waiter::Parent(self.comp.clone()),
            target,
        )
        .await?;
        let shared = done.outputs.get(index).ok_or_else(|| {
            SolverError::Internal(format!("nested target output {index} missing"))
        })?;
        shared.share()
    }
}

async fn compute(inner: Arc<SolverInner>, comp: Arc<Computation>) -> Outcome {
    let vertex = comp.vertex.clone();
    comp.set_phase(Phase::KeyComputing);

    // Inputs evaluate in parallel; the first failure (by completion time)
    // wins and detaches our interest in the siblings.
    let input_count = vertex.inputs.len();
    let mut children: Vec<Option<Arc<VertexDone>>> = Vec::new();
    children.resize_with(input_count, || None);
    {
        let mut pending = FuturesUnordered::new();
        for (index, input) in vertex.inputs.iter().enumerate() {
            let fut = eval_vertex(
                inner.clone(),
                Waiter::Parent(comp.clone()),
                input.vertex.clone(),
            );
            pending.push(async move { (index, fut.await) });
        }
        while let Some((index, result)) = pending.next().await {
            children[index] = Some(result?);
        }
    }
    if comp.cancel.is_cancelled() {
        return Err(SolverError::Canceled);
    }

    let op = inner.resolver.resolve(&vertex)?;
    let ctx = OpContext::new(
        comp.cancel.clone(),
        VertexProgress::new(inner.bus.clone(), vertex.digest, comp.tags.clone()),
        Arc::new(NestedSolve {
            inner: inner.clone(),
            comp: comp.clone(),
        }),
    );

    let op_digest = op.cache_key(&ctx).await?;
    let mut key_pairs = Vec::with_capacity(input_count);
    for (input, done) in vertex.inputs.iter().zip(&children) {
        let done = done
            .as_ref()
            .ok_or_else(|| SolverError::Internal("input result missing".to_string()))?;
        let input_key = done
            .output_keys
            .get(input.output_index)
            .copied()
            .ok_or_else(|| {
                SolverError::Internal(format!(
                    "input output key {} missing on {}",
                    input.output_index, input.vertex.digest
                ))
            })?;
        key_pairs.push((input_key, input.selector.as_str()));
    }
    let cache_key = key::vertex_cache_key(&op_digest, &key_pairs)?;
    let arity = vertex.op.output_arity();
    let output_keys: Vec<Digest> = (0..arity).map(|i| key::output_key(&cache_key, i)).collect();

    let ignore_cache = comp.key.1;
    if !ignore_cache {
        comp.set_phase(Phase::CacheLookup);
        if let Some(loaded) = try_load_outputs(&inner, &output_keys).await {
            debug!(vertex = %vertex.digest, "cache hit");
            let outputs = loaded.into_iter().map(|(shared, _)| shared).collect();
            return Ok(Arc::new(VertexDone {
                output_keys,
                content_keys: Vec::new(),
                outputs,
                cached: true,
            }));
        }
    }

    // Materialized-input refinement: a content-key match wins over running.
    let mut input_handles = Vec::with_capacity(input_count);
    for (input, done) in vertex.inputs.iter().zip(&children) {
        let done = done
            .as_ref()
            .ok_or_else(|| SolverError::Internal("input result missing".to_string()))?;
        let shared = done.outputs.get(input.output_index).ok_or_else(|| {
            SolverError::Internal(format!(
                "input output {} missing on {}",
                input.output_index, input.vertex.digest
            ))
        })?;
        input_handles.push(shared.share()?);
    }
    let input_content_keys: Vec<Vec<Digest>> = children
        .iter()
        .map(|done| {
            done.as_ref()
                .map(|d| d.content_keys.clone())
                .unwrap_or_default()
        })
        .collect();
    let content_keys = match op
        .content_keys(&ctx, &input_content_keys, &input_handles)
        .await
    {
        Ok(keys) => keys,
        Err(err) => {
            warn!(vertex = %vertex.digest, error = %err, "content key computation failed; continuing without refinement");
            Vec::new()
        }
    };

    if !ignore_cache {
        for content_key in &content_keys {
            let refined: Vec<Digest> =
                (0..arity).map(|i| key::output_key(content_key, i)).collect();
            if let Some(loaded) = try_load_outputs(&inner, &refined).await {
                debug!(vertex = %vertex.digest, %content_key, "content key hit");
                let mut outputs = Vec::with_capacity(loaded.len());
                for (index, (shared, record)) in loaded.into_iter().enumerate() {
                    // Teach the request-shaped key about the result found by
                    // content, so the next lookup hits directly.
                    store_result(&inner, &output_keys[index], &record).await;
                    outputs.push(shared);
                }
                return Ok(Arc::new(VertexDone {
                    output_keys,
                    content_keys: content_keys.clone(),
                    outputs,
                    cached: true,
                }));
            }
        }
    }

    if comp.cancel.is_cancelled() {
        return Err(SolverError::Canceled);
    }

    comp.set_running(&inner);
    let references = run_with_grace(&inner, &comp, op.as_ref(), &ctx, &input_handles).await?;
    drop(input_handles);

    let mut outputs = Vec::with_capacity(references.len());
    for reference in references {
        match reference {
            Reference::Immutable(origin) => outputs.push(SharedRef::new(origin)),
            Reference::Mutable(mutable) => outputs.push(SharedRef::new(mutable.commit()?)),
        }
    }
    if outputs.len() != arity {
        return Err(SolverError::Internal(format!(
            "operation produced {} outputs, declared {arity}",
            outputs.len()
        )));
    }

    // Record results and forward links. Cache write failures are logged and
    // otherwise ignored; the build already has its result.
    for (index, output) in outputs.iter().enumerate() {
        let handle = output.share()?;
        match inner.results.save(&handle).await {
            Ok(record) => {
                store_result(&inner, &output_keys[index], &record).await;
                for content_key in &content_keys {
                    store_result(&inner, &key::output_key(content_key, index), &record).await;
                }
            }
            Err(err) => {
                warn!(vertex = %vertex.digest, error = %err, "saving result failed; continuing uncached");
            }
        }
    }
    for (input_index, (input, done)) in vertex.inputs.iter().zip(&children).enumerate() {
        let done = done
            .as_ref()
            .ok_or_else(|| SolverError::Internal("input result missing".to_string()))?;
        let from = done.output_keys[input.output_index];
        for output_index in 0..arity {
            let link = CacheInfoLink {
                digest: vertex.digest,
                input: input_index,
                output: output_index,
                selector: input.selector.clone(),
            };
            if inner
                .keys
                .has_link(&from, &link, &output_keys[output_index])
                .await
            {
                continue;
            }
            if let Err(err) = inner
                .keys
                .add_link(&from, link, &output_keys[output_index])
                .await
            {
                warn!(vertex = %vertex.digest, error = %err, "recording cache link failed");
            }
        }
    }

    Ok(Arc::new(VertexDone {
        output_keys,
        content_keys,
        outputs,
        cached: false,
    }))
}

/// Load a stored result for every key, or `None` on the first miss.
/// Transient storage failures degrade to a miss.
async fn try_load_outputs(
    inner: &Arc<SolverInner>,
    keys: &[Digest],
) -> Option<Vec<(SharedRef, CacheResult)>> {
    let mut out = Vec::with_capacity(keys.len());
    for id in keys {
        let records = match inner.keys.walk_results(id).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%id, error = %err, "walking cache results failed; treating as miss");
                return None;
            }
        };
        let mut loaded = None;
        for record in records {
            match inner.results.load(&record).await {
                Ok(shared) => {
                    loaded = Some((shared, record));
                    break;
                }
                Err(SolverError::NotFound(reason)) => {
                    debug!(%id, %reason, "stale cache record");
                }
                Err(err) => {
                    warn!(%id, error = %err, "cache load failed; treating as miss");
                }
            }
        }
        out.push(loaded?);
    }
    Some(out)
}

async fn store_result(inner: &Arc<SolverInner>, id: &Digest, record: &CacheResult) {
    if let Err(err) = inner.keys.add_result(id, record.clone()).await {
        warn!(%id, error = %err, "recording cache result failed");
    }
}

/// Run the operation, bounding its teardown after cancellation.
///
/// The operation observes cancellation through its context token; once the
/// grace period expires its future is dropped. A result produced during the
/// grace window is discarded, never cached.
async fn run_with_grace(
    inner: &Arc<SolverInner>,
    comp: &Arc<Computation>,
    op: &dyn Operation,
    ctx: &OpContext,
    inputs: &[RefHandle],
) -> Result<Vec<Reference>> {
    let run = op.run(ctx, inputs);
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = comp.cancel.cancelled() => {
            match tokio::time::timeout(inner.config.cancel_grace, &mut run).await {
                Ok(Ok(references)) => {
                    discard_references(references);
                    Err(SolverError::Canceled)
                }
                Ok(Err(_)) | Err(_) => Err(SolverError::Canceled),
            }
        }
    }
}

fn discard_references(references: Vec<Reference>) {
    for reference in references {
        match reference {
            Reference::Immutable(origin) => origin.release(),
            Reference::Mutable(mutable) => mutable.discard(),
        }
    }
}
