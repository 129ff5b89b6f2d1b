//! End-to-end solver behavior over fake back-ends.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kiln_graph::{
    Definition, Digest, ExecMeta, ExecOp, InputEdge, Mount, Op, OpNode, SourceIdentifier, SourceOp,
};
use kiln_solver::{
    Executor, ImmutableRef, MemoryCacheStorage, MutableRef, OpContext, ProgressRecord, RefHandle,
    Reference, Remote, SolveOptions, Solver, SolverError, SourceProvider, StandardResolver, Worker,
};
use tokio::sync::Notify;

#[derive(Debug)]
struct FakeRef {
    name: String,
    releases: Arc<AtomicUsize>,
}

impl ImmutableRef for FakeRef {
    fn id(&self) -> &str {
        &self.name
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct FakeMutable {
    name: String,
    releases: Arc<AtomicUsize>,
}

impl MutableRef for FakeMutable {
    fn id(&self) -> &str {
        &self.name
    }

    fn commit(self: Box<Self>) -> Result<Box<dyn ImmutableRef>, SolverError> {
        Ok(Box::new(FakeRef {
            name: format!("{}-sealed", self.name),
            releases: self.releases,
        }))
    }

    fn discard(self: Box<Self>) {}
}

fn ref_name(id: &SourceIdentifier) -> String {
    match id {
        SourceIdentifier::Image(reference) => format!("img-{reference}"),
        SourceIdentifier::Git { remote, .. } => format!("git-{remote}"),
        SourceIdentifier::Local(name) => format!("local-{name}"),
        SourceIdentifier::Http { url, .. } => format!("http-{url}"),
    }
}

struct FakeSource {
    fetches: AtomicUsize,
    resolved: Mutex<HashMap<(String, String), Digest>>,
    releases: Arc<AtomicUsize>,
}

impl FakeSource {
    fn new(releases: Arc<AtomicUsize>) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            resolved: Mutex::new(HashMap::new()),
            releases,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn resolve_git(&self, remote: &str, reference: &str, commit: Digest) {
        self.resolved
            .lock()
            .unwrap()
            .insert((remote.to_string(), reference.to_string()), commit);
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn fetch(
        &self,
        id: &SourceIdentifier,
        _attrs: &BTreeMap<String, String>,
        _ctx: &OpContext,
    ) -> Result<Reference, SolverError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Reference::Immutable(Box::new(FakeRef {
            name: ref_name(id),
            releases: self.releases.clone(),
        })))
    }

    async fn resolve(
        &self,
        id: &SourceIdentifier,
        _attrs: &BTreeMap<String, String>,
        _ctx: &OpContext,
    ) -> Result<Option<Digest>, SolverError> {
        if let SourceIdentifier::Git { remote, reference } = id {
            let key = (
                remote.clone(),
                reference.clone().unwrap_or_default(),
            );
            return Ok(self.resolved.lock().unwrap().get(&key).copied());
        }
        Ok(None)
    }
}

struct FakeExec {
    runs: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    fail_once: AtomicBool,
    mutable_output: AtomicBool,
    cancel_seen: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl FakeExec {
    fn new(releases: Arc<AtomicUsize>) -> Self {
        Self {
            runs: AtomicUsize::new(0),
            gate: Mutex::new(None),
            fail_once: AtomicBool::new(false),
            mutable_output: AtomicBool::new(false),
            cancel_seen: AtomicUsize::new(0),
            releases,
        }
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn ungate(&self) {
        *self.gate.lock().unwrap() = None;
    }
}

#[async_trait]
impl Executor for FakeExec {
    async fn exec(
        &self,
        op: &ExecOp,
        _inputs: &[RefHandle],
        ctx: &OpContext,
    ) -> Result<Vec<Reference>, SolverError> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = ctx.cancellation().cancelled() => {
                    self.cancel_seen.fetch_add(1, Ordering::SeqCst);
                    return Err(SolverError::Canceled);
                }
            }
        }

        if self.fail_once.swap(false, Ordering::SeqCst) {
            return Err(SolverError::OperationFailed("exit status 1".to_string()));
        }

        let arity = Op::Exec(op.clone()).output_arity();
        let tag = op.meta.args.join("_");
        if self.mutable_output.load(Ordering::SeqCst) {
            return Ok((0..arity)
                .map(|index| {
                    Reference::Mutable(Box::new(FakeMutable {
                        name: format!("exec-{tag}-{index}"),
                        releases: self.releases.clone(),
                    }) as Box<dyn MutableRef>)
                })
                .collect());
        }
        Ok((0..arity)
            .map(|index| {
                Reference::Immutable(Box::new(FakeRef {
                    name: format!("exec-{tag}-{index}"),
                    releases: self.releases.clone(),
                }) as Box<dyn ImmutableRef>)
            })
            .collect())
    }
}

struct FakeWorker {
    files: Mutex<HashMap<(String, String), Bytes>>,
}

impl FakeWorker {
    fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    fn put_file(&self, artifact_id: &str, path: &str, data: Vec<u8>) {
        self.files
            .lock()
            .unwrap()
            .insert((artifact_id.to_string(), path.to_string()), Bytes::from(data));
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn from_remote(&self, _remote: &Remote) -> Result<Box<dyn ImmutableRef>, SolverError> {
        Err(SolverError::NotFound("no remote backing".to_string()))
    }

    async fn read_file(
        &self,
        artifact: &dyn ImmutableRef,
        path: &str,
    ) -> Result<Bytes, SolverError> {
        self.files
            .lock()
            .unwrap()
            .get(&(artifact.id().to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| SolverError::NotFound(format!("{}:{path}", artifact.id())))
    }
}

struct TestEnv {
    solver: Arc<Solver>,
    source: Arc<FakeSource>,
    exec: Arc<FakeExec>,
    worker: Arc<FakeWorker>,
    releases: Arc<AtomicUsize>,
}

fn env() -> TestEnv {
    let releases = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(FakeSource::new(releases.clone()));
    let exec = Arc::new(FakeExec::new(releases.clone()));
    let worker = Arc::new(FakeWorker::new());
    let store = Arc::new(MemoryCacheStorage::new());
    let resolver = Arc::new(StandardResolver::new(
        source.clone(),
        exec.clone(),
        worker.clone(),
    ));
    let solver = Arc::new(Solver::new(resolver, store.clone(), store));
    TestEnv {
        solver,
        source,
        exec,
        worker,
        releases,
    }
}

fn source_op(identifier: &str) -> Op {
    Op::Source(SourceOp {
        identifier: identifier.to_string(),
        attrs: BTreeMap::new(),
    })
}

fn exec_op(args: &[&str]) -> Op {
    Op::Exec(ExecOp {
        meta: ExecMeta {
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            cwd: String::new(),
        },
        mounts: vec![Mount {
            input: Some(0),
            dest: "/".to_string(),
            output: Some(0),
            readonly: false,
        }],
    })
}

fn source_def(identifier: &str) -> (Definition, Digest) {
    let mut b = Definition::builder();
    let src = b.add(source_op(identifier), Vec::new()).unwrap();
    (b.finish(src, 0).unwrap(), src)
}

fn exec_def(identifier: &str, args: &[&str]) -> (Definition, Digest) {
    let mut b = Definition::builder();
    let src = b.add(source_op(identifier), Vec::new()).unwrap();
    let target = b
        .add(exec_op(args), vec![InputEdge::new(src, 0)])
        .unwrap();
    (b.finish(target, 0).unwrap(), target)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn drain(mut stream: kiln_solver::ProgressStream) -> Vec<ProgressRecord> {
    let mut records = Vec::new();
    while let Some(record) = stream.next().await {
        records.push(record);
    }
    records
}

fn vertex_records(records: &[ProgressRecord], digest: Digest) -> Vec<&kiln_solver::VertexUpdate> {
    records
        .iter()
        .filter_map(|record| match record {
            ProgressRecord::Vertex(update) if update.digest == digest => Some(update),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_source_cache_hit() -> anyhow::Result<()> {
    let env = env();
    let (def, src) = source_def("docker-image://alpine:3");

    let first = env.solver.solve("j1", &def, SolveOptions::default()).await?;
    assert_eq!(env.source.fetches(), 1);
    assert_eq!(first.id(), "img-alpine:3");

    let status = env.solver.status("j2");
    let second = env.solver.solve("j2", &def, SolveOptions::default()).await?;
    assert_eq!(env.source.fetches(), 1, "second solve must not fetch");
    assert_eq!(second.id(), first.id());

    let records = drain(status).await;
    let updates = vertex_records(&records, src);
    assert_eq!(updates.len(), 1, "cached vertex emits one record");
    assert!(updates[0].cached);
    assert!(updates[0].started.is_some() && updates[0].completed.is_some());

    first.release()?;
    second.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deduplication_under_concurrency() -> anyhow::Result<()> {
    let env = env();
    let gate = env.exec.gate();
    let (def, target) = exec_def("docker-image://alpine:3", &["make", "all"]);

    let s1 = env.solver.status("j1");
    let s2 = env.solver.status("j2");

    let t1 = {
        let solver = env.solver.clone();
        let def = def.clone();
        tokio::spawn(async move { solver.solve("j1", &def, SolveOptions::default()).await })
    };
    let t2 = {
        let solver = env.solver.clone();
        let def = def.clone();
        tokio::spawn(async move { solver.solve("j2", &def, SolveOptions::default()).await })
    };

    wait_until(|| env.exec.runs() == 1).await;
    // Give the second job time to fan into the in-flight computation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.notify_one();

    let h1 = t1.await??;
    let h2 = t2.await??;
    assert_eq!(env.exec.runs(), 1, "exactly one operation invocation");
    assert_eq!(h1.id(), h2.id());
    assert!(h1.shares() >= 2, "both jobs hold live shares");

    for records in [drain(s1).await, drain(s2).await] {
        let updates = vertex_records(&records, target);
        assert!(
            updates.iter().any(|u| u.started.is_some() && u.completed.is_none()),
            "started record present"
        );
        assert!(
            updates.iter().any(|u| u.completed.is_some() && u.error.is_none()),
            "completed record present"
        );
    }

    h1.release()?;
    h2.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_cancellation_preserves_shared_work() -> anyhow::Result<()> {
    let env = env();
    let gate = env.exec.gate();
    let (def, _) = exec_def("docker-image://alpine:3", &["slow", "build"]);

    let t1 = {
        let solver = env.solver.clone();
        let def = def.clone();
        tokio::spawn(async move { solver.solve("j1", &def, SolveOptions::default()).await })
    };
    let t2 = {
        let solver = env.solver.clone();
        let def = def.clone();
        tokio::spawn(async move { solver.solve("j2", &def, SolveOptions::default()).await })
    };

    wait_until(|| env.exec.runs() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(env.solver.cancel("j1"));
    let r1 = t1.await?;
    assert!(matches!(r1, Err(SolverError::Canceled)));

    // The shared computation keeps running for the surviving job.
    gate.notify_one();
    let h2 = t2.await??;
    assert_eq!(env.exec.runs(), 1);
    assert_eq!(env.exec.cancel_seen.load(Ordering::SeqCst), 0);

    h2.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_cancellation_aborts_and_caches_nothing() -> anyhow::Result<()> {
    let env = env();
    let _gate = env.exec.gate();
    let (def, _) = exec_def("docker-image://alpine:3", &["never", "finishes"]);

    let t1 = {
        let solver = env.solver.clone();
        let def = def.clone();
        tokio::spawn(async move { solver.solve("j1", &def, SolveOptions::default()).await })
    };
    wait_until(|| env.exec.runs() == 1).await;

    assert!(env.solver.cancel("j1"));
    let r1 = t1.await?;
    assert!(matches!(r1, Err(SolverError::Canceled)));
    wait_until(|| env.exec.cancel_seen.load(Ordering::SeqCst) == 1).await;

    // Nothing was cached for the target: solving again runs the operation
    // a second time (the source, which completed, is cache-satisfied).
    env.exec.ungate();
    let h = env.solver.solve("j2", &def, SolveOptions::default()).await?;
    assert_eq!(env.exec.runs(), 2);
    assert_eq!(env.source.fetches(), 1);

    h.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn content_key_refines_cache() -> anyhow::Result<()> {
    let env = env();
    let commit = Digest::from_bytes(b"commit-abc123");
    env.source.resolve_git("github.com/x/y.git", "master", commit);
    env.source.resolve_git("github.com/x/y.git", "main", commit);

    let (def_master, _) = source_def("git://github.com/x/y.git#master");
    let (def_main, _) = source_def("git://github.com/x/y.git#main");

    let h1 = env
        .solver
        .solve("j1", &def_master, SolveOptions::default())
        .await?;
    assert_eq!(env.source.fetches(), 1);

    // Distinct request key, same resolved commit: content-key hit, no fetch.
    let h2 = env
        .solver
        .solve("j2", &def_main, SolveOptions::default())
        .await?;
    assert_eq!(env.source.fetches(), 1, "content key must satisfy the solve");
    assert_eq!(h1.id(), h2.id());

    h1.release()?;
    h2.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dangling_input_reference_is_invalid() -> anyhow::Result<()> {
    let env = env();

    // The target names an input digest with no backing entry in the
    // definition; the solver rejects it at load, before any job state.
    let phantom = Digest::from_bytes(b"not in the definition");
    let a_raw = OpNode {
        inputs: vec![InputEdge::new(phantom, 0)],
        op: exec_op(&["a"]),
    }
    .to_bytes()?;
    let a_digest = Digest::from_bytes(&a_raw);
    let root = OpNode {
        inputs: vec![InputEdge::new(a_digest, 0)],
        op: source_op(""),
    }
    .to_bytes()?;

    let def = Definition {
        ops: vec![a_raw, root],
        metadata: BTreeMap::new(),
    };
    let result = env.solver.solve("j1", &def, SolveOptions::default()).await;
    assert!(matches!(result, Err(SolverError::InvalidDefinition(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ignore_cache_reruns_the_operation() -> anyhow::Result<()> {
    let env = env();
    let mut b = Definition::builder();
    let src = b.add(source_op("docker-image://alpine:3"), Vec::new())?;
    b.ignore_cache(src);
    let def = b.finish(src, 0)?;

    let h1 = env.solver.solve("j1", &def, SolveOptions::default()).await?;
    let h2 = env.solver.solve("j2", &def, SolveOptions::default()).await?;
    assert_eq!(env.source.fetches(), 2);

    h1.release()?;
    h2.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operation_failure_propagates_and_may_retry() -> anyhow::Result<()> {
    let env = env();
    env.exec.fail_once.store(true, Ordering::SeqCst);
    let (def, target) = exec_def("docker-image://alpine:3", &["flaky"]);

    let status = env.solver.status("j1");
    let result = env.solver.solve("j1", &def, SolveOptions::default()).await;
    assert!(matches!(result, Err(SolverError::OperationFailed(_))));

    let records = drain(status).await;
    let updates = vertex_records(&records, target);
    assert!(
        updates.iter().any(|u| u.error.is_some()),
        "failed vertex reports completed-with-error"
    );

    // No negative caching: a subsequent job runs the vertex again.
    let h = env.solver.solve("j2", &def, SolveOptions::default()).await?;
    assert_eq!(env.exec.runs(), 2);
    h.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_job_gets_synthetic_started_replay() -> anyhow::Result<()> {
    let env = env();
    let gate = env.exec.gate();
    let (def, target) = exec_def("docker-image://alpine:3", &["long", "task"]);

    let t1 = {
        let solver = env.solver.clone();
        let def = def.clone();
        tokio::spawn(async move { solver.solve("j1", &def, SolveOptions::default()).await })
    };
    wait_until(|| env.exec.runs() == 1).await;

    // Attach a second job while the computation is already running.
    let status = env.solver.status("j2");
    let t2 = {
        let solver = env.solver.clone();
        let def = def.clone();
        tokio::spawn(async move { solver.solve("j2", &def, SolveOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.notify_one();

    let h1 = t1.await??;
    let h2 = t2.await??;

    let records = drain(status).await;
    let updates = vertex_records(&records, target);
    assert!(
        updates.iter().any(|u| u.started.is_some() && u.completed.is_none()),
        "late subscriber receives a synthetic started"
    );
    assert!(updates.iter().any(|u| u.completed.is_some()));

    h1.release()?;
    h2.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn build_op_solves_nested_definition() -> anyhow::Result<()> {
    let env = env();

    let (inner_def, inner_src) = source_def("docker-image://alpine:3");
    env.worker.put_file(
        "local-context",
        "build.json",
        serde_json::to_vec(&inner_def)?,
    );

    let mut b = Definition::builder();
    let ctx_src = b.add(source_op("local://context"), Vec::new())?;
    let build = b.add(
        Op::Build(kiln_graph::BuildOp {
            input: 0,
            filename: "build.json".to_string(),
            attrs: BTreeMap::new(),
        }),
        vec![InputEdge::new(ctx_src, 0)],
    )?;
    let def = b.finish(build, 0)?;

    let status = env.solver.status("j1");
    let handle = env.solver.solve("j1", &def, SolveOptions::default()).await?;
    assert_eq!(handle.id(), "img-alpine:3");
    assert_eq!(env.source.fetches(), 2, "context plus nested source");

    // Nested vertices report progress on the same job stream.
    let records = drain(status).await;
    assert!(!vertex_records(&records, inner_src).is_empty());

    handle.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn released_handles_release_the_origin_once() -> anyhow::Result<()> {
    let env = env();
    let (def, _) = source_def("docker-image://alpine:3");

    let handle = env.solver.solve("j1", &def, SolveOptions::default()).await?;
    // The cache store still holds a share, so nothing is released yet.
    handle.release()?;
    assert_eq!(env.releases.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutable_outputs_are_committed_before_sharing() -> anyhow::Result<()> {
    let env = env();
    env.exec.mutable_output.store(true, Ordering::SeqCst);
    let (def, _) = exec_def("docker-image://alpine:3", &["pack", "rootfs"]);

    let handle = env.solver.solve("j1", &def, SolveOptions::default()).await?;
    assert_eq!(handle.id(), "exec-pack_rootfs-0-sealed");
    handle.release()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_cancels_the_job() -> anyhow::Result<()> {
    let env = env();
    let _gate = env.exec.gate();
    let (def, _) = exec_def("docker-image://alpine:3", &["hangs"]);

    let options = SolveOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let result = env.solver.solve("j1", &def, options).await;
    assert!(matches!(result, Err(SolverError::Canceled)));
    Ok(())
}
