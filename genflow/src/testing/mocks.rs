//! Test doubles for workspaces and stage capabilities.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use crate::core::{ArtifactRef, FileTree, ServiceSpec, Stage};
use crate::errors::{PipelineError, Result};
use crate::workers::{StageCapability, TeardownCapability, WorkContext, WorkspaceWriter};

/// A workspace held in memory, keyed by artifact ref.
#[derive(Debug, Default)]
pub struct InMemoryWorkspace {
    trees: Mutex<HashMap<ArtifactRef, FileTree>>,
    writes: AtomicUsize,
}

impl InMemoryWorkspace {
    /// Creates an empty workspace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trees actually written.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns true if `artifact_ref` is present.
    #[must_use]
    pub fn contains(&self, artifact_ref: &ArtifactRef) -> bool {
        self.trees.lock().contains_key(artifact_ref)
    }

    /// Number of stored trees.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkspaceWriter for InMemoryWorkspace {
    async fn write(&self, service_name: &str, tree: &FileTree) -> Result<ArtifactRef> {
        let artifact_ref = ArtifactRef::for_tree(service_name, &tree.checksum());
        self.trees.lock().insert(artifact_ref.clone(), tree.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(artifact_ref)
    }

    async fn read(&self, artifact_ref: &ArtifactRef) -> Result<FileTree> {
        self.trees
            .lock()
            .get(artifact_ref)
            .cloned()
            .ok_or_else(|| PipelineError::store(format!("no artifact at {artifact_ref}")))
    }

    async fn find(&self, service_name: &str, checksum: &str) -> Result<Option<ArtifactRef>> {
        let artifact_ref = ArtifactRef::for_tree(service_name, checksum);
        Ok(self.contains(&artifact_ref).then_some(artifact_ref))
    }
}

#[async_trait]
impl TeardownCapability for InMemoryWorkspace {
    async fn teardown(&self, _spec: &ServiceSpec, artifact: Option<&ArtifactRef>, _stage: Stage) -> Result<()> {
        if let Some(artifact) = artifact {
            self.trees.lock().remove(artifact);
        }
        Ok(())
    }
}

/// A workspace whose first writes fail with a transient error.
#[derive(Debug)]
pub struct FlakyWorkspace {
    inner: InMemoryWorkspace,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyWorkspace {
    /// Fails the first `failures` writes.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryWorkspace::new(),
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Write calls so far, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful writes.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.inner.writes()
    }
}

#[async_trait]
impl WorkspaceWriter for FlakyWorkspace {
    async fn write(&self, service_name: &str, tree: &FileTree) -> Result<ArtifactRef> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PipelineError::transient("workspace lock contention"));
        }
        self.inner.write(service_name, tree).await
    }

    async fn read(&self, artifact_ref: &ArtifactRef) -> Result<FileTree> {
        self.inner.read(artifact_ref).await
    }

    async fn find(&self, service_name: &str, checksum: &str) -> Result<Option<ArtifactRef>> {
        self.inner.find(service_name, checksum).await
    }
}

/// A workspace whose writes wait until the test lets them through.
///
/// Services are recorded in the order they reach the gate.
#[derive(Debug)]
pub struct GatedWorkspace {
    inner: InMemoryWorkspace,
    permits: Arc<Semaphore>,
    entered: Mutex<Vec<String>>,
    arrivals: Notify,
}

impl GatedWorkspace {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: InMemoryWorkspace::new(),
            permits: Arc::new(Semaphore::new(0)),
            entered: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
        }
    }

    /// Lets `n` waiting or future writes through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Services that reached the gate, in order.
    #[must_use]
    pub fn entered(&self) -> Vec<String> {
        self.entered.lock().clone()
    }

    /// Waits until at least `n` writes have reached the gate.
    pub async fn wait_for_entries(&self, n: usize) {
        loop {
            let arrival = self.arrivals.notified();
            if self.entered.lock().len() >= n {
                return;
            }
            arrival.await;
        }
    }
}

impl Default for GatedWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceWriter for GatedWorkspace {
    async fn write(&self, service_name: &str, tree: &FileTree) -> Result<ArtifactRef> {
        self.entered.lock().push(service_name.to_string());
        self.arrivals.notify_waiters();

        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::transient("gate closed"))?;
        permit.forget();
        self.inner.write(service_name, tree).await
    }

    async fn read(&self, artifact_ref: &ArtifactRef) -> Result<FileTree> {
        self.inner.read(artifact_ref).await
    }

    async fn find(&self, service_name: &str, checksum: &str) -> Result<Option<ArtifactRef>> {
        self.inner.find(service_name, checksum).await
    }
}

/// A build or deploy capability that fails a scripted number of times.
#[derive(Debug, Default)]
pub struct ScriptedCapability {
    failures: Mutex<VecDeque<PipelineError>>,
    always_exit_code: Option<i32>,
    calls: AtomicUsize,
}

impl ScriptedCapability {
    /// A capability that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `failures` in order before succeeding.
    #[must_use]
    pub fn with_failures(failures: Vec<PipelineError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            ..Self::default()
        }
    }

    /// Fails every call with a non-zero exit.
    #[must_use]
    pub fn always_failing(exit_code: i32) -> Self {
        Self {
            always_exit_code: Some(exit_code),
            ..Self::default()
        }
    }

    /// Number of invocations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageCapability for ScriptedCapability {
    async fn invoke(&self, _spec: &ServiceSpec, artifact: &ArtifactRef, ctx: &WorkContext) -> Result<ArtifactRef> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.checkpoint()?;

        if let Some(code) = self.always_exit_code {
            return Err(PipelineError::executor_failure(code, "command failed"));
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        Ok(artifact.clone())
    }
}

/// A capability that runs until its job is cancelled.
#[derive(Debug, Default)]
pub struct BlockingCapability {
    started: AtomicUsize,
    running: Notify,
}

impl BlockingCapability {
    /// Creates the capability.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invocations that started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits until an invocation is running.
    pub async fn wait_started(&self) {
        loop {
            let running = self.running.notified();
            if self.started() > 0 {
                return;
            }
            running.await;
        }
    }
}

#[async_trait]
impl StageCapability for BlockingCapability {
    async fn invoke(&self, _spec: &ServiceSpec, _artifact: &ArtifactRef, ctx: &WorkContext) -> Result<ArtifactRef> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.running.notify_waiters();

        ctx.cancel_token().cancelled().await;
        Err(PipelineError::Cancelled(
            ctx.cancel_token().reason().unwrap_or_else(|| "cancelled".to_string()),
        ))
    }
}

/// Teardown call: service, artifact, stage reached.
pub type TeardownCall = (String, Option<ArtifactRef>, Stage);

/// A teardown that records its calls.
#[derive(Debug, Default)]
pub struct RecordingTeardown {
    calls: Mutex<Vec<TeardownCall>>,
    fail: bool,
}

impl RecordingTeardown {
    /// A teardown that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A teardown that always fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<TeardownCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TeardownCapability for RecordingTeardown {
    async fn teardown(&self, spec: &ServiceSpec, artifact: Option<&ArtifactRef>, stage_reached: Stage) -> Result<()> {
        self.calls
            .lock()
            .push((spec.name.clone(), artifact.cloned(), stage_reached));
        if self.fail {
            return Err(PipelineError::store(format!("could not remove {}", spec.name)));
        }
        Ok(())
    }
}
