//! Worker lifecycle management.
//!
//! The manager owns the registry of live workers, spawns their programs via
//! the executor capability, and runs each worker's stdout pipeline under a
//! cancellable group. Workers move `Created → Running` and end in exactly
//! one terminal state; terminal states are final. The pipeline never holds
//! a reference back to the manager — it is handed only the stdout handle,
//! the subject to publish on, and the bus.

pub mod pipeline;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::codec::{self, Content};
use crate::executor::{Executor, ProgramSpec};
use crate::subject;

/// How long a stopped worker gets to deliver its exit status before it is
/// reported as terminated.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// How long `stop`/`destroy` wait for the supervisor to record a terminal
/// state.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Depth of the per-worker stdin queue.
const STDIN_DEPTH: usize = 64;

/// Lifecycle state of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Created,
    Running,
    Exited(i64),
    Failed(String),
    Terminated,
}

impl WorkerStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Failed(_) | Self::Terminated)
    }

    /// Exit code for the legacy Execute reply. Non-exit terminals map to -1.
    pub const fn exit_code(&self) -> i64 {
        match self {
            Self::Exited(code) => *code,
            _ => -1,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited({code})"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Snapshot returned by `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub file: String,
    pub status: WorkerStatus,
}

struct WorkerEntry {
    file: String,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    status: watch::Receiver<WorkerStatus>,
}

/// Owns all workers for one agent instance.
///
/// The registry is mutated by potentially concurrent RPC handlers and is
/// guarded by a single mutex; each worker's stdout handle and program
/// instance are exclusively owned by that worker's tasks.
pub struct WorkerManager {
    agent_id: String,
    bus: Arc<dyn Bus>,
    executor: Arc<dyn Executor>,
    chunk_size: usize,
    cancel: CancellationToken,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    next_worker: AtomicU64,
}

impl WorkerManager {
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn Bus>,
        executor: Arc<dyn Executor>,
        chunk_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            executor,
            chunk_size,
            cancel,
            workers: Mutex::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Start a new worker for `spec` and return its identifier.
    ///
    /// Validates the program reference, spawns the program, registers the
    /// worker as running, and starts its stdout pipeline. An executor start
    /// failure is returned to the caller and leaves no registry entry.
    pub async fn create(&self, spec: ProgramSpec) -> Result<String> {
        anyhow::ensure!(!spec.file.is_empty(), "program reference is empty");

        let worker_id = format!("w{:08x}", self.next_worker.fetch_add(1, Ordering::Relaxed));

        let program = self
            .executor
            .spawn(&spec)
            .await
            .with_context(|| format!("failed to start worker program '{}'", spec.file))?;

        let token = self.cancel.child_token();

        // Stdin drain: one task per worker feeding the program's input sink.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(STDIN_DEPTH);
        let mut stdin = program.stdin;
        let stdin_token = token.clone();
        let stdin_worker = worker_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = stdin_rx.recv() => match maybe {
                        Some(bytes) => {
                            if let Err(e) = stdin.write_all(&bytes).await {
                                warn!(worker = %stdin_worker, error = %e, "Stdin write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    () = stdin_token.cancelled() => break,
                }
            }
        });

        let (status_tx, status_rx) = watch::channel(WorkerStatus::Running);

        {
            let mut workers = self.workers.lock().await;
            workers.insert(
                worker_id.clone(),
                WorkerEntry {
                    file: spec.file.clone(),
                    stdin_tx,
                    cancel: token.clone(),
                    status: status_rx,
                },
            );
        }

        let group = pipeline::start(
            program.stdout,
            worker_id.clone(),
            subject::worker_write_stdout(&self.agent_id, &worker_id),
            Arc::clone(&self.bus),
            self.chunk_size,
            &token,
        );

        // Supervisor: waits out the pipeline, resolves the terminal state,
        // and publishes status updates.
        let status_subject = subject::worker_update_status(&self.agent_id, &worker_id);
        let bus = Arc::clone(&self.bus);
        let supervised_id = worker_id.clone();
        let mut program_status = program.status;
        tokio::spawn(async move {
            publish_status(&bus, &status_subject, &supervised_id, &WorkerStatus::Running).await;

            let pipeline_result = group.wait().await;

            let final_status = if let Err(e) = pipeline_result {
                WorkerStatus::Failed(format!("{e:#}"))
            } else {
                tokio::select! {
                    status = &mut program_status => match status {
                        Ok(s) => WorkerStatus::Exited(s.code),
                        Err(_) => WorkerStatus::Failed("executor dropped without a status".to_string()),
                    },
                    () = token.cancelled() => {
                        match tokio::time::timeout(STOP_GRACE, &mut program_status).await {
                            Ok(Ok(s)) => WorkerStatus::Exited(s.code),
                            _ => WorkerStatus::Terminated,
                        }
                    }
                }
            };

            info!(worker = %supervised_id, status = %final_status, "Worker reached terminal state");
            publish_status(&bus, &status_subject, &supervised_id, &final_status).await;
            status_tx.send_replace(final_status);
            // All pipeline stages have stopped; cancelling now only releases
            // the stdin drain task.
            token.cancel();
        });

        info!(worker = %worker_id, file = %spec.file, "Created worker");
        Ok(worker_id)
    }

    /// Snapshot of a worker's file and status.
    pub async fn get(&self, worker_id: &str) -> Result<WorkerInfo> {
        let workers = self.workers.lock().await;
        let entry = workers
            .get(worker_id)
            .with_context(|| format!("no such worker: {worker_id}"))?;
        // The watch ref must not outlive the registry guard.
        let status = entry.status.borrow().clone();
        Ok(WorkerInfo {
            worker_id: worker_id.to_string(),
            file: entry.file.clone(),
            status,
        })
    }

    /// Cancel a worker's group and report its last known exit status, or
    /// `Terminated` if none was produced.
    pub async fn stop(&self, worker_id: &str) -> Result<WorkerStatus> {
        let (cancel, status_rx) = {
            let workers = self.workers.lock().await;
            let entry = workers
                .get(worker_id)
                .with_context(|| format!("no such worker: {worker_id}"))?;
            (entry.cancel.clone(), entry.status.clone())
        };

        cancel.cancel();
        let status = wait_terminal(status_rx, STOP_WAIT).await;
        debug!(worker = %worker_id, status = %status, "Stopped worker");
        Ok(status)
    }

    /// Stop a worker and remove it from the registry.
    pub async fn destroy(&self, worker_id: &str) -> Result<WorkerStatus> {
        let status = self.stop(worker_id).await?;
        self.workers.lock().await.remove(worker_id);
        info!(worker = %worker_id, "Destroyed worker");
        Ok(status)
    }

    /// Wait for a worker's terminal state and return it (legacy Execute
    /// path: the caller replies with the exit code).
    pub async fn wait(&self, worker_id: &str) -> Result<WorkerStatus> {
        let status_rx = {
            let workers = self.workers.lock().await;
            workers
                .get(worker_id)
                .with_context(|| format!("no such worker: {worker_id}"))?
                .status
                .clone()
        };

        let mut status_rx = status_rx;
        loop {
            let current = status_rx.borrow_and_update().clone();
            if current.is_terminal() {
                return Ok(current);
            }
            status_rx
                .changed()
                .await
                .context("worker supervisor went away")?;
        }
    }

    /// Forward raw bytes to a worker's stdin queue. Unknown workers drop
    /// the payload with a warning; stdin traffic carries no reply.
    pub async fn forward_stdin(&self, worker_id: &str, payload: &[u8]) {
        let stdin_tx = {
            let workers = self.workers.lock().await;
            workers.get(worker_id).map(|e| e.stdin_tx.clone())
        };

        match stdin_tx {
            Some(tx) => {
                if tx.send(payload.to_vec()).await.is_err() {
                    warn!(worker = %worker_id, "Stdin queue closed, dropping payload");
                }
            }
            None => warn!(worker = %worker_id, "Stdin for unknown worker, dropping payload"),
        }
    }

    /// Cancel every worker and wait for their terminal states. Called on
    /// agent shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, CancellationToken, watch::Receiver<WorkerStatus>)> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .map(|(id, e)| (id.clone(), e.cancel.clone(), e.status.clone()))
                .collect()
        };

        for (id, cancel, status_rx) in entries {
            cancel.cancel();
            let status = wait_terminal(status_rx, STOP_WAIT).await;
            info!(worker = %id, status = %status, "Worker shut down");
        }
        self.workers.lock().await.clear();
    }
}

async fn wait_terminal(
    mut status_rx: watch::Receiver<WorkerStatus>,
    limit: Duration,
) -> WorkerStatus {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let current = status_rx.borrow_and_update().clone();
        if current.is_terminal() {
            return current;
        }
        match tokio::time::timeout_at(deadline, status_rx.changed()).await {
            Ok(Ok(())) => {}
            // Supervisor gone or deadline passed: report what we know.
            Ok(Err(_)) | Err(_) => return WorkerStatus::Terminated,
        }
    }
}

async fn publish_status(bus: &Arc<dyn Bus>, subject: &str, worker_id: &str, status: &WorkerStatus) {
    let frame = codec::encode_content(&Content::UpdateWorkerStatus {
        worker_id: worker_id.to_string(),
        status: status.to_string(),
    });
    match frame {
        Ok(bytes) => {
            if let Err(e) = bus.publish(subject, bytes.into()).await {
                warn!(subject = %subject, error = %e, "Status publish failed");
            }
        }
        Err(e) => warn!(error = %e, "Status encode failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::executor::{ExitStatus, RunningProgram};
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;

    /// Executor whose programs are driven by the test: the test holds the
    /// stdout writer, a stdin reader, and the status sender.
    struct ScriptedExecutor {
        handles: Mutex<Vec<ProgramHandles>>,
    }

    struct ProgramHandles {
        stdout_tx: DuplexStream,
        stdin_rx: DuplexStream,
        status_tx: oneshot::Sender<ExitStatus>,
    }

    impl ScriptedExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handles: Mutex::new(Vec::new()),
            })
        }

        async fn take_handles(&self) -> ProgramHandles {
            self.handles.lock().await.pop().expect("no spawned program")
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn spawn(&self, spec: &ProgramSpec) -> Result<RunningProgram> {
            anyhow::ensure!(spec.file != "/fail", "scripted spawn failure");

            let (stdout_tx, stdout_rx) = tokio::io::duplex(1024);
            let (stdin_tx, stdin_rx) = tokio::io::duplex(1024);
            let (status_tx, status_rx) = oneshot::channel();

            self.handles.lock().await.push(ProgramHandles {
                stdout_tx,
                stdin_rx,
                status_tx,
            });

            Ok(RunningProgram {
                stdin: Box::new(stdin_tx),
                stdout: Box::new(stdout_rx),
                status: status_rx,
            })
        }
    }

    fn manager_with(executor: Arc<ScriptedExecutor>) -> (Arc<WorkerManager>, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let manager = Arc::new(WorkerManager::new(
            "agent1",
            bus.clone(),
            executor,
            1024,
            CancellationToken::new(),
        ));
        (manager, bus)
    }

    fn spec(file: &str) -> ProgramSpec {
        ProgramSpec {
            file: file.to_string(),
            args: vec![],
            env: vec![],
        }
    }

    #[tokio::test]
    async fn create_rejects_empty_program() {
        let (manager, _bus) = manager_with(ScriptedExecutor::new());
        assert!(manager.create(spec("")).await.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_registry_entry() {
        let executor = ScriptedExecutor::new();
        let (manager, _bus) = manager_with(executor);
        assert!(manager.create(spec("/fail")).await.is_err());
        // Nothing to get: the failed create never registered a worker.
        assert!(manager.get("w00000001").await.is_err());
    }

    #[tokio::test]
    async fn worker_runs_then_exits_with_code() {
        let executor = ScriptedExecutor::new();
        let (manager, _bus) = manager_with(executor.clone());

        let worker_id = manager.create(spec("/bin/task")).await.unwrap();
        let handles = executor.take_handles().await;

        let info = manager.get(&worker_id).await.unwrap();
        assert_eq!(info.status, WorkerStatus::Running);
        assert_eq!(info.file, "/bin/task");

        // Close stdout (EOF) and deliver the exit status.
        drop(handles.stdout_tx);
        handles.status_tx.send(ExitStatus { code: 7 }).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(2), manager.wait(&worker_id))
            .await
            .expect("worker did not reach a terminal state")
            .unwrap();
        assert_eq!(status, WorkerStatus::Exited(7));
        assert_eq!(status.exit_code(), 7);
    }

    #[tokio::test]
    async fn status_updates_are_published() {
        let executor = ScriptedExecutor::new();
        let (manager, bus) = manager_with(executor.clone());
        let mut rx = bus
            .subscribe(&subject::worker_update_status("agent1", "w00000001"))
            .await
            .unwrap();

        let worker_id = manager.create(spec("/bin/task")).await.unwrap();
        assert_eq!(worker_id, "w00000001");
        let handles = executor.take_handles().await;
        drop(handles.stdout_tx);
        handles.status_tx.send(ExitStatus { code: 0 }).unwrap();
        manager.wait(&worker_id).await.unwrap();

        let running = rx.recv().await.unwrap();
        match codec::decode_content(&running.payload).unwrap() {
            Content::UpdateWorkerStatus { status, .. } => assert_eq!(status, "running"),
            other => panic!("unexpected content: {other:?}"),
        }
        let exited = rx.recv().await.unwrap();
        match codec::decode_content(&exited.payload).unwrap() {
            Content::UpdateWorkerStatus { status, .. } => assert_eq!(status, "exited(0)"),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdout_chunks_stream_to_the_bus() {
        let executor = ScriptedExecutor::new();
        let (manager, bus) = manager_with(executor.clone());
        let mut rx = bus
            .subscribe(&subject::worker_write_stdout("agent1", "w00000001"))
            .await
            .unwrap();

        let worker_id = manager.create(spec("/bin/task")).await.unwrap();
        let mut handles = executor.take_handles().await;

        use tokio::io::AsyncWriteExt;
        handles.stdout_tx.write_all(b"output line").await.unwrap();
        drop(handles.stdout_tx);
        handles.status_tx.send(ExitStatus { code: 0 }).unwrap();
        manager.wait(&worker_id).await.unwrap();

        let msg = rx.recv().await.unwrap();
        match codec::decode_content(&msg.payload).unwrap() {
            Content::UpdateWorkerStdio { payload, .. } => assert_eq!(payload, b"output line"),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_before_exit_reports_terminated() {
        let executor = ScriptedExecutor::new();
        let (manager, _bus) = manager_with(executor.clone());

        let worker_id = manager.create(spec("/bin/task")).await.unwrap();
        let handles = executor.take_handles().await;

        // Stream stays open and the status never fires: stop must still
        // resolve, reporting Terminated.
        let status = tokio::time::timeout(Duration::from_secs(10), manager.stop(&worker_id))
            .await
            .expect("stop did not resolve")
            .unwrap();
        assert_eq!(status, WorkerStatus::Terminated);
        drop(handles);
    }

    #[tokio::test]
    async fn stop_after_exit_reports_last_exit_status() {
        let executor = ScriptedExecutor::new();
        let (manager, _bus) = manager_with(executor.clone());

        let worker_id = manager.create(spec("/bin/task")).await.unwrap();
        let handles = executor.take_handles().await;
        drop(handles.stdout_tx);
        handles.status_tx.send(ExitStatus { code: 9 }).unwrap();
        manager.wait(&worker_id).await.unwrap();

        let status = manager.stop(&worker_id).await.unwrap();
        assert_eq!(status, WorkerStatus::Exited(9));
    }

    #[tokio::test]
    async fn destroy_removes_the_registry_entry() {
        let executor = ScriptedExecutor::new();
        let (manager, _bus) = manager_with(executor.clone());

        let worker_id = manager.create(spec("/bin/task")).await.unwrap();
        let handles = executor.take_handles().await;
        drop(handles.stdout_tx);
        handles.status_tx.send(ExitStatus { code: 0 }).unwrap();
        manager.wait(&worker_id).await.unwrap();

        manager.destroy(&worker_id).await.unwrap();
        assert!(manager.get(&worker_id).await.is_err());
    }

    #[tokio::test]
    async fn stdin_reaches_the_program() {
        let executor = ScriptedExecutor::new();
        let (manager, _bus) = manager_with(executor.clone());

        let worker_id = manager.create(spec("/bin/task")).await.unwrap();
        let mut handles = executor.take_handles().await;

        manager.forward_stdin(&worker_id, b"typed input").await;

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), handles.stdin_rx.read(&mut buf))
            .await
            .expect("stdin never arrived")
            .unwrap();
        assert_eq!(&buf[..n], b"typed input");
    }

    #[tokio::test]
    async fn stdin_for_unknown_worker_is_dropped() {
        let (manager, _bus) = manager_with(ScriptedExecutor::new());
        // No panic, no error: the payload is logged and dropped.
        manager.forward_stdin("nope", b"data").await;
    }

    #[tokio::test]
    async fn unknown_worker_operations_error() {
        let (manager, _bus) = manager_with(ScriptedExecutor::new());
        assert!(manager.get("missing").await.is_err());
        assert!(manager.stop("missing").await.is_err());
        assert!(manager.destroy("missing").await.is_err());
        assert!(manager.wait("missing").await.is_err());
    }
}
