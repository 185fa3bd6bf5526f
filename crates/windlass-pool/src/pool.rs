//! The pool façade: startup, kernel installs, call/stream routing,
//! backpressure, health checks, and shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};
use windlass_proto::wire::KernelSpec;
use windlass_proto::{WireRequest, WireResponse};
use windlass_types::{ControlError, ControlResult, InferenceConfig};

use crate::client::{ClientCommand, PendingReply, PoolStream, WorkerClient};
use crate::handle::KernelHandle;
use crate::shared::SharedSlot;
use crate::spawn::{spawn_worker, worker_executable};

const WARMUP_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Auxiliary worker slots spawned next to the main workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuxKind {
    /// Dedicated summariser slot; present when a summariser model is
    /// configured, otherwise the summariser shares worker 0.
    Summarizer,
    /// Slot reserved for the vision-language collaborator's kernel.
    Vision,
    /// Slot reserved for the code-sandbox collaborator's kernel.
    Sandbox,
}

/// Result of a per-worker liveness probe.
#[derive(Clone, Debug)]
pub struct WorkerHealth {
    pub index: usize,
    pub alive: bool,
    pub sessions: usize,
    pub uptime_ms: u64,
}

struct PoolInner {
    config: InferenceConfig,
    clients: Vec<WorkerClient>,
    kill_switches: Mutex<Vec<Option<oneshot::Sender<()>>>>,
    aux_slots: HashMap<AuxKind, usize>,
    main_handles: OnceLock<Vec<KernelHandle>>,
    summarizer_handle: OnceLock<KernelHandle>,
    next_request_id: AtomicU64,
    inflight: Option<Arc<Semaphore>>,
    shutting_down: AtomicBool,
    runtime_dir: PathBuf,
}

/// The worker pool. Cheap to clone; all clones share the workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn the worker processes, warm every one of them up, and install
    /// the kernels. Warm-up always precedes installation; any main-kernel
    /// install failure tears the pool down and surfaces as
    /// *model-load-failed*.
    pub async fn start(config: InferenceConfig) -> ControlResult<WorkerPool> {
        config.validate()?;

        let runtime_dir =
            std::env::temp_dir().join(format!("windlass-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&runtime_dir).map_err(|e| ControlError::ModelLoadFailed {
            message: format!("runtime dir {}: {e}", runtime_dir.display()),
        })?;

        let executable = worker_executable(&config);
        let main_count = config.worker_count;
        let dedicated_summarizer = config.summarizer_model_path.is_some();

        let mut aux_slots = HashMap::new();
        let mut next_slot = main_count;
        if dedicated_summarizer {
            aux_slots.insert(AuxKind::Summarizer, next_slot);
            next_slot += 1;
        }
        aux_slots.insert(AuxKind::Vision, next_slot);
        aux_slots.insert(AuxKind::Sandbox, next_slot + 1);
        let total = next_slot + 2;

        info!(
            workers = main_count,
            aux = total - main_count,
            executable = %executable.display(),
            "starting worker pool"
        );

        let spawned = futures::future::try_join_all(
            (0..total).map(|index| spawn_worker(&config, &executable, &runtime_dir, index)),
        )
        .await?;

        let mut clients = Vec::with_capacity(total);
        let mut kill_switches = Vec::with_capacity(total);
        for (index, worker) in spawned.into_iter().enumerate() {
            debug!(worker = index, pid = worker.pid, "worker process online");
            clients.push(WorkerClient::from_stream(index, worker.stream, worker.exit_rx));
            kill_switches.push(Some(worker.kill_tx));
        }

        let pool = WorkerPool {
            inner: Arc::new(PoolInner {
                inflight: config.max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
                config,
                clients,
                kill_switches: Mutex::new(kill_switches),
                aux_slots,
                main_handles: OnceLock::new(),
                summarizer_handle: OnceLock::new(),
                next_request_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                runtime_dir,
            }),
        };

        if let Err(err) = pool.bring_up(main_count, dedicated_summarizer).await {
            pool.shutdown().await;
            return Err(err);
        }

        info!("worker pool ready");
        Ok(pool)
    }

    async fn bring_up(&self, main_count: usize, dedicated_summarizer: bool) -> ControlResult<()> {
        // Warm-up is deterministic and strictly precedes any install.
        futures::future::try_join_all(
            (0..self.inner.clients.len()).map(|index| self.warmup_worker(index)),
        )
        .await
        .map_err(as_load_failure)?;

        let main_spec = KernelSpec::Session {
            config: self.inner.config.main_kernel_config(),
        };
        let handles = futures::future::try_join_all((0..main_count).map(|index| {
            let spec = main_spec.clone();
            async move {
                let object = self.install_on(index, spec).await?;
                Ok::<_, ControlError>(KernelHandle::new(index, object))
            }
        }))
        .await
        .map_err(as_load_failure)?;
        let _ = self.inner.main_handles.set(handles);

        let summarizer_worker = if dedicated_summarizer {
            self.inner.aux_slots[&AuxKind::Summarizer]
        } else {
            0
        };
        let spec = KernelSpec::Summarizer {
            config: self.inner.config.summarizer_kernel_config(),
        };
        let object = self
            .install_on(summarizer_worker, spec)
            .await
            .map_err(as_load_failure)?;
        let _ = self
            .inner
            .summarizer_handle
            .set(KernelHandle::new(summarizer_worker, object));

        Ok(())
    }

    async fn warmup_worker(&self, index: usize) -> ControlResult<()> {
        match self
            .request(index, |id| WireRequest::Warmup { id }, WARMUP_TIMEOUT)
            .await?
        {
            WireResponse::Value { .. } => {
                debug!(worker = index, "warm-up acknowledged");
                Ok(())
            }
            WireResponse::Exception { exception, .. } => Err(ControlError::ModelLoadFailed {
                message: format!("worker {index} warm-up: {}", exception.message),
            }),
            _ => Err(ControlError::WorkerUnreachable),
        }
    }

    async fn install_on(&self, index: usize, spec: KernelSpec) -> ControlResult<u64> {
        match self
            .request(
                index,
                move |id| WireRequest::Install { id, spec },
                INSTALL_TIMEOUT,
            )
            .await?
        {
            WireResponse::Value { value, .. } => value
                .get("object")
                .and_then(Value::as_u64)
                .ok_or(ControlError::WorkerUnreachable),
            WireResponse::Exception { exception, .. } => Err(ControlError::ModelLoadFailed {
                message: format!("worker {index}: {}", exception.message),
            }),
            _ => Err(ControlError::WorkerUnreachable),
        }
    }

    // ── handles ──────────────────────────────────────────────────────────────

    /// Number of main workers.
    pub fn worker_count(&self) -> usize {
        self.inner.config.worker_count
    }

    /// The session-kernel handle of a main worker.
    pub fn handle(&self, worker: usize) -> ControlResult<KernelHandle> {
        let handles = self
            .inner
            .main_handles
            .get()
            .ok_or(ControlError::PoolNotReady)?;
        handles
            .get(worker)
            .copied()
            .ok_or(ControlError::WorkerUnreachable)
    }

    /// The summariser-kernel handle (dedicated slot or worker 0).
    pub fn summarizer_handle(&self) -> ControlResult<KernelHandle> {
        self.inner
            .summarizer_handle
            .get()
            .copied()
            .ok_or(ControlError::PoolNotReady)
    }

    /// Worker index of an auxiliary slot, when one was spawned.
    pub fn aux_worker(&self, kind: AuxKind) -> Option<usize> {
        self.inner.aux_slots.get(&kind).copied()
    }

    /// Install a collaborator kernel on an auxiliary slot.
    pub async fn install_aux(
        &self,
        kind: AuxKind,
        spec: KernelSpec,
    ) -> ControlResult<KernelHandle> {
        let worker = self
            .aux_worker(kind)
            .ok_or(ControlError::WorkerUnreachable)?;
        let object = self.install_on(worker, spec).await?;
        Ok(KernelHandle::new(worker, object))
    }

    // ── calls and streams ────────────────────────────────────────────────────

    /// RPC a kernel method. The preferred worker is the handle's worker
    /// and is always honoured; if it crashed the crash is reported, never
    /// silently retried.
    pub async fn call(
        &self,
        handle: KernelHandle,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> ControlResult<Value> {
        self.ensure_accepting()?;
        let _permit = self.acquire_permit().await;
        let method = method.to_owned();
        match self
            .request(
                handle.worker,
                move |id| WireRequest::Call {
                    id,
                    object: handle.object,
                    method,
                    args,
                },
                timeout,
            )
            .await?
        {
            WireResponse::Value { value, .. } => Ok(value),
            WireResponse::Exception { exception, .. } => Err(ControlError::KernelException {
                index: handle.worker,
                kind: exception.kind,
                message: exception.message,
                traceback: exception.traceback,
            }),
            _ => Err(ControlError::WorkerUnreachable),
        }
    }

    /// Open a decode stream. The returned stream owns a backpressure
    /// permit until it is dropped.
    pub async fn stream(
        &self,
        handle: KernelHandle,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> ControlResult<PoolStream> {
        self.ensure_accepting()?;
        let permit = self.acquire_permit().await;
        let client = self.client(handle.worker)?.clone();
        let id = self.next_id();
        let (frames_tx, frames_rx) = mpsc::channel(64);
        client
            .send(ClientCommand::Request {
                frame: WireRequest::StreamOpen {
                    id,
                    object: handle.object,
                    method: method.to_owned(),
                    args,
                },
                reply: PendingReply::Stream(frames_tx),
            })
            .await?;
        Ok(PoolStream {
            id,
            frames: frames_rx,
            client,
            timeout,
            _permit: permit,
        })
    }

    /// Allocate a shared result slot in the pool's runtime directory.
    pub fn shared_buffer(&self) -> ControlResult<SharedSlot> {
        SharedSlot::create(
            &self.inner.runtime_dir,
            self.inner.config.shared_memory_slot_size,
        )
    }

    /// Read a shared slot under a scoped borrow.
    pub fn with_shared_buffer<R>(&self, slot: &SharedSlot, f: impl FnOnce(&[u8]) -> R) -> R {
        slot.with_bytes(f)
    }

    /// Per-worker liveness probe across every slot.
    pub async fn health_check(&self) -> Vec<WorkerHealth> {
        let mut report = Vec::with_capacity(self.inner.clients.len());
        for index in 0..self.inner.clients.len() {
            let health = match self
                .request(index, |id| WireRequest::Health { id }, HEALTH_TIMEOUT)
                .await
            {
                Ok(WireResponse::Pong {
                    sessions,
                    uptime_ms,
                    ..
                }) => WorkerHealth {
                    index,
                    alive: true,
                    sessions,
                    uptime_ms,
                },
                _ => WorkerHealth {
                    index,
                    alive: false,
                    sessions: 0,
                    uptime_ms: 0,
                },
            };
            report.push(health);
        }
        report
    }

    /// Stop accepting requests, ask workers to drain, then terminate any
    /// stragglers.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for client in &self.inner.clients {
            let _ = client.send(ClientCommand::Shutdown).await;
        }
        for client in &self.inner.clients {
            if !client.wait_exit(SHUTDOWN_GRACE).await {
                warn!(worker = client.index, "worker ignored shutdown; killing");
                if let Some(kill) = self
                    .inner
                    .kill_switches
                    .lock()
                    .expect("kill switch lock")
                    .get_mut(client.index)
                    .and_then(Option::take)
                {
                    let _ = kill.send(());
                }
                client.wait_exit(SHUTDOWN_GRACE).await;
            }
        }
        let _ = std::fs::remove_dir_all(&self.inner.runtime_dir);
        info!("worker pool stopped");
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn ensure_accepting(&self) -> ControlResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ControlError::PoolShuttingDown);
        }
        Ok(())
    }

    async fn acquire_permit(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match &self.inner.inflight {
            // Suspends (without busy-waiting) once max_in_flight requests
            // are outstanding.
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn client(&self, worker: usize) -> ControlResult<&WorkerClient> {
        self.inner
            .clients
            .get(worker)
            .ok_or(ControlError::WorkerUnreachable)
    }

    async fn request(
        &self,
        worker: usize,
        build: impl FnOnce(u64) -> WireRequest,
        timeout: Duration,
    ) -> ControlResult<WireResponse> {
        let client = self.client(worker)?;
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        client
            .send(ClientCommand::Request {
                frame: build(id),
                reply: PendingReply::Call(tx),
            })
            .await?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                let _ = client.send(ClientCommand::Abandon { id }).await;
                Err(ControlError::Timeout { sid: None })
            }
            Ok(Err(_)) => Err(client.disconnect_error()),
            Ok(Ok(result)) => result,
        }
    }
}

fn as_load_failure(err: ControlError) -> ControlError {
    match err {
        already @ ControlError::ModelLoadFailed { .. } => already,
        ControlError::KernelException { message, .. } => {
            ControlError::ModelLoadFailed { message }
        }
        other => ControlError::ModelLoadFailed {
            message: other.to_string(),
        },
    }
}
