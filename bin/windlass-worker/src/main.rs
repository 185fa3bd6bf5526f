//! windlass-worker – the worker executable spawned by the pool.
//!
//! Startup order:
//! 1. Parse the command line.
//! 2. Initialise tracing (rolling file log when `--log-dir` is given,
//!    stderr otherwise; the pool drains stderr into its own log).
//! 3. Connect back to the pool's socket and send the hello frame.
//! 4. Serve requests: a dedicated kernel thread executes them one at a
//!    time, which is what serialises everything touching this worker's
//!    model replica; the async side stays responsive for health probes
//!    and stream cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windlass_kernel::host::KernelHost;
use windlass_proto::wire::{encode_line, KernelSpec};
use windlass_proto::{WireRequest, WireResponse, WorkerHello};

#[derive(Debug, Parser)]
#[command(name = "windlass-worker", about = "windlass inference worker")]
struct Args {
    /// Unix-domain socket the pool is listening on.
    #[arg(long)]
    socket: PathBuf,

    /// Index of this worker slot.
    #[arg(long, default_value_t = 0)]
    worker_index: usize,

    /// Directory for the rolling file log; stderr when omitted.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Tracing filter, e.g. "info" or "debug,windlass_kernel=trace".
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// One unit of work for the kernel thread.
enum KernelJob {
    Warmup {
        id: u64,
    },
    Install {
        id: u64,
        spec: KernelSpec,
    },
    Call {
        id: u64,
        object: u64,
        method: String,
        args: serde_json::Value,
    },
    Stream {
        id: u64,
        object: u64,
        method: String,
        args: serde_json::Value,
        cancel: Arc<AtomicBool>,
    },
}

type CancelRegistry = Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (writer, _guard) = match &args.log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(
            dir,
            format!("windlass-worker-{}.log", args.worker_index),
        )),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    info!(
        worker = args.worker_index,
        socket = %args.socket.display(),
        "windlass-worker starting"
    );

    let stream = UnixStream::connect(&args.socket).await?;
    serve(stream, args.worker_index).await?;

    info!(worker = args.worker_index, "windlass-worker stopped");
    Ok(())
}

async fn serve(stream: UnixStream, worker_index: usize) -> anyhow::Result<()> {
    let started = Instant::now();
    let (read_half, mut write_half) = stream.into_split();

    // Hello frame first; the pool will not speak until it arrives.
    let hello = WorkerHello {
        worker_index,
        pid: std::process::id(),
    };
    write_half.write_all(encode_line(&hello)?.as_bytes()).await?;

    // Outbound frames from both the kernel thread and the async side.
    let (out_tx, mut out_rx) = mpsc::channel::<WireResponse>(64);
    tokio::spawn(async move {
        while let Some(response) = out_rx.recv().await {
            match encode_line(&response) {
                Ok(line) => {
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode response frame"),
            }
        }
    });

    // The kernel thread: one request at a time, in arrival order.
    let (job_tx, job_rx) = std::sync::mpsc::channel::<KernelJob>();
    let session_count = Arc::new(AtomicUsize::new(0));
    let cancels: CancelRegistry = Arc::new(Mutex::new(HashMap::new()));
    {
        let out_tx = out_tx.clone();
        let session_count = Arc::clone(&session_count);
        let cancels = Arc::clone(&cancels);
        std::thread::Builder::new()
            .name(format!("windlass-kernel-{worker_index}"))
            .spawn(move || kernel_thread(job_rx, out_tx, session_count, cancels))?;
    }

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: WireRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable request frame");
                continue;
            }
        };

        match request {
            WireRequest::Shutdown => {
                info!("shutdown requested; draining");
                break;
            }
            WireRequest::Health { id } => {
                // Answered from the async side so a long decode never
                // makes the worker look dead.
                let _ = out_tx
                    .send(WireResponse::Pong {
                        id,
                        worker_index,
                        sessions: session_count.load(Ordering::Relaxed),
                        uptime_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
            }
            WireRequest::StreamCancel { id } => {
                if let Some(flag) = cancels.lock().expect("cancel registry").get(&id) {
                    debug!(stream = id, "cancellation requested");
                    flag.store(true, Ordering::Relaxed);
                }
            }
            WireRequest::Warmup { id } => {
                let _ = job_tx.send(KernelJob::Warmup { id });
            }
            WireRequest::Install { id, spec } => {
                let _ = job_tx.send(KernelJob::Install { id, spec });
            }
            WireRequest::Call {
                id,
                object,
                method,
                args,
            } => {
                let _ = job_tx.send(KernelJob::Call {
                    id,
                    object,
                    method,
                    args,
                });
            }
            WireRequest::StreamOpen {
                id,
                object,
                method,
                args,
            } => {
                let cancel = Arc::new(AtomicBool::new(false));
                cancels
                    .lock()
                    .expect("cancel registry")
                    .insert(id, Arc::clone(&cancel));
                let _ = job_tx.send(KernelJob::Stream {
                    id,
                    object,
                    method,
                    args,
                    cancel,
                });
            }
        }
    }

    Ok(())
}

fn kernel_thread(
    job_rx: std::sync::mpsc::Receiver<KernelJob>,
    out_tx: mpsc::Sender<WireResponse>,
    session_count: Arc<AtomicUsize>,
    cancels: CancelRegistry,
) {
    let mut host = KernelHost::new();

    while let Ok(job) = job_rx.recv() {
        match job {
            KernelJob::Warmup { id } => {
                let response = match host.warmup() {
                    Ok(()) => WireResponse::Value {
                        id,
                        value: serde_json::json!({}),
                    },
                    Err(exception) => WireResponse::Exception { id, exception },
                };
                let _ = out_tx.blocking_send(response);
            }
            KernelJob::Install { id, spec } => {
                let response = match host.install(spec) {
                    Ok(object) => WireResponse::Value {
                        id,
                        value: serde_json::json!({"object": object}),
                    },
                    Err(exception) => WireResponse::Exception { id, exception },
                };
                let _ = out_tx.blocking_send(response);
            }
            KernelJob::Call {
                id,
                object,
                method,
                args,
            } => {
                let response = match host.call(object, &method, args) {
                    Ok(value) => WireResponse::Value { id, value },
                    Err(exception) => WireResponse::Exception { id, exception },
                };
                let _ = out_tx.blocking_send(response);
            }
            KernelJob::Stream {
                id,
                object,
                method,
                args,
                cancel,
            } => {
                let result = host.stream(object, &method, args, &mut |event| {
                    if cancel.load(Ordering::Relaxed) {
                        return false;
                    }
                    match serde_json::to_value(&event) {
                        Ok(value) => out_tx.blocking_send(WireResponse::Chunk { id, value }).is_ok(),
                        Err(_) => false,
                    }
                });
                let terminal = match result {
                    Ok(()) => WireResponse::StreamDone { id },
                    Err(exception) => WireResponse::StreamError { id, exception },
                };
                let _ = out_tx.blocking_send(terminal);
                cancels.lock().expect("cancel registry").remove(&id);
            }
        }
        session_count.store(host.session_count(), Ordering::Relaxed);
    }
}
