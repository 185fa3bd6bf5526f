//! Worker process spawn and handshake.
//!
//! The pool binds one Unix-domain socket per worker slot, spawns the
//! worker executable pointed at it, and waits for the hello frame. A
//! watcher task reaps the child and publishes its exit status; worker
//! stderr is drained into the structured log at debug level so model
//! runtime noise never pollutes the control-plane output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use windlass_proto::WorkerHello;
use windlass_types::{ControlError, InferenceConfig};

use crate::client::ExitStatusCell;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct SpawnedWorker {
    pub stream: UnixStream,
    pub exit_rx: watch::Receiver<ExitStatusCell>,
    /// Fires the watcher's kill path; used by pool shutdown when a
    /// worker outlives its grace period.
    pub kill_tx: oneshot::Sender<()>,
    pub pid: u32,
}

/// Resolve the worker executable: explicit override, then a sibling of
/// the current executable, then `$PATH`.
pub(crate) fn worker_executable(config: &InferenceConfig) -> PathBuf {
    if let Some(path) = &config.worker_executable_path {
        return path.clone();
    }
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let sibling = dir.join("windlass-worker");
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    PathBuf::from("windlass-worker")
}

pub(crate) async fn spawn_worker(
    config: &InferenceConfig,
    executable: &Path,
    runtime_dir: &Path,
    index: usize,
) -> Result<SpawnedWorker, ControlError> {
    let socket_path = runtime_dir.join(format!("worker-{index}.sock"));
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).map_err(|e| ControlError::ModelLoadFailed {
        message: format!("bind {}: {e}", socket_path.display()),
    })?;

    let mut command = Command::new(executable);
    command
        .arg("--socket")
        .arg(&socket_path)
        .arg("--worker-index")
        .arg(index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(library_path) = &config.worker_library_path {
        command.env("LD_LIBRARY_PATH", library_path);
    }
    if let Some(log_dir) = &config.log_dir {
        command.arg("--log-dir").arg(log_dir);
    }
    if let Some(limit) = config.max_memory_bytes_per_worker {
        apply_memory_limit(&mut command, limit);
    }

    let mut child = command.spawn().map_err(|e| ControlError::ModelLoadFailed {
        message: format!("spawn {}: {e}", executable.display()),
    })?;
    let pid = child.id().unwrap_or_default();

    drain_stderr(index, &mut child);

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(watch_child(index, child, exit_tx, kill_rx));

    let accepted = tokio::time::timeout(HANDSHAKE_TIMEOUT, listener.accept()).await;
    let (stream, _addr) = match accepted {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            return Err(ControlError::ModelLoadFailed {
                message: format!("worker {index} accept failed: {e}"),
            });
        }
        Err(_) => {
            return Err(ControlError::ModelLoadFailed {
                message: format!("worker {index} did not connect within the handshake window"),
            });
        }
    };

    let hello = read_hello(&stream).await?;
    if hello.worker_index != index {
        return Err(ControlError::ModelLoadFailed {
            message: format!(
                "worker {index} handshake reported index {}",
                hello.worker_index
            ),
        });
    }
    debug!(worker = index, pid = hello.pid, "worker connected");

    Ok(SpawnedWorker {
        stream,
        exit_rx,
        kill_tx,
        pid,
    })
}

/// Forward the address-space cap to the child at exec time.
#[cfg(unix)]
fn apply_memory_limit(command: &mut Command, limit: u64) {
    unsafe {
        command.pre_exec(move || {
            let rlim = libc::rlimit {
                rlim_cur: limit,
                rlim_max: limit,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &rlim) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_memory_limit(_command: &mut Command, _limit: u64) {}

fn drain_stderr(index: usize, child: &mut Child) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "windlass::worker_stderr", worker = index, "{line}");
        }
    });
}

async fn watch_child(
    index: usize,
    mut child: Child,
    exit_tx: watch::Sender<ExitStatusCell>,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            if code != Some(0) {
                warn!(worker = index, exit_code = ?code, "worker exited");
            }
            let _ = exit_tx.send(Some(code));
        }
        _ = kill_rx => {
            let _ = child.kill().await;
            let code = child.wait().await.ok().and_then(|s| s.code());
            let _ = exit_tx.send(Some(code));
        }
    }
}

async fn read_hello(stream: &UnixStream) -> Result<WorkerHello, ControlError> {
    let mut line = String::new();
    loop {
        stream
            .readable()
            .await
            .map_err(|e| ControlError::ModelLoadFailed {
                message: format!("handshake read: {e}"),
            })?;
        let mut buf = [0u8; 256];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                return Err(ControlError::ModelLoadFailed {
                    message: "worker closed the socket during handshake".to_owned(),
                });
            }
            Ok(n) => {
                line.push_str(&String::from_utf8_lossy(&buf[..n]));
                if line.contains('\n') {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                return Err(ControlError::ModelLoadFailed {
                    message: format!("handshake read: {e}"),
                });
            }
        }
    }
    let first_line = line.split('\n').next().unwrap_or_default();
    serde_json::from_str(first_line).map_err(|e| ControlError::ModelLoadFailed {
        message: format!("malformed worker hello: {e}"),
    })
}
