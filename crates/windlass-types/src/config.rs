//! Inference configuration, immutable for the lifetime of a run.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Which model runtime the workers host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// llama.cpp weights loaded from a GGUF file (requires the
    /// `llama-cpp` cargo feature in the worker binary).
    LlamaCpp,
    /// Deterministic in-process text generator. No weights required;
    /// used by the test suites and smoke deployments.
    Synthetic,
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llama-cpp" | "llama_cpp" => Ok(RuntimeKind::LlamaCpp),
            "synthetic" => Ok(RuntimeKind::Synthetic),
            other => Err(format!("unknown runtime kind: {other}")),
        }
    }
}

/// Runtime configuration for the whole control plane.
///
/// Every field except `model_path` has a default so a one-line
/// `InferenceConfig::new("model.gguf")` works out of the box.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Path to the main model weights.
    pub model_path: PathBuf,

    /// When set, a dedicated worker slot is spawned for summarisation
    /// with its own (usually smaller) model. When unset, the summariser
    /// shares worker 0 and its model replica.
    pub summarizer_model_path: Option<PathBuf>,

    /// Context window size in tokens; the `C` of all budget arithmetic.
    pub context_size: u32,

    /// Forwarded to the model loader; -1 offloads every layer.
    pub n_gpu_layers: i32,

    /// Number of main workers, each hosting one model replica.
    pub worker_count: usize,

    /// Hard cap enforced on session creation, per worker.
    pub max_sessions_per_worker: usize,

    /// Optional address-space cap applied to each worker at spawn.
    pub max_memory_bytes_per_worker: Option<u64>,

    /// Pool backpressure: maximum concurrently in-flight requests.
    /// `None` means unbounded.
    pub max_in_flight: Option<usize>,

    /// Thread-count hint exported to numeric libraries inside workers.
    pub blas_threads: usize,

    /// Select the shared-memory result transport instead of JSON-over-IPC.
    pub use_shared_memory: bool,

    /// Per-session shared result buffer size in bytes.
    pub shared_memory_slot_size: usize,

    /// Override for the worker executable. Defaults to a `windlass-worker`
    /// binary next to the current executable.
    pub worker_executable_path: Option<PathBuf>,

    /// Extra dynamic-library search path exported to worker processes.
    pub worker_library_path: Option<PathBuf>,

    /// Which model runtime the workers host.
    pub runtime: RuntimeKind,

    /// When set, workers write a rolling file log into this directory.
    pub log_dir: Option<PathBuf>,
}

impl InferenceConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            summarizer_model_path: None,
            context_size: 4096,
            n_gpu_layers: -1,
            worker_count: 2,
            max_sessions_per_worker: 8,
            max_memory_bytes_per_worker: None,
            max_in_flight: Some(16),
            blas_threads: 1,
            use_shared_memory: false,
            shared_memory_slot_size: 65_536,
            worker_executable_path: None,
            worker_library_path: None,
            runtime: RuntimeKind::LlamaCpp,
            log_dir: None,
        }
    }

    /// Build a configuration from `WINDLASS_*` environment variables,
    /// falling back to the defaults of [`InferenceConfig::new`].
    pub fn from_env() -> Self {
        let mut cfg = Self::new(env_or("WINDLASS_MODEL_PATH", ""));
        cfg.summarizer_model_path = std::env::var("WINDLASS_SUMMARIZER_MODEL_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        cfg.context_size = parse_env("WINDLASS_CONTEXT_SIZE", cfg.context_size);
        cfg.n_gpu_layers = parse_env("WINDLASS_N_GPU_LAYERS", cfg.n_gpu_layers);
        cfg.worker_count = parse_env("WINDLASS_WORKER_COUNT", cfg.worker_count);
        cfg.max_sessions_per_worker =
            parse_env("WINDLASS_MAX_SESSIONS_PER_WORKER", cfg.max_sessions_per_worker);
        cfg.max_memory_bytes_per_worker = std::env::var("WINDLASS_MAX_MEMORY_BYTES_PER_WORKER")
            .ok()
            .and_then(|v| v.parse().ok());
        cfg.max_in_flight = match std::env::var("WINDLASS_MAX_IN_FLIGHT") {
            Ok(v) if v.eq_ignore_ascii_case("unbounded") => None,
            Ok(v) => v.parse().ok().map(Some).unwrap_or(cfg.max_in_flight),
            Err(_) => cfg.max_in_flight,
        };
        cfg.blas_threads = parse_env("WINDLASS_BLAS_THREADS", cfg.blas_threads);
        cfg.use_shared_memory = std::env::var("WINDLASS_USE_SHARED_MEMORY")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(cfg.use_shared_memory);
        cfg.shared_memory_slot_size =
            parse_env("WINDLASS_SHARED_MEMORY_SLOT_SIZE", cfg.shared_memory_slot_size);
        cfg.worker_executable_path = std::env::var("WINDLASS_WORKER_EXECUTABLE")
            .ok()
            .map(PathBuf::from);
        cfg.worker_library_path = std::env::var("WINDLASS_WORKER_LIBRARY_PATH")
            .ok()
            .map(PathBuf::from);
        cfg.runtime = std::env::var("WINDLASS_RUNTIME")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.runtime);
        cfg.log_dir = std::env::var("WINDLASS_LOG_DIR").ok().map(PathBuf::from);
        cfg
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.worker_count == 0 {
            return Err(ControlError::invalid_config("worker_count must be > 0"));
        }
        if self.max_sessions_per_worker == 0 {
            return Err(ControlError::invalid_config(
                "max_sessions_per_worker must be > 0",
            ));
        }
        if self.context_size == 0 {
            return Err(ControlError::invalid_config("context_size must be > 0"));
        }
        // Room for the length prefix plus a minimal JSON object.
        if self.shared_memory_slot_size < 8 {
            return Err(ControlError::invalid_config(
                "shared_memory_slot_size must be at least 8 bytes",
            ));
        }
        if self.runtime == RuntimeKind::LlamaCpp && self.model_path.as_os_str().is_empty() {
            return Err(ControlError::invalid_config(
                "model_path is required for the llama-cpp runtime",
            ));
        }
        Ok(())
    }

    /// The slice of this configuration a worker needs to host the main
    /// session kernel.
    pub fn main_kernel_config(&self) -> WorkerRuntimeConfig {
        WorkerRuntimeConfig {
            model_path: Some(self.model_path.clone()),
            context_size: self.context_size,
            n_gpu_layers: self.n_gpu_layers,
            blas_threads: self.blas_threads,
            runtime: self.runtime,
        }
    }

    /// As [`Self::main_kernel_config`], for the summariser slot.
    pub fn summarizer_kernel_config(&self) -> WorkerRuntimeConfig {
        WorkerRuntimeConfig {
            model_path: self
                .summarizer_model_path
                .clone()
                .or_else(|| Some(self.model_path.clone())),
            context_size: self.context_size,
            n_gpu_layers: self.n_gpu_layers,
            blas_threads: self.blas_threads,
            runtime: self.runtime,
        }
    }
}

/// The portion of the configuration shipped to a worker at kernel install.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRuntimeConfig {
    pub model_path: Option<PathBuf>,
    pub context_size: u32,
    pub n_gpu_layers: i32,
    pub blas_threads: usize,
    pub runtime: RuntimeKind,
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
