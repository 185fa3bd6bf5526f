//! Dispatch of wire requests onto the kernels installed in this worker.
//!
//! The host is synchronous and single-threaded by design: the worker
//! binary drives it from one dedicated kernel thread, which is what
//! serialises all requests touching this worker's model replica.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use windlass_proto::wire::KernelSpec;
use windlass_proto::{DecodeOutcome, StreamEvent, WireException};
use windlass_types::{ChatMessage, SamplingParams, SessionId};

use crate::error::KernelError;
use crate::runtime::{build_runtime, RuntimeError};
use crate::session::SessionKernel;
use crate::summarize::{SummarizerKernel, DEFAULT_TITLE_MAX_TOKENS};

enum KernelObject {
    Session(SessionKernel),
    Summarizer(SummarizerKernel),
}

pub struct KernelHost {
    next_object: u64,
    objects: HashMap<u64, KernelObject>,
    warmed_up: bool,
}

impl Default for KernelHost {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHost {
    pub fn new() -> Self {
        Self {
            next_object: 1,
            objects: HashMap::new(),
            warmed_up: false,
        }
    }

    /// Deterministic warm-up. Must run before any kernel install.
    pub fn warmup(&mut self) -> Result<(), WireException> {
        self.warmed_up = true;
        info!("worker warm-up complete");
        Ok(())
    }

    /// Install a kernel and return its object id.
    pub fn install(&mut self, spec: KernelSpec) -> Result<u64, WireException> {
        if !self.warmed_up {
            return Err(WireException::new(
                "not_warmed_up",
                "kernel install attempted before warm-up",
            ));
        }
        let object = match spec {
            KernelSpec::Session { config } => {
                let runtime = build_runtime(&config).map_err(load_exception)?;
                KernelObject::Session(SessionKernel::new(runtime))
            }
            KernelSpec::Summarizer { config } => {
                let runtime = build_runtime(&config).map_err(load_exception)?;
                KernelObject::Summarizer(SummarizerKernel::new(runtime))
            }
        };
        let id = self.next_object;
        self.next_object += 1;
        self.objects.insert(id, object);
        info!(object = id, "kernel installed");
        Ok(id)
    }

    /// Number of sessions across all installed session kernels, for the
    /// health probe.
    pub fn session_count(&self) -> usize {
        self.objects
            .values()
            .map(|o| match o {
                KernelObject::Session(k) => k.session_count(),
                KernelObject::Summarizer(_) => 0,
            })
            .sum()
    }

    /// Invoke a unary method on an installed kernel.
    pub fn call(&mut self, object: u64, method: &str, args: Value) -> Result<Value, WireException> {
        debug!(object, method, "kernel call");
        match self.objects.get_mut(&object) {
            None => Err(WireException::new(
                "object_not_found",
                format!("no kernel object {object}"),
            )),
            Some(KernelObject::Session(kernel)) => session_call(kernel, method, args),
            Some(KernelObject::Summarizer(kernel)) => summarizer_call(kernel, method, args),
        }
    }

    /// Drive a streaming method, emitting events in order. `emit`
    /// returning `false` cancels the generation.
    pub fn stream(
        &mut self,
        object: u64,
        method: &str,
        args: Value,
        emit: &mut dyn FnMut(StreamEvent) -> bool,
    ) -> Result<(), WireException> {
        let kernel = match self.objects.get_mut(&object) {
            Some(KernelObject::Session(kernel)) => kernel,
            Some(KernelObject::Summarizer(_)) => {
                return Err(WireException::new(
                    "unsupported_stream",
                    "the summarizer kernel has no streaming methods",
                ));
            }
            None => {
                return Err(WireException::new(
                    "object_not_found",
                    format!("no kernel object {object}"),
                ));
            }
        };
        if method != "decode_stream" {
            return Err(WireException::new(
                "unknown_method",
                format!("unknown streaming method: {method}"),
            ));
        }

        let args: DecodeArgs = parse_args(args)?;
        let run = kernel
            .decode_stream(&args.session_id, &args.params, &mut |delta| {
                emit(StreamEvent::Delta {
                    delta: delta.to_owned(),
                })
            })
            .map_err(kernel_exception)?;

        let _ = emit(StreamEvent::Done {
            finish_reason: run.finish_reason,
            prompt_tokens: run.prompt_tokens,
            completion_tokens: run.completion_tokens,
            prefill_ms: run.ttft_ms,
            decode_ms: run.total_ms.saturating_sub(run.ttft_ms),
            text: run.text,
            thinking: run.thinking,
        });
        Ok(())
    }
}

// ── unary dispatch ───────────────────────────────────────────────────────────

fn session_call(
    kernel: &mut SessionKernel,
    method: &str,
    args: Value,
) -> Result<Value, WireException> {
    match method {
        "create_session" => {
            let args: CreateArgs = parse_args(args)?;
            let outcome = kernel.create_session(args.session_id, args.system_prompt);
            to_value(&outcome)
        }
        "prefill" => {
            let args: PrefillArgs = parse_args(args)?;
            let outcome = kernel
                .prefill(&args.session_id, &args.prompt)
                .map_err(kernel_exception)?;
            to_value(&outcome)
        }
        "decode" => {
            let args: DecodeArgs = parse_args(args)?;
            let outcome = kernel
                .decode(&args.session_id, &args.params)
                .map_err(kernel_exception)?;
            to_value(&outcome)
        }
        "complete" => {
            let args: CompleteArgs = parse_args(args)?;
            let outcome = kernel
                .complete(&args.session_id, &args.prompt, &args.params)
                .map_err(kernel_exception)?;
            to_value(&outcome)
        }
        "decode_to_shm" => {
            let args: ShmDecodeArgs = parse_args(args)?;
            let outcome = kernel
                .decode(&args.session_id, &args.params)
                .map_err(kernel_exception)?;
            let total = write_outcome(&args.shm_path, &outcome).map_err(kernel_exception)?;
            Ok(json!(total))
        }
        "complete_to_shm" => {
            let args: ShmCompleteArgs = parse_args(args)?;
            let outcome = kernel
                .complete(&args.session_id, &args.prompt, &args.params)
                .map_err(kernel_exception)?;
            let total = write_outcome(&args.shm_path, &outcome).map_err(kernel_exception)?;
            Ok(json!(total))
        }
        "count_tokens" => {
            let args: CountArgs = parse_args(args)?;
            Ok(json!(kernel.count_tokens(&args.text)))
        }
        "replay_turns" => {
            let args: ReplayArgs = parse_args(args)?;
            let appended = kernel
                .replay_turns(&args.session_id, args.turns)
                .map_err(kernel_exception)?;
            Ok(json!(appended))
        }
        "evict" => {
            let args: SidArgs = parse_args(args)?;
            kernel.evict(&args.session_id).map_err(kernel_exception)?;
            Ok(Value::Null)
        }
        "evict_lru" => {
            let args: EvictLruArgs = parse_args(args)?;
            let evicted = kernel.evict_lru(args.max);
            to_value(&evicted)
        }
        "worker_stats" => to_value(&kernel.worker_stats()),
        "session_info" => {
            let args: SidArgs = parse_args(args)?;
            let info = kernel
                .session_info(&args.session_id)
                .map_err(kernel_exception)?;
            to_value(&info)
        }
        other => Err(WireException::new(
            "unknown_method",
            format!("unknown session-kernel method: {other}"),
        )),
    }
}

fn summarizer_call(
    kernel: &mut SummarizerKernel,
    method: &str,
    args: Value,
) -> Result<Value, WireException> {
    match method {
        "summarize" => {
            let args: SummarizeArgs = parse_args(args)?;
            let outcome = kernel
                .summarize(&args.history, args.max_tokens)
                .map_err(kernel_exception)?;
            to_value(&outcome)
        }
        "suggest_title" => {
            let args: TitleArgs = parse_args(args)?;
            let outcome = kernel
                .suggest_title(&args.history, args.max_tokens)
                .map_err(kernel_exception)?;
            to_value(&outcome)
        }
        other => Err(WireException::new(
            "unknown_method",
            format!("unknown summarizer method: {other}"),
        )),
    }
}

// ── argument shapes ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SidArgs {
    session_id: SessionId,
}

#[derive(Deserialize)]
struct CreateArgs {
    session_id: SessionId,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Deserialize)]
struct PrefillArgs {
    session_id: SessionId,
    prompt: String,
}

#[derive(Deserialize)]
struct DecodeArgs {
    session_id: SessionId,
    #[serde(default)]
    params: SamplingParams,
}

#[derive(Deserialize)]
struct CompleteArgs {
    session_id: SessionId,
    prompt: String,
    #[serde(default)]
    params: SamplingParams,
}

#[derive(Deserialize)]
struct ShmDecodeArgs {
    session_id: SessionId,
    shm_path: PathBuf,
    #[serde(default)]
    params: SamplingParams,
}

#[derive(Deserialize)]
struct ShmCompleteArgs {
    session_id: SessionId,
    prompt: String,
    shm_path: PathBuf,
    #[serde(default)]
    params: SamplingParams,
}

#[derive(Deserialize)]
struct CountArgs {
    text: String,
}

#[derive(Deserialize)]
struct EvictLruArgs {
    max: usize,
}

#[derive(Deserialize)]
struct ReplayArgs {
    session_id: SessionId,
    turns: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct SummarizeArgs {
    history: Vec<ChatMessage>,
    #[serde(default = "default_summary_tokens")]
    max_tokens: u32,
}

#[derive(Deserialize)]
struct TitleArgs {
    history: Vec<ChatMessage>,
    #[serde(default = "default_title_tokens")]
    max_tokens: u32,
}

fn default_summary_tokens() -> u32 {
    256
}

fn default_title_tokens() -> u32 {
    DEFAULT_TITLE_MAX_TOKENS
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, WireException> {
    serde_json::from_value(args)
        .map_err(|e| WireException::new("invalid_args", format!("malformed arguments: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, WireException> {
    serde_json::to_value(value)
        .map_err(|e| WireException::new("encode_failed", format!("result encoding failed: {e}")))
}

fn kernel_exception(err: KernelError) -> WireException {
    match &err {
        KernelError::SessionNotFound { .. } => {
            WireException::new("session_not_found", err.to_string())
        }
        KernelError::Runtime(RuntimeError::Load { .. }) => {
            WireException::new("model_load_failed", err.to_string())
        }
        KernelError::Runtime(RuntimeError::Generate { .. }) => {
            WireException::new("decode_failed", err.to_string())
        }
        KernelError::SharedBuffer { .. } => WireException::new("shared_buffer", err.to_string()),
    }
}

fn load_exception(err: RuntimeError) -> WireException {
    WireException::new("model_load_failed", err.to_string())
}

/// Serialise `outcome` into the shared result slot at `path` as
/// `[u32 LE length][UTF-8 JSON]` and return the total byte count.
fn write_outcome(path: &Path, outcome: &DecodeOutcome) -> Result<usize, KernelError> {
    let payload = serde_json::to_string(outcome).map_err(|e| KernelError::SharedBuffer {
        reason: format!("payload encoding failed: {e}"),
    })?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| KernelError::SharedBuffer {
            reason: format!("open {}: {e}", path.display()),
        })?;
    let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| KernelError::SharedBuffer {
        reason: format!("map {}: {e}", path.display()),
    })?;
    let total =
        windlass_proto::write_frame(&mut map, &payload).map_err(|e| KernelError::SharedBuffer {
            reason: e.to_string(),
        })?;
    map.flush().map_err(|e| KernelError::SharedBuffer {
        reason: format!("flush {}: {e}", path.display()),
    })?;
    Ok(total)
}
