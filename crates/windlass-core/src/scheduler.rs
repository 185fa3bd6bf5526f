//! The session scheduler: registry, worker affinity, prefill → decode
//! orchestration, streaming lifecycle, batch execution, and
//! memory-managed completion.
//!
//! All mutable state sits behind one async mutex, so operations on the
//! same session are strictly serialised; the in-worker kernel loop
//! serialises sessions that share a worker, and different workers run in
//! parallel. The scheduler itself never blocks on I/O; every worker
//! touch goes through the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use windlass_pool::{SharedSlot, WorkerPool};
use windlass_proto::{DecodeOutcome, SummaryOutcome, TitleOutcome};
use windlass_types::tokens::{estimate_tokens, estimate_tokens_for_chars};
use windlass_types::{
    ChatMessage, ContextThreshold, ControlError, ControlResult, InferenceConfig, SamplingParams,
    SessionId, SessionPhase,
};

use crate::memory::{plan_rehydration, strip_document_blocks, RehydrationInput, RehydrationPlan};
use crate::monitor::ContextWindMonitor;
use crate::stream::CompletionStream;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const DECODE_TIMEOUT: Duration = Duration::from_secs(600);

/// Pre-flight rejection uses a deliberately conservative chars/token
/// figure; the kernel's own accounting is authoritative after decode.
const PREFLIGHT_CHARS_PER_TOKEN: f64 = 3.0;

/// Floor, in tokens, reserved for the reply in the projected-headroom
/// check of streamed memory-managed completions.
const HEADROOM_RESERVE_MIN: u32 = 256;

fn preflight_estimate(chars: usize) -> u32 {
    (chars as f64 / PREFLIGHT_CHARS_PER_TOKEN).ceil() as u32
}

/// A finished completion as handed to collaborators.
#[derive(Clone, Debug)]
pub struct CompletionResult {
    pub session_id: SessionId,
    pub text: String,
    pub thinking: String,
    pub finish_reason: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub prefill_ms: u64,
    pub decode_ms: u64,
}

impl CompletionResult {
    fn from_outcome(session_id: SessionId, outcome: DecodeOutcome) -> Self {
        Self {
            session_id,
            text: outcome.text,
            thinking: outcome.thinking,
            finish_reason: outcome.finish_reason,
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.completion_tokens,
            prefill_ms: outcome.prefill_ms.unwrap_or(0),
            decode_ms: outcome.decode_ms,
        }
    }
}

/// One request inside a batch completion.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub sid: SessionId,
    pub prompt: String,
    pub params: SamplingParams,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    total_scheduled: u64,
    total_completed: u64,
    total_failed: u64,
    tokens_generated: u64,
    prefill_ms_total: u64,
    decode_ms_total: u64,
}

/// Snapshot of the scheduler's counters.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub tokens_generated: u64,
    pub prefill_ms_total: u64,
    pub decode_ms_total: u64,
    pub active_sessions: usize,
}

/// Scheduler-side view of one session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub worker: usize,
    pub phase: SessionPhase,
    pub token_budget_used: u32,
    pub created_at: DateTime<Utc>,
    pub idle_ms: u64,
}

struct ScheduledSession {
    worker: usize,
    phase: SessionPhase,
    token_budget_used: u32,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    slot: Option<SharedSlot>,
}

impl ScheduledSession {
    fn new(worker: usize) -> Self {
        Self {
            worker,
            phase: SessionPhase::Idle,
            token_budget_used: 0,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            slot: None,
        }
    }
}

struct SchedState {
    sessions: HashMap<SessionId, ScheduledSession>,
    worker_load: Vec<usize>,
    counters: Counters,
}

struct SchedulerInner {
    config: InferenceConfig,
    pool: WorkerPool,
    monitor: ContextWindMonitor,
    state: Mutex<SchedState>,
}

/// The control plane's public handle. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Bring up the worker pool and the monitor.
    pub async fn start(config: InferenceConfig) -> ControlResult<Scheduler> {
        config.validate()?;
        let pool = WorkerPool::start(config.clone()).await?;
        let monitor = ContextWindMonitor::new(config.context_size);
        let worker_count = config.worker_count;
        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                config,
                pool,
                monitor,
                state: Mutex::new(SchedState {
                    sessions: HashMap::new(),
                    worker_load: vec![0; worker_count],
                    counters: Counters::default(),
                }),
            }),
        })
    }

    /// The context-wind monitor, for utilisation introspection.
    pub fn context_monitor(&self) -> &ContextWindMonitor {
        &self.inner.monitor
    }

    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
    }

    // ── session creation ─────────────────────────────────────────────────────

    /// Create a session on the least-loaded worker (ties to the lowest
    /// index). Fails with *worker-full* when every candidate is at the
    /// per-worker cap.
    pub async fn create_session(
        &self,
        system_prompt: Option<String>,
    ) -> ControlResult<SessionId> {
        let sid = SessionId::new();
        let worker = self.reserve_least_loaded().await?;
        match self.kernel_create(worker, &sid, system_prompt).await {
            Ok(()) => {
                self.register_session(sid.clone(), worker).await;
                self.inner.monitor.register(&sid);
                debug!(%sid, worker, "session created");
                Ok(sid)
            }
            Err(err) => {
                self.release_reservation(worker).await;
                Err(err)
            }
        }
    }

    /// Cold-start a resumed conversation: budget the history, create the
    /// session with the rehydrated system prompt, replay the remaining
    /// turns without decoding, and seed the monitor.
    pub async fn create_session_with_history(
        &self,
        system_prompt: &str,
        recent_turns: &[ChatMessage],
    ) -> ControlResult<SessionId> {
        let plan = plan_rehydration(
            &RehydrationInput {
                system_prompt,
                recent_turns,
                narrative: None,
                document_context: None,
            },
            self.inner.config.context_size,
        );

        let sid = self
            .create_session(Some(plan.system_prompt.clone()))
            .await?;
        let worker = self.session_worker(&sid).await?;

        if !plan.turns.is_empty() {
            if let Err(err) = self.kernel_replay(worker, &sid, &plan.turns).await {
                let _ = self.evict_session(&sid).await;
                return Err(err);
            }
        }

        let estimated = self.estimate_plan_tokens(worker, &plan).await;
        self.inner.monitor.reset_session(&sid, estimated);
        self.seed_budget(&sid, estimated).await;
        info!(%sid, worker, estimated_tokens = estimated, "session cold-started from history");
        Ok(sid)
    }

    /// Evict a session: free the in-worker state, release the shared
    /// slot, and tombstone the registry entry.
    pub async fn evict_session(&self, sid: &SessionId) -> ControlResult<()> {
        let worker = {
            let state = self.inner.state.lock().await;
            let session = state
                .sessions
                .get(sid)
                .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
            if session.phase == SessionPhase::Evicted {
                return Err(ControlError::Evicted { sid: sid.clone() });
            }
            session.worker
        };

        self.kernel_evict(worker, sid).await?;

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if let Some(session) = state.sessions.get_mut(sid) {
            if session.phase.is_active() {
                state.worker_load[session.worker] -= 1;
            }
            session.phase = SessionPhase::Evicted;
            session.slot.take();
        }
        drop(guard);
        self.inner.monitor.remove(sid);
        debug!(%sid, "session evicted");
        Ok(())
    }

    /// Evict idle sessions, oldest last-activity first, until the active
    /// count is at most `keep_max`. Sessions mid-prefill or mid-decode
    /// are never touched. Returns the evicted ids.
    pub async fn evict_lru(&self, keep_max: Option<usize>) -> ControlResult<Vec<SessionId>> {
        let keep = keep_max.unwrap_or(0);
        let victims: Vec<SessionId> = {
            let state = self.inner.state.lock().await;
            let active_count = state
                .sessions
                .values()
                .filter(|s| s.phase.is_active())
                .count();
            if active_count <= keep {
                return Ok(Vec::new());
            }
            let mut candidates: Vec<(&SessionId, &ScheduledSession)> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.phase.is_active() && !s.phase.is_busy())
                .collect();
            candidates.sort_by_key(|(_, s)| s.last_activity);
            candidates
                .into_iter()
                .take(active_count - keep)
                .map(|(sid, _)| sid.clone())
                .collect()
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for sid in victims {
            match self.evict_session(&sid).await {
                Ok(()) => evicted.push(sid),
                Err(err) => warn!(%sid, error = %err, "lru eviction skipped a session"),
            }
        }
        Ok(evicted)
    }

    // ── single completion ────────────────────────────────────────────────────

    /// Run one prefill → decode turn against the session's worker.
    pub async fn complete(
        &self,
        sid: &SessionId,
        prompt: &str,
        params: &SamplingParams,
    ) -> ControlResult<CompletionResult> {
        let worker = match self.begin_turn(sid, prompt.len()).await {
            Ok(worker) => worker,
            Err(err) => {
                // A budget rejection is terminal for the turn and leaves
                // the session failed; other precondition misses do not.
                if matches!(err, ControlError::ContextOverflow { .. }) {
                    self.fail_session(sid, &err).await;
                }
                return Err(err);
            }
        };
        let result = if self.inner.config.use_shared_memory {
            self.run_shm_completion(sid, worker, prompt, params).await
        } else {
            self.run_dag_completion(sid, worker, prompt, params).await
        };

        match result {
            Ok(outcome) => {
                self.finish_turn(sid, &outcome).await;
                Ok(CompletionResult::from_outcome(sid.clone(), outcome))
            }
            Err(err) => {
                let err = err.with_session(sid);
                self.fail_session(sid, &err).await;
                Err(err)
            }
        }
    }

    /// Create a throwaway session, complete once, and evict it.
    pub async fn complete_one_shot(
        &self,
        prompt: &str,
        params: &SamplingParams,
        system_prompt: Option<String>,
    ) -> ControlResult<CompletionResult> {
        let sid = self.create_session(system_prompt).await?;
        let result = self.complete(&sid, prompt, params).await;
        if let Err(err) = self.evict_session(&sid).await {
            debug!(%sid, error = %err, "one-shot session cleanup");
        }
        result
    }

    /// Validate and run a set of independent completions. One request's
    /// failure never cancels its siblings; outcomes are reported per
    /// session id.
    pub async fn complete_batch(
        &self,
        requests: Vec<BatchRequest>,
    ) -> HashMap<SessionId, ControlResult<CompletionResult>> {
        let tasks = requests.into_iter().map(|request| async move {
            let outcome = self
                .complete(&request.sid, &request.prompt, &request.params)
                .await;
            (request.sid, outcome)
        });
        futures::future::join_all(tasks).await.into_iter().collect()
    }

    // ── streamed completion ──────────────────────────────────────────────────

    /// Prefill synchronously, then open a decode stream pinned to the
    /// session's worker. The caller must invoke exactly one `finalize_*`
    /// method when consumption ends.
    pub async fn complete_stream(
        &self,
        sid: &SessionId,
        prompt: &str,
        params: &SamplingParams,
    ) -> ControlResult<CompletionStream> {
        let worker = match self.begin_turn(sid, prompt.len()).await {
            Ok(worker) => worker,
            Err(err) => {
                if matches!(err, ControlError::ContextOverflow { .. }) {
                    self.fail_session(sid, &err).await;
                }
                return Err(err);
            }
        };
        let handle = match self.inner.pool.handle(worker) {
            Ok(handle) => handle,
            Err(err) => {
                self.fail_session(sid, &err).await;
                return Err(err);
            }
        };

        let prefill_args = json!({"session_id": sid, "prompt": prompt, "params": params});
        if let Err(err) = self
            .inner
            .pool
            .call(handle, "prefill", prefill_args, CONTROL_TIMEOUT)
            .await
        {
            let err = classify_prefill(sid, err);
            self.fail_session(sid, &err).await;
            return Err(err);
        }

        self.set_phase(sid, SessionPhase::Decoding).await;
        let stream_args = json!({"session_id": sid, "params": params});
        match self
            .inner
            .pool
            .stream(handle, "decode_stream", stream_args, DECODE_TIMEOUT)
            .await
        {
            Ok(pool_stream) => Ok(CompletionStream::spawn(sid.clone(), pool_stream)),
            Err(err) => {
                let err = classify_decode(sid, err);
                self.fail_session(sid, &err).await;
                Err(err)
            }
        }
    }

    /// Record a successfully consumed stream: budget, counters, monitor.
    pub async fn finalize_completed_stream(
        &self,
        sid: &SessionId,
        prompt_tokens: u32,
        completion_tokens: u32,
        decode_ms: u64,
        finish_reason: &str,
    ) -> ControlResult<()> {
        let max = self.inner.config.context_size;
        {
            let mut state = self.inner.state.lock().await;
            let session = state
                .sessions
                .get_mut(sid)
                .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
            session.token_budget_used = max.min(prompt_tokens + completion_tokens);
            session.phase = SessionPhase::Completed;
            session.last_activity = Instant::now();
            state.counters.total_completed += 1;
            state.counters.tokens_generated += u64::from(completion_tokens);
            state.counters.decode_ms_total += decode_ms;
        }
        self.inner.monitor.report(sid, prompt_tokens, completion_tokens);
        debug!(%sid, prompt_tokens, completion_tokens, finish_reason, "stream finalised");
        Ok(())
    }

    /// Record a cancelled stream: the turn ends without usage.
    pub async fn finalize_cancelled_stream(&self, sid: &SessionId) -> ControlResult<()> {
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(sid)
            .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
        session.phase = SessionPhase::Idle;
        session.last_activity = Instant::now();
        debug!(%sid, "stream cancelled");
        Ok(())
    }

    /// Record a failed stream.
    pub async fn finalize_failed_stream(
        &self,
        sid: &SessionId,
        reason: &str,
    ) -> ControlResult<()> {
        let err = ControlError::DecodeFailed {
            sid: sid.clone(),
            reason: reason.to_owned(),
        };
        self.fail_session(sid, &err).await;
        Ok(())
    }

    // ── memory-managed completion ────────────────────────────────────────────

    /// Non-streaming memory-managed completion. Returns the result and
    /// the replacement session id when a rehydration occurred.
    pub async fn complete_with_memory_management(
        &self,
        sid: &SessionId,
        prompt: &str,
        params: &SamplingParams,
        system_prompt: &str,
        recent_turns: &[ChatMessage],
        document_context: Option<&str>,
    ) -> ControlResult<(CompletionResult, Option<SessionId>)> {
        let active = self
            .memory_pass(
                sid,
                prompt,
                params,
                system_prompt,
                recent_turns,
                document_context,
                false,
            )
            .await?;
        let changed = active != *sid;
        let user_prompt = compose_user_prompt(prompt, document_context, changed);
        let result = self.complete(&active, &user_prompt, params).await?;
        Ok((result, changed.then(|| active)))
    }

    /// Streaming memory-managed completion; also applies the
    /// projected-headroom check, since streams can produce long outputs.
    pub async fn complete_stream_with_memory_management(
        &self,
        sid: &SessionId,
        prompt: &str,
        params: &SamplingParams,
        system_prompt: &str,
        recent_turns: &[ChatMessage],
        document_context: Option<&str>,
    ) -> ControlResult<(CompletionStream, Option<SessionId>)> {
        let active = self
            .memory_pass(
                sid,
                prompt,
                params,
                system_prompt,
                recent_turns,
                document_context,
                true,
            )
            .await?;
        let changed = active != *sid;
        let user_prompt = compose_user_prompt(prompt, document_context, changed);
        let stream = self.complete_stream(&active, &user_prompt, params).await?;
        Ok((stream, changed.then(|| active)))
    }

    // ── token counting and summarisation shims ───────────────────────────────

    /// Exact tokenisation by the main model (worker 0), with the
    /// character estimate as a fallback inside the kernel.
    pub async fn count_tokens(&self, text: &str) -> ControlResult<u32> {
        let handle = self.inner.pool.handle(0)?;
        let value = self
            .inner
            .pool
            .call(handle, "count_tokens", json!({"text": text}), CONTROL_TIMEOUT)
            .await?;
        Ok(value.as_u64().unwrap_or(0) as u32)
    }

    /// Ask the summariser for a short conversation title.
    pub async fn suggest_title(&self, history: &[ChatMessage]) -> ControlResult<String> {
        let handle = self.inner.pool.summarizer_handle()?;
        let value = self
            .inner
            .pool
            .call(
                handle,
                "suggest_title",
                json!({"history": history}),
                DECODE_TIMEOUT,
            )
            .await?;
        let outcome: TitleOutcome = serde_json::from_value(value).map_err(|e| {
            ControlError::DecodeFailed {
                sid: SessionId::from("summarizer"),
                reason: format!("malformed title result: {e}"),
            }
        })?;
        Ok(outcome.suggested_title)
    }

    // ── introspection ────────────────────────────────────────────────────────

    pub async fn session_info(&self, sid: &SessionId) -> ControlResult<SessionInfo> {
        let state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get(sid)
            .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
        Ok(SessionInfo {
            session_id: sid.clone(),
            worker: session.worker,
            phase: session.phase,
            token_budget_used: session.token_budget_used,
            created_at: session.created_at,
            idle_ms: session.last_activity.elapsed().as_millis() as u64,
        })
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .iter()
            .filter(|(_, s)| s.phase.is_active())
            .map(|(sid, _)| sid.clone())
            .collect()
    }

    pub async fn worker_load(&self) -> Vec<usize> {
        self.inner.state.lock().await.worker_load.clone()
    }

    pub async fn scheduler_stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock().await;
        let counters = state.counters;
        SchedulerStats {
            total_scheduled: counters.total_scheduled,
            total_completed: counters.total_completed,
            total_failed: counters.total_failed,
            tokens_generated: counters.tokens_generated,
            prefill_ms_total: counters.prefill_ms_total,
            decode_ms_total: counters.decode_ms_total,
            active_sessions: state
                .sessions
                .values()
                .filter(|s| s.phase.is_active())
                .count(),
        }
    }

    /// Per-worker liveness probe, forwarded from the pool.
    pub async fn health_check(&self) -> Vec<windlass_pool::WorkerHealth> {
        self.inner.pool.health_check().await
    }

    /// In-worker kernel diagnostics for one main worker.
    pub async fn worker_stats(&self, worker: usize) -> ControlResult<windlass_proto::WorkerStats> {
        let handle = self.inner.pool.handle(worker)?;
        let value = self
            .inner
            .pool
            .call(handle, "worker_stats", json!({}), CONTROL_TIMEOUT)
            .await?;
        serde_json::from_value(value).map_err(|e| ControlError::KernelException {
            index: worker,
            kind: "protocol".to_owned(),
            message: format!("malformed worker stats: {e}"),
            traceback: None,
        })
    }

    // ── turn plumbing ────────────────────────────────────────────────────────

    /// Preconditions and phase transition for a new turn. Both rejects
    /// happen before any worker call; `max_tokens` is a ceiling and is
    /// never rejected on its own.
    async fn begin_turn(&self, sid: &SessionId, prompt_chars: usize) -> ControlResult<usize> {
        let max = self.inner.config.context_size;
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(sid)
            .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;

        match session.phase {
            SessionPhase::Evicted => {
                return Err(ControlError::Evicted { sid: sid.clone() });
            }
            SessionPhase::Failed => {
                return Err(ControlError::PrefillFailed {
                    sid: sid.clone(),
                    reason: "session is in the failed phase".to_owned(),
                });
            }
            SessionPhase::Prefilling | SessionPhase::Decoding => {
                return Err(ControlError::PrefillFailed {
                    sid: sid.clone(),
                    reason: "a completion is already in flight".to_owned(),
                });
            }
            SessionPhase::Idle | SessionPhase::Completed => {}
        }

        let used = session.token_budget_used;
        if used >= max {
            return Err(ControlError::ContextOverflow {
                sid: sid.clone(),
                used,
                max,
            });
        }
        if preflight_estimate(prompt_chars) > max - used {
            return Err(ControlError::ContextOverflow {
                sid: sid.clone(),
                used,
                max,
            });
        }

        session.phase = SessionPhase::Prefilling;
        session.last_activity = Instant::now();
        Ok(session.worker)
    }

    async fn run_dag_completion(
        &self,
        sid: &SessionId,
        worker: usize,
        prompt: &str,
        params: &SamplingParams,
    ) -> ControlResult<DecodeOutcome> {
        let handle = self.inner.pool.handle(worker)?;

        let prefill_args = json!({"session_id": sid, "prompt": prompt, "params": params});
        let prefill_value = self
            .inner
            .pool
            .call(handle, "prefill", prefill_args, CONTROL_TIMEOUT)
            .await
            .map_err(|err| classify_prefill(sid, err))?;
        let prefill_ms = prefill_value
            .get("prefill_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        self.set_phase(sid, SessionPhase::Decoding).await;

        let decode_args = json!({"session_id": sid, "params": params});
        let value = self
            .inner
            .pool
            .call(handle, "decode", decode_args, DECODE_TIMEOUT)
            .await
            .map_err(|err| classify_decode(sid, err))?;
        let mut outcome: DecodeOutcome =
            serde_json::from_value(value).map_err(|e| ControlError::DecodeFailed {
                sid: sid.clone(),
                reason: format!("malformed decode result: {e}"),
            })?;
        outcome.prefill_ms.get_or_insert(prefill_ms);
        Ok(outcome)
    }

    async fn run_shm_completion(
        &self,
        sid: &SessionId,
        worker: usize,
        prompt: &str,
        params: &SamplingParams,
    ) -> ControlResult<DecodeOutcome> {
        let handle = self.inner.pool.handle(worker)?;
        let slot_path = self.ensure_slot(sid).await?;

        self.set_phase(sid, SessionPhase::Decoding).await;
        let args = json!({
            "session_id": sid,
            "prompt": prompt,
            "shm_path": slot_path,
            "params": params,
        });
        let value = self
            .inner
            .pool
            .call(handle, "complete_to_shm", args, DECODE_TIMEOUT)
            .await
            .map_err(|err| classify_decode(sid, err))?;
        let byte_count = value.as_u64().ok_or_else(|| ControlError::DecodeFailed {
            sid: sid.clone(),
            reason: "worker reported a non-numeric byte count".to_owned(),
        })? as usize;

        let state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get(sid)
            .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
        let slot = session.slot.as_ref().ok_or_else(|| ControlError::DecodeFailed {
            sid: sid.clone(),
            reason: "shared result slot vanished".to_owned(),
        })?;
        let payload = slot
            .with_bytes(|bytes| windlass_proto::read_frame(bytes, byte_count).map(str::to_owned))
            .map_err(|e| ControlError::DecodeFailed {
                sid: sid.clone(),
                reason: e.to_string(),
            })?;
        drop(state);

        serde_json::from_str(&payload).map_err(|e| ControlError::DecodeFailed {
            sid: sid.clone(),
            reason: format!("malformed shared-memory payload: {e}"),
        })
    }

    async fn finish_turn(&self, sid: &SessionId, outcome: &DecodeOutcome) {
        let max = self.inner.config.context_size;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(session) = state.sessions.get_mut(sid) {
                session.token_budget_used =
                    max.min(outcome.prompt_tokens + outcome.completion_tokens);
                session.phase = SessionPhase::Completed;
                session.last_activity = Instant::now();
            }
            state.counters.total_completed += 1;
            state.counters.tokens_generated += u64::from(outcome.completion_tokens);
            state.counters.prefill_ms_total += outcome.prefill_ms.unwrap_or(0);
            state.counters.decode_ms_total += outcome.decode_ms;
        }
        if let Some(threshold) = self
            .inner
            .monitor
            .report(sid, outcome.prompt_tokens, outcome.completion_tokens)
        {
            debug!(%sid, %threshold, "completion crossed a context-wind threshold");
        }
    }

    async fn fail_session(&self, sid: &SessionId, err: &ControlError) {
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if let Some(session) = state.sessions.get_mut(sid) {
                if session.phase.is_active() {
                    state.worker_load[session.worker] -= 1;
                }
                session.phase = SessionPhase::Failed;
            }
            state.counters.total_failed += 1;
        }
        error!(%sid, error = %err, "session failed");
    }

    async fn set_phase(&self, sid: &SessionId, phase: SessionPhase) {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.sessions.get_mut(sid) {
            session.phase = phase;
            session.last_activity = Instant::now();
        }
    }

    // ── memory layer ─────────────────────────────────────────────────────────

    /// Decide, before a completion, whether the session must be rebuilt:
    /// the projected-headroom check (streaming only), then the
    /// context-wind thresholds. Returns the session to complete against.
    #[allow(clippy::too_many_arguments)]
    async fn memory_pass(
        &self,
        sid: &SessionId,
        prompt: &str,
        params: &SamplingParams,
        system_prompt: &str,
        recent_turns: &[ChatMessage],
        document_context: Option<&str>,
        streaming: bool,
    ) -> ControlResult<SessionId> {
        let max = self.inner.config.context_size;
        let mut current = sid.clone();

        if streaming {
            let used = {
                let state = self.inner.state.lock().await;
                let session = state
                    .sessions
                    .get(sid)
                    .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
                if session.phase == SessionPhase::Evicted {
                    return Err(ControlError::Evicted { sid: sid.clone() });
                }
                session.token_budget_used
            };
            let mut estimated_input = estimate_tokens(prompt);
            if let Some(document) = document_context {
                estimated_input += estimate_tokens(document);
            }
            let reserve = params.max_tokens.min(HEADROOM_RESERVE_MIN.max(max / 4));
            if used + estimated_input + reserve >= max {
                info!(
                    %sid,
                    used,
                    estimated_input,
                    reserve,
                    "projected headroom exhausted; rehydrating before decode"
                );
                current = self
                    .reset_and_rehydrate(
                        &current,
                        &RehydrationInput {
                            system_prompt,
                            recent_turns,
                            narrative: None,
                            document_context,
                        },
                    )
                    .await?;
            }
        }

        let utilization = self.inner.monitor.utilization(&current).unwrap_or(0.0);
        if utilization >= ContextThreshold::Commit.fraction() {
            // The summariser should see conversation, not static
            // document text.
            let stripped: Vec<ChatMessage> = recent_turns
                .iter()
                .map(|turn| ChatMessage {
                    role: turn.role,
                    content: strip_document_blocks(&turn.content),
                })
                .collect();
            let narrative = match self.summarize_history(&stripped).await {
                Ok(narrative) => Some(narrative),
                Err(err) => {
                    warn!(%current, error = %err, "summariser failed; rehydrating without narrative");
                    None
                }
            };

            let tail_start = recent_turns.len().saturating_sub(2);
            let mut attempts: Vec<RehydrationInput<'_>> = Vec::new();
            if let Some(narrative) = narrative.as_deref() {
                attempts.push(RehydrationInput {
                    system_prompt,
                    recent_turns,
                    narrative: Some(narrative),
                    document_context,
                });
            }
            attempts.push(RehydrationInput {
                system_prompt,
                recent_turns,
                narrative: None,
                document_context,
            });
            attempts.push(RehydrationInput {
                system_prompt,
                recent_turns: &recent_turns[tail_start..],
                narrative: None,
                document_context: None,
            });

            let mut last_err = None;
            for input in &attempts {
                match self.reset_and_rehydrate(&current, input).await {
                    Ok(new_sid) => {
                        current = new_sid;
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        warn!(%current, error = %err, "rehydration attempt failed");
                        last_err = Some(err);
                    }
                }
            }
            if let Some(err) = last_err {
                return Err(err);
            }
        } else if utilization >= ContextThreshold::Prepare.fraction() {
            debug!(%current, utilization, "summarisation will trigger at commit");
        }

        Ok(current)
    }

    /// Rebuild a session on the same worker from a rehydration plan,
    /// then evict the original. The old session is only lost once the
    /// replacement is fully in place.
    async fn reset_and_rehydrate(
        &self,
        old_sid: &SessionId,
        input: &RehydrationInput<'_>,
    ) -> ControlResult<SessionId> {
        let plan = plan_rehydration(input, self.inner.config.context_size);
        let worker = self.session_worker(old_sid).await?;
        let new_sid = SessionId::new();

        // Pinned reservation: the replacement must share the worker so
        // the KV affinity of the conversation survives.
        {
            let mut state = self.inner.state.lock().await;
            state.worker_load[worker] += 1;
        }

        if let Err(err) = self
            .kernel_create(worker, &new_sid, Some(plan.system_prompt.clone()))
            .await
        {
            self.release_reservation(worker).await;
            return Err(err);
        }
        self.register_session(new_sid.clone(), worker).await;

        if !plan.turns.is_empty() {
            if let Err(err) = self.kernel_replay(worker, &new_sid, &plan.turns).await {
                self.discard_session(&new_sid, worker).await;
                return Err(err);
            }
        }

        if let Err(err) = self.kernel_evict(worker, old_sid).await {
            // The old session is intact; roll back the replacement.
            self.discard_session(&new_sid, worker).await;
            return Err(err);
        }
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if let Some(session) = state.sessions.get_mut(old_sid) {
                if session.phase.is_active() {
                    state.worker_load[worker] -= 1;
                }
                session.phase = SessionPhase::Evicted;
                session.slot.take();
            }
        }
        self.inner.monitor.remove(old_sid);

        let estimated = self.estimate_plan_tokens(worker, &plan).await;
        self.seed_budget(&new_sid, estimated).await;
        self.inner.monitor.register(&new_sid);
        self.inner.monitor.reset_session(&new_sid, estimated);

        info!(
            old = %old_sid,
            new = %new_sid,
            worker,
            estimated_tokens = estimated,
            replayed_turns = plan.turns.len(),
            "session rehydrated"
        );
        Ok(new_sid)
    }

    async fn summarize_history(&self, history: &[ChatMessage]) -> ControlResult<String> {
        let handle = self.inner.pool.summarizer_handle()?;
        let value = self
            .inner
            .pool
            .call(
                handle,
                "summarize",
                json!({"history": history}),
                DECODE_TIMEOUT,
            )
            .await?;
        let outcome: SummaryOutcome =
            serde_json::from_value(value).map_err(|e| ControlError::DecodeFailed {
                sid: SessionId::from("summarizer"),
                reason: format!("malformed summary result: {e}"),
            })?;
        Ok(outcome.narrative_summary)
    }

    // ── registry helpers ─────────────────────────────────────────────────────

    /// Reserve a slot on the least-loaded worker before any async call,
    /// so concurrent creations see the updated count.
    async fn reserve_least_loaded(&self) -> ControlResult<usize> {
        let mut state = self.inner.state.lock().await;
        let (worker, load) = state
            .worker_load
            .iter()
            .enumerate()
            .min_by_key(|(index, load)| (**load, *index))
            .map(|(index, load)| (index, *load))
            .ok_or(ControlError::PoolNotReady)?;
        if load >= self.inner.config.max_sessions_per_worker {
            return Err(ControlError::WorkerFull { index: worker });
        }
        state.worker_load[worker] += 1;
        Ok(worker)
    }

    async fn release_reservation(&self, worker: usize) {
        let mut state = self.inner.state.lock().await;
        state.worker_load[worker] = state.worker_load[worker].saturating_sub(1);
    }

    async fn register_session(&self, sid: SessionId, worker: usize) {
        let mut state = self.inner.state.lock().await;
        state.sessions.insert(sid, ScheduledSession::new(worker));
        state.counters.total_scheduled += 1;
    }

    /// Remove a half-built replacement session: kernel state best-effort,
    /// registry entry entirely.
    async fn discard_session(&self, sid: &SessionId, worker: usize) {
        let _ = self.kernel_evict(worker, sid).await;
        let mut state = self.inner.state.lock().await;
        if state.sessions.remove(sid).is_some() {
            state.worker_load[worker] = state.worker_load[worker].saturating_sub(1);
        }
        drop(state);
        self.inner.monitor.remove(sid);
    }

    async fn session_worker(&self, sid: &SessionId) -> ControlResult<usize> {
        let state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get(sid)
            .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
        if session.phase == SessionPhase::Evicted {
            return Err(ControlError::Evicted { sid: sid.clone() });
        }
        Ok(session.worker)
    }

    async fn seed_budget(&self, sid: &SessionId, tokens: u32) {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.sessions.get_mut(sid) {
            session.token_budget_used = tokens.min(self.inner.config.context_size);
        }
    }

    async fn ensure_slot(&self, sid: &SessionId) -> ControlResult<std::path::PathBuf> {
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(sid)
            .ok_or_else(|| ControlError::SessionNotFound { sid: sid.clone() })?;
        if session.slot.is_none() {
            session.slot = Some(self.inner.pool.shared_buffer()?);
        }
        session
            .slot
            .as_ref()
            .map(|slot| slot.path().to_path_buf())
            .ok_or_else(|| ControlError::DecodeFailed {
                sid: sid.clone(),
                reason: "shared result slot could not be allocated".to_owned(),
            })
    }

    // ── kernel shims ─────────────────────────────────────────────────────────

    async fn kernel_create(
        &self,
        worker: usize,
        sid: &SessionId,
        system_prompt: Option<String>,
    ) -> ControlResult<()> {
        let handle = self.inner.pool.handle(worker)?;
        let args = json!({"session_id": sid, "system_prompt": system_prompt});
        self.inner
            .pool
            .call(handle, "create_session", args, CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn kernel_replay(
        &self,
        worker: usize,
        sid: &SessionId,
        turns: &[ChatMessage],
    ) -> ControlResult<()> {
        let handle = self.inner.pool.handle(worker)?;
        let args = json!({"session_id": sid, "turns": turns});
        self.inner
            .pool
            .call(handle, "replay_turns", args, CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn kernel_evict(&self, worker: usize, sid: &SessionId) -> ControlResult<()> {
        let handle = self.inner.pool.handle(worker)?;
        let args = json!({"session_id": sid});
        match self
            .inner
            .pool
            .call(handle, "evict", args, CONTROL_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            // Already gone in the worker, or the worker itself is gone:
            // either way its state no longer exists.
            Err(ControlError::KernelException { kind, .. }) if kind == "session_not_found" => {
                Ok(())
            }
            Err(ControlError::WorkerCrashed { .. })
            | Err(ControlError::WorkerUnreachable)
            | Err(ControlError::PoolShuttingDown) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn estimate_plan_tokens(&self, worker: usize, plan: &RehydrationPlan) -> u32 {
        let max = self.inner.config.context_size;
        let mut text = plan.system_prompt.clone();
        for turn in &plan.turns {
            text.push('\n');
            text.push_str(&turn.content);
        }
        let counted = match self.inner.pool.handle(worker) {
            Ok(handle) => self
                .inner
                .pool
                .call(handle, "count_tokens", json!({"text": text}), CONTROL_TIMEOUT)
                .await
                .ok()
                .and_then(|value| value.as_u64())
                .map(|n| n as u32),
            Err(_) => None,
        };
        counted
            .unwrap_or_else(|| estimate_tokens_for_chars(plan.chars))
            .min(max)
    }
}

fn compose_user_prompt(prompt: &str, document_context: Option<&str>, changed: bool) -> String {
    match document_context {
        // After a rehydration the document is already embedded in the
        // new session's system prompt.
        Some(document) if !changed && !document.is_empty() => format!(
            "<current_attachment_context>\n{document}\n</current_attachment_context>\n\n{prompt}"
        ),
        _ => prompt.to_owned(),
    }
}

fn classify_prefill(sid: &SessionId, err: ControlError) -> ControlError {
    match err {
        ControlError::KernelException { message, .. } => ControlError::PrefillFailed {
            sid: sid.clone(),
            reason: message,
        },
        other => other.with_session(sid),
    }
}

fn classify_decode(sid: &SessionId, err: ControlError) -> ControlError {
    match err {
        ControlError::KernelException { message, .. } => ControlError::DecodeFailed {
            sid: sid.clone(),
            reason: message,
        },
        other => other.with_session(sid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_estimate_is_conservative() {
        // 800 chars estimate to 267 tokens, which must not fit a 256
        // context with nothing used.
        assert_eq!(preflight_estimate(800), 267);
        assert!(preflight_estimate(800) > 256);
        assert_eq!(preflight_estimate(0), 0);
    }

    #[test]
    fn user_prompt_embeds_document_only_without_rehydration() {
        let with_doc = compose_user_prompt("question", Some("doc body"), false);
        assert!(with_doc.starts_with("<current_attachment_context>"));
        assert!(with_doc.contains("doc body"));
        assert!(with_doc.ends_with("question"));

        let after_rehydrate = compose_user_prompt("question", Some("doc body"), true);
        assert_eq!(after_rehydrate, "question");

        let no_doc = compose_user_prompt("question", None, false);
        assert_eq!(no_doc, "question");
    }
}
