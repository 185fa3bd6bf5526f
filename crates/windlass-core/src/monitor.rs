//! The context-wind monitor: deterministic per-session token-utilisation
//! tracking and threshold events.
//!
//! Utilisation is `(latest prompt + latest completion) / context size`,
//! never a cumulative sum across turns: a past answer's tokens are
//! already represented inside the current prompt's KV cache.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;
use windlass_types::{ContextThreshold, SessionId};

/// One threshold crossing, appended to a session's history.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Crossing {
    pub threshold: ContextThreshold,
    pub utilization: f64,
}

#[derive(Debug, Default)]
struct WindState {
    prompt_tokens: u32,
    completion_tokens: u32,
    highest: Option<ContextThreshold>,
    history: Vec<Crossing>,
}

/// Per-session wind state behind a single writer lock. No operation
/// blocks on I/O; every mutation is a short critical section.
pub struct ContextWindMonitor {
    context_size: u32,
    state: RwLock<HashMap<SessionId, WindState>>,
}

impl ContextWindMonitor {
    pub fn new(context_size: u32) -> Self {
        Self {
            context_size,
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn context_size(&self) -> u32 {
        self.context_size
    }

    /// Track a new session at zero utilisation.
    pub fn register(&self, sid: &SessionId) {
        self.state
            .write()
            .expect("monitor lock")
            .entry(sid.clone())
            .or_default();
    }

    /// Record the latest turn's token counts and emit threshold events.
    ///
    /// Every threshold at or below the new utilisation that lies above
    /// the highest crossed so far is crossed now, in ascending order;
    /// the return value is the highest threshold newly crossed, if any.
    /// Replaying the same counts emits nothing.
    pub fn report(
        &self,
        sid: &SessionId,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Option<ContextThreshold> {
        let mut state = self.state.write().expect("monitor lock");
        let entry = state.entry(sid.clone()).or_default();
        entry.prompt_tokens = prompt_tokens;
        entry.completion_tokens = completion_tokens;

        let utilization =
            f64::from(prompt_tokens + completion_tokens) / f64::from(self.context_size);
        let mut newly_crossed = None;
        for threshold in ContextThreshold::ALL {
            if threshold.fraction() > utilization {
                break;
            }
            if entry.highest.is_some_and(|highest| threshold <= highest) {
                continue;
            }
            entry.highest = Some(threshold);
            entry.history.push(Crossing {
                threshold,
                utilization,
            });
            newly_crossed = Some(threshold);
            debug!(%sid, %threshold, utilization, "context-wind threshold crossed");
        }
        newly_crossed
    }

    /// Clear the crossing state after a rehydration and seed utilisation
    /// from the new session's estimated prompt tokens.
    pub fn reset_session(&self, sid: &SessionId, new_prompt_tokens: u32) {
        let mut state = self.state.write().expect("monitor lock");
        let entry = state.entry(sid.clone()).or_default();
        entry.prompt_tokens = new_prompt_tokens;
        entry.completion_tokens = 0;
        entry.highest = None;
        entry.history.clear();
    }

    pub fn utilization(&self, sid: &SessionId) -> Option<f64> {
        let state = self.state.read().expect("monitor lock");
        state.get(sid).map(|entry| {
            f64::from(entry.prompt_tokens + entry.completion_tokens)
                / f64::from(self.context_size)
        })
    }

    pub fn highest_threshold(&self, sid: &SessionId) -> Option<ContextThreshold> {
        self.state
            .read()
            .expect("monitor lock")
            .get(sid)
            .and_then(|entry| entry.highest)
    }

    pub fn crossing_history(&self, sid: &SessionId) -> Vec<Crossing> {
        self.state
            .read()
            .expect("monitor lock")
            .get(sid)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, sid: &SessionId) {
        self.state.write().expect("monitor lock").remove(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (ContextWindMonitor, SessionId) {
        let m = ContextWindMonitor::new(4096);
        let sid = SessionId::new();
        m.register(&sid);
        (m, sid)
    }

    #[test]
    fn threshold_sequence_crosses_in_ascending_order() {
        let (m, sid) = monitor();
        // 2950 / 4096 = 0.72: prepare and commit cross, reset does not.
        let crossed = m.report(&sid, 2800, 150);
        assert_eq!(crossed, Some(ContextThreshold::Commit));
        let history = m.crossing_history(&sid);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].threshold, ContextThreshold::Prepare);
        assert_eq!(history[1].threshold, ContextThreshold::Commit);
        assert_eq!(m.highest_threshold(&sid), Some(ContextThreshold::Commit));
    }

    #[test]
    fn replaying_the_same_report_emits_nothing() {
        let (m, sid) = monitor();
        assert_eq!(m.report(&sid, 2300, 100), None);
        assert_eq!(m.report(&sid, 2300, 100), None);
        assert!(m.crossing_history(&sid).is_empty());
        let utilization = m.utilization(&sid).unwrap();
        assert!((utilization - 2400.0 / 4096.0).abs() < 1e-9);
    }

    #[test]
    fn utilisation_is_not_cumulative() {
        let (m, sid) = monitor();
        m.report(&sid, 2000, 100);
        m.report(&sid, 2000, 100);
        // Two identical turns still sit at 2100 tokens, not 4200.
        let utilization = m.utilization(&sid).unwrap();
        assert!((utilization - 2100.0 / 4096.0).abs() < 1e-9);
    }

    #[test]
    fn each_threshold_fires_once_per_ascent() {
        let (m, sid) = monitor();
        assert_eq!(m.report(&sid, 2500, 0), Some(ContextThreshold::Prepare));
        assert_eq!(m.report(&sid, 2500, 200), None); // still inside prepare
        assert_eq!(m.report(&sid, 2900, 0), Some(ContextThreshold::Commit));
        assert_eq!(m.report(&sid, 3300, 0), Some(ContextThreshold::Reset));
        assert_eq!(m.crossing_history(&sid).len(), 3);
    }

    #[test]
    fn reset_clears_crossings_and_seeds_utilisation() {
        let (m, sid) = monitor();
        m.report(&sid, 3000, 100);
        assert!(m.highest_threshold(&sid).is_some());
        m.reset_session(&sid, 410);
        assert_eq!(m.highest_threshold(&sid), None);
        assert!(m.crossing_history(&sid).is_empty());
        let utilization = m.utilization(&sid).unwrap();
        assert!((utilization - 410.0 / 4096.0).abs() < 1e-9);
        // The ascent can happen again after the reset.
        assert_eq!(m.report(&sid, 2500, 0), Some(ContextThreshold::Prepare));
    }
}
