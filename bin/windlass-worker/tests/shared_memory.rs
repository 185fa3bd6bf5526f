//! The shared-memory result transport, end to end.

mod common;

use windlass_core::{ControlError, SamplingParams, SessionPhase};

use common::{start, test_config};

#[tokio::test]
async fn completions_round_trip_through_the_shared_slot() {
    let mut config = test_config();
    config.use_shared_memory = true;
    let scheduler = start(config).await;

    let sid = scheduler
        .create_session(Some("You are helpful.".into()))
        .await
        .unwrap();

    let first = scheduler
        .complete(&sid, "First turn.", &SamplingParams::default())
        .await
        .unwrap();
    assert!(!first.text.is_empty());
    assert!(first.completion_tokens > 0);

    // The per-session slot is reused across turns.
    let second = scheduler
        .complete(&sid, "Second turn.", &SamplingParams::default())
        .await
        .unwrap();
    assert!(!second.text.is_empty());

    let info = scheduler.session_info(&sid).await.unwrap();
    assert_eq!(info.phase, SessionPhase::Completed);
    assert_eq!(
        info.token_budget_used,
        second.prompt_tokens + second.completion_tokens
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn oversized_results_surface_as_decode_failures() {
    let mut config = test_config();
    config.use_shared_memory = true;
    // Too small for any framed JSON result.
    config.shared_memory_slot_size = 16;
    let scheduler = start(config).await;

    let sid = scheduler.create_session(None).await.unwrap();
    let err = scheduler
        .complete(&sid, "This will not fit.", &SamplingParams::default())
        .await
        .unwrap_err();
    match err {
        ControlError::DecodeFailed { .. } => {}
        other => panic!("expected a decode failure, got {other}"),
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn batches_use_independent_slots_per_session() {
    let mut config = test_config();
    config.use_shared_memory = true;
    let scheduler = start(config).await;

    let a = scheduler.create_session(None).await.unwrap();
    let b = scheduler.create_session(None).await.unwrap();

    let outcomes = scheduler
        .complete_batch(vec![
            windlass_core::BatchRequest {
                sid: a.clone(),
                prompt: "One.".into(),
                params: SamplingParams::default(),
            },
            windlass_core::BatchRequest {
                sid: b.clone(),
                prompt: "Two.".into(),
                params: SamplingParams::default(),
            },
        ])
        .await;

    assert!(outcomes[&a].is_ok());
    assert!(outcomes[&b].is_ok());

    scheduler.shutdown().await;
}
