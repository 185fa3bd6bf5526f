//! Memory-managed completion: threshold-driven summarise + rehydrate.

mod common;

use windlass_core::{ChatMessage, SamplingParams, SessionPhase};

use common::{start, test_config};

fn long_history() -> Vec<ChatMessage> {
    vec![
        ChatMessage::user("Let's design a cache eviction policy.".repeat(4)),
        ChatMessage::assistant("We compared LRU against CLOCK and settled on CLOCK.".repeat(4)),
        ChatMessage::user(
            "[Attached file: benchmarks.csv]\nhit,miss,latency\n1,2,3\n\nWhat do the numbers say?"
                .to_owned(),
        ),
        ChatMessage::assistant("CLOCK wins at high concurrency.".repeat(4)),
    ]
}

#[tokio::test]
async fn commit_threshold_summarises_and_rehydrates() {
    let scheduler = start(test_config()).await;
    let sid = scheduler
        .create_session(Some("You are a systems tutor.".into()))
        .await
        .unwrap();

    // Past the commit threshold: 2900 / 4096 ≈ 0.708.
    scheduler
        .finalize_completed_stream(&sid, 2700, 200, 0, "stop")
        .await
        .unwrap();

    let (result, replacement) = scheduler
        .complete_with_memory_management(
            &sid,
            "So which policy ships?",
            &SamplingParams::default(),
            "You are a systems tutor.",
            &long_history(),
            None,
        )
        .await
        .unwrap();

    let new_sid = replacement.expect("commit threshold must rehydrate");
    assert_ne!(new_sid, sid);
    assert!(!result.text.is_empty());
    assert_eq!(result.session_id, new_sid);

    // The old session was evicted; the replacement carries the
    // conversation and a fresh, low utilisation.
    assert_eq!(
        scheduler.session_info(&sid).await.unwrap().phase,
        SessionPhase::Evicted
    );
    let utilization = scheduler.context_monitor().utilization(&new_sid).unwrap();
    assert!(utilization < 0.60);
    assert_eq!(
        scheduler.session_info(&new_sid).await.unwrap().phase,
        SessionPhase::Completed
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn below_prepare_nothing_happens() {
    let scheduler = start(test_config()).await;
    let sid = scheduler.create_session(None).await.unwrap();

    scheduler
        .finalize_completed_stream(&sid, 100, 50, 0, "stop")
        .await
        .unwrap();

    let (result, replacement) = scheduler
        .complete_with_memory_management(
            &sid,
            "Continue.",
            &SamplingParams::default(),
            "You are helpful.",
            &[],
            None,
        )
        .await
        .unwrap();

    assert!(replacement.is_none());
    assert_eq!(result.session_id, sid);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn document_context_is_embedded_when_the_session_is_kept() {
    let scheduler = start(test_config()).await;
    let sid = scheduler.create_session(None).await.unwrap();

    // Low utilisation: the document rides along with the user prompt.
    let (result, replacement) = scheduler
        .complete_with_memory_management(
            &sid,
            "What does the file say?",
            &SamplingParams::default(),
            "You are helpful.",
            &[],
            Some("col_a,col_b\n1,2"),
        )
        .await
        .unwrap();

    assert!(replacement.is_none());
    assert!(!result.text.is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn dedicated_summarizer_slot_is_spawned_when_configured() {
    let mut config = test_config();
    config.summarizer_model_path = Some("ignored-by-synthetic.gguf".into());
    let scheduler = start(config).await;

    // Two mains, the dedicated summariser, vision, sandbox.
    let report = scheduler.health_check().await;
    assert_eq!(report.len(), 5);
    assert!(report.iter().all(|w| w.alive));

    let title = scheduler
        .suggest_title(&[ChatMessage::user("Plan my garden beds.")])
        .await
        .unwrap();
    assert!(!title.is_empty());

    scheduler.shutdown().await;
}
