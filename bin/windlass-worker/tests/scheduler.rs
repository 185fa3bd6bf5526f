//! End-to-end scheduler behaviour against real worker processes.

mod common;

use windlass_core::{
    BatchRequest, ChatMessage, ControlError, SamplingParams, SessionPhase,
};

use common::{start, test_config};

#[tokio::test]
async fn create_and_complete_round_trip() {
    let scheduler = start(test_config()).await;

    let sid = scheduler
        .create_session(Some("You are helpful.".into()))
        .await
        .unwrap();
    let result = scheduler
        .complete(&sid, "Say something.", &SamplingParams::default())
        .await
        .unwrap();

    assert!(!result.text.is_empty());
    assert!(result.prompt_tokens > 0);
    assert!(result.completion_tokens > 0);

    let info = scheduler.session_info(&sid).await.unwrap();
    assert_eq!(info.phase, SessionPhase::Completed);
    assert!(info.worker < 2);
    assert_eq!(
        info.token_budget_used,
        result.prompt_tokens + result.completion_tokens
    );

    // Worker load reflects exactly the active sessions.
    let load: usize = scheduler.worker_load().await.iter().sum();
    assert_eq!(load, scheduler.active_sessions().await.len());

    let stats = scheduler.scheduler_stats().await;
    assert_eq!(stats.total_scheduled, 1);
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_failed, 0);
    assert!(stats.tokens_generated > 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn token_budget_tracks_the_latest_turn_only() {
    let scheduler = start(test_config()).await;
    let sid = scheduler.create_session(None).await.unwrap();

    let first = scheduler
        .complete(&sid, "First question?", &SamplingParams::default())
        .await
        .unwrap();
    let after_first = scheduler.session_info(&sid).await.unwrap().token_budget_used;
    assert_eq!(
        after_first,
        first.prompt_tokens + first.completion_tokens
    );

    let second = scheduler
        .complete(&sid, "Second question?", &SamplingParams::default())
        .await
        .unwrap();
    let after_second = scheduler.session_info(&sid).await.unwrap().token_budget_used;

    // Latest turn occupancy, not a running sum across turns.
    assert_eq!(
        after_second,
        second.prompt_tokens + second.completion_tokens
    );
    assert!(
        after_second
            < first.prompt_tokens
                + first.completion_tokens
                + second.prompt_tokens
                + second.completion_tokens
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn overflow_is_rejected_before_any_worker_call() {
    let mut config = test_config();
    config.context_size = 256;
    let scheduler = start(config).await;

    let sid = scheduler.create_session(None).await.unwrap();
    let prompt = "x".repeat(800);
    let params = SamplingParams {
        max_tokens: 64,
        ..SamplingParams::default()
    };

    let err = scheduler.complete(&sid, &prompt, &params).await.unwrap_err();
    assert_eq!(
        err,
        ControlError::ContextOverflow {
            sid: sid.clone(),
            used: 0,
            max: 256
        }
    );
    assert_eq!(
        scheduler.session_info(&sid).await.unwrap().phase,
        SessionPhase::Failed
    );
    assert_eq!(scheduler.scheduler_stats().await.total_failed, 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn worker_cap_is_enforced_on_creation() {
    let mut config = test_config();
    config.worker_count = 1;
    config.max_sessions_per_worker = 2;
    let scheduler = start(config).await;

    scheduler.create_session(None).await.unwrap();
    scheduler.create_session(None).await.unwrap();
    let err = scheduler.create_session(None).await.unwrap_err();
    assert_eq!(err, ControlError::WorkerFull { index: 0 });

    scheduler.shutdown().await;
}

#[tokio::test]
async fn sessions_land_on_the_least_loaded_worker() {
    let scheduler = start(test_config()).await;

    let a = scheduler.create_session(None).await.unwrap();
    let b = scheduler.create_session(None).await.unwrap();
    let c = scheduler.create_session(None).await.unwrap();

    let wa = scheduler.session_info(&a).await.unwrap().worker;
    let wb = scheduler.session_info(&b).await.unwrap().worker;
    let wc = scheduler.session_info(&c).await.unwrap().worker;

    // Ties break to the lowest index, so the pattern is 0, 1, 0.
    assert_eq!(wa, 0);
    assert_eq!(wb, 1);
    assert_eq!(wc, 0);
    assert_eq!(scheduler.worker_load().await, vec![2, 1]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn batch_failures_do_not_cancel_siblings() {
    let scheduler = start(test_config()).await;

    let a = scheduler.create_session(None).await.unwrap();
    let b = scheduler.create_session(None).await.unwrap();
    let c = scheduler.create_session(None).await.unwrap();

    let outcomes = scheduler
        .complete_batch(vec![
            BatchRequest {
                sid: a.clone(),
                prompt: "x".repeat(13_000),
                params: SamplingParams::default(),
            },
            BatchRequest {
                sid: b.clone(),
                prompt: "What is two plus two?".into(),
                params: SamplingParams::default(),
            },
            BatchRequest {
                sid: c.clone(),
                prompt: "Name a colour.".into(),
                params: SamplingParams::default(),
            },
        ])
        .await;

    assert!(matches!(
        &outcomes[&a],
        Err(ControlError::ContextOverflow { .. })
    ));
    assert!(outcomes[&b].is_ok());
    assert!(outcomes[&c].is_ok());

    assert_eq!(
        scheduler.session_info(&a).await.unwrap().phase,
        SessionPhase::Failed
    );
    assert_eq!(
        scheduler.session_info(&b).await.unwrap().phase,
        SessionPhase::Completed
    );
    assert_eq!(
        scheduler.session_info(&c).await.unwrap().phase,
        SessionPhase::Completed
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn lru_eviction_removes_oldest_idle_sessions() {
    let scheduler = start(test_config()).await;

    let a = scheduler.create_session(None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let b = scheduler.create_session(None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    // Touch `a` so `b` is the coldest.
    scheduler
        .complete(&a, "ping", &SamplingParams::default())
        .await
        .unwrap();

    let evicted = scheduler.evict_lru(Some(1)).await.unwrap();
    assert_eq!(evicted, vec![b.clone()]);
    assert_eq!(scheduler.active_sessions().await, vec![a.clone()]);
    assert_eq!(
        scheduler.session_info(&b).await.unwrap().phase,
        SessionPhase::Evicted
    );

    // Further use of the evicted session is a typed lifecycle error.
    let err = scheduler
        .complete(&b, "hello?", &SamplingParams::default())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::Evicted { sid: b });

    scheduler.shutdown().await;
}

#[tokio::test]
async fn history_cold_start_replays_and_seeds_utilisation() {
    let scheduler = start(test_config()).await;

    let turns = vec![
        ChatMessage::user("We were talking about parsers."),
        ChatMessage::assistant("Yes: recursive descent with a token stream."),
        ChatMessage::user("And error recovery?"),
        ChatMessage::assistant("Synchronise on statement boundaries."),
    ];
    let sid = scheduler
        .create_session_with_history("You are a compiler tutor.", &turns)
        .await
        .unwrap();

    let utilization = scheduler.context_monitor().utilization(&sid).unwrap();
    assert!(utilization > 0.0);
    assert!(scheduler.session_info(&sid).await.unwrap().token_budget_used > 0);

    // The resumed conversation can continue immediately.
    let result = scheduler
        .complete(&sid, "Summarise where we were.", &SamplingParams::default())
        .await
        .unwrap();
    assert!(!result.text.is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn one_shot_completion_leaves_no_session_behind() {
    let scheduler = start(test_config()).await;

    let result = scheduler
        .complete_one_shot(
            "Translate 'hello' to French.",
            &SamplingParams::default(),
            Some("You are a translator.".into()),
        )
        .await
        .unwrap();
    assert!(!result.text.is_empty());
    assert!(scheduler.active_sessions().await.is_empty());
    assert_eq!(scheduler.worker_load().await, vec![0, 0]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn count_tokens_round_trips_to_the_worker() {
    let scheduler = start(test_config()).await;
    assert_eq!(scheduler.count_tokens("").await.unwrap(), 0);
    assert!(scheduler.count_tokens("a few words here").await.unwrap() > 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn summarizer_suggests_a_title() {
    let scheduler = start(test_config()).await;
    let history = vec![
        ChatMessage::user("Help me tune a bread recipe."),
        ChatMessage::assistant("Longer autolyse, less yeast."),
    ];
    let title = scheduler.suggest_title(&history).await.unwrap();
    assert!(!title.is_empty());
    assert!(!title.ends_with('.'));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn health_check_reports_every_slot_alive() {
    let scheduler = start(test_config()).await;
    let report = scheduler.health_check().await;
    // Two mains plus the vision and sandbox slots.
    assert_eq!(report.len(), 4);
    assert!(report.iter().all(|w| w.alive));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn missing_native_runtime_fails_startup_with_model_load_error() {
    let mut config = test_config();
    config.runtime = windlass_core::RuntimeKind::LlamaCpp;
    config.model_path = "/nonexistent/model.gguf".into();

    // The test worker binary is built without the llama-cpp feature, so
    // kernel installation must fail and startup must surface it.
    match windlass_core::Scheduler::start(config).await {
        Err(err) => assert!(matches!(err, ControlError::ModelLoadFailed { .. })),
        Ok(_) => panic!("startup should fail without a native runtime"),
    }
}
