//! Streamed completion lifecycle: delta ordering, the finalize protocol,
//! cancellation, and memory-managed streaming.

mod common;

use windlass_core::{CompletionEvent, SamplingParams, SessionPhase};

use common::{start, test_config};

struct ConsumedStream {
    deltas: String,
    done: Option<(String, u32, u32, u64)>,
    errors: usize,
}

async fn consume(stream: &mut windlass_core::CompletionStream) -> ConsumedStream {
    let mut consumed = ConsumedStream {
        deltas: String::new(),
        done: None,
        errors: 0,
    };
    while let Some(event) = stream.recv().await {
        match event {
            CompletionEvent::Delta { delta } => consumed.deltas.push_str(&delta),
            CompletionEvent::Done {
                finish_reason,
                prompt_tokens,
                completion_tokens,
                decode_ms,
                ..
            } => {
                consumed.done = Some((finish_reason, prompt_tokens, completion_tokens, decode_ms));
            }
            CompletionEvent::Error { .. } => consumed.errors += 1,
        }
    }
    consumed
}

#[tokio::test]
async fn deltas_concatenate_to_the_final_text() {
    let scheduler = start(test_config()).await;
    let sid = scheduler.create_session(None).await.unwrap();

    let mut stream = scheduler
        .complete_stream(&sid, "Stream please.", &SamplingParams::default())
        .await
        .unwrap();

    let mut text_from_done = String::new();
    let mut deltas = String::new();
    while let Some(event) = stream.recv().await {
        match event {
            CompletionEvent::Delta { delta } => deltas.push_str(&delta),
            CompletionEvent::Done {
                text,
                prompt_tokens,
                completion_tokens,
                decode_ms,
                finish_reason,
                ..
            } => {
                text_from_done = text;
                assert!(completion_tokens > 0, "non-empty text implies counted tokens");
                scheduler
                    .finalize_completed_stream(
                        &sid,
                        prompt_tokens,
                        completion_tokens,
                        decode_ms,
                        &finish_reason,
                    )
                    .await
                    .unwrap();
            }
            CompletionEvent::Error { error } => panic!("unexpected stream error: {error}"),
        }
    }

    // The synthetic runtime emits no think blocks, so the cleaned final
    // text equals the concatenated deltas.
    assert_eq!(deltas.trim(), text_from_done);

    let info = scheduler.session_info(&sid).await.unwrap();
    assert_eq!(info.phase, SessionPhase::Completed);
    assert!(info.token_budget_used > 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn projected_headroom_forces_a_rehydration() {
    let scheduler = start(test_config()).await;
    let sid = scheduler
        .create_session(Some("You are helpful.".into()))
        .await
        .unwrap();

    // Seed the session near the top of a 4096 window, as a completed
    // finalisation would.
    scheduler
        .finalize_completed_stream(&sid, 3600, 0, 0, "stop")
        .await
        .unwrap();

    let params = SamplingParams {
        max_tokens: 768,
        ..SamplingParams::default()
    };
    let (mut stream, replacement) = scheduler
        .complete_stream_with_memory_management(
            &sid,
            "Say hello.",
            &params,
            "You are helpful.",
            &[],
            None,
        )
        .await
        .unwrap();

    let new_sid = replacement.expect("headroom exhaustion must rehydrate");
    assert_ne!(new_sid, sid);

    let consumed = consume(&mut stream).await;
    let (finish_reason, prompt_tokens, completion_tokens, decode_ms) =
        consumed.done.expect("terminal done event");
    assert_eq!(consumed.errors, 0);
    scheduler
        .finalize_completed_stream(
            &new_sid,
            prompt_tokens,
            completion_tokens,
            decode_ms,
            &finish_reason,
        )
        .await
        .unwrap();

    // The old session is gone; the new one starts from the rehydrated
    // estimate.
    assert!(scheduler.context_monitor().utilization(&sid).is_none());
    assert_eq!(
        scheduler.session_info(&sid).await.unwrap().phase,
        SessionPhase::Evicted
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn low_occupancy_keeps_the_session() {
    let scheduler = start(test_config()).await;
    let sid = scheduler.create_session(None).await.unwrap();

    scheduler
        .finalize_completed_stream(&sid, 180, 60, 0, "stop")
        .await
        .unwrap();

    let params = SamplingParams {
        max_tokens: 4096,
        ..SamplingParams::default()
    };
    let (mut stream, replacement) = scheduler
        .complete_stream_with_memory_management(
            &sid,
            "Say hello.",
            &params,
            "You are helpful.",
            &[],
            None,
        )
        .await
        .unwrap();

    assert!(replacement.is_none(), "low occupancy must not rehydrate");

    let consumed = consume(&mut stream).await;
    let (finish_reason, prompt_tokens, completion_tokens, decode_ms) =
        consumed.done.expect("terminal done event");
    scheduler
        .finalize_completed_stream(&sid, prompt_tokens, completion_tokens, decode_ms, &finish_reason)
        .await
        .unwrap();

    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancellation_terminates_the_stream() {
    let scheduler = start(test_config()).await;
    let sid = scheduler.create_session(None).await.unwrap();

    let mut stream = scheduler
        .complete_stream(&sid, "Stream please.", &SamplingParams::default())
        .await
        .unwrap();
    stream.cancel();

    // Cancellation is best-effort: buffered deltas may still arrive, but
    // the stream must reach a terminal event and end.
    let consumed = consume(&mut stream).await;
    assert!(consumed.done.is_some() || consumed.errors > 0);

    scheduler.finalize_cancelled_stream(&sid).await.unwrap();
    let info = scheduler.session_info(&sid).await.unwrap();
    assert_eq!(info.phase, SessionPhase::Idle);
    // A cancelled turn records no usage.
    assert_eq!(info.token_budget_used, 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn failed_finalisation_marks_the_session_failed() {
    let scheduler = start(test_config()).await;
    let sid = scheduler.create_session(None).await.unwrap();

    let stream = scheduler
        .complete_stream(&sid, "Stream please.", &SamplingParams::default())
        .await
        .unwrap();
    drop(stream);

    scheduler
        .finalize_failed_stream(&sid, "client abandoned the stream")
        .await
        .unwrap();

    let info = scheduler.session_info(&sid).await.unwrap();
    assert_eq!(info.phase, SessionPhase::Failed);
    assert_eq!(scheduler.scheduler_stats().await.total_failed, 1);

    scheduler.shutdown().await;
}
