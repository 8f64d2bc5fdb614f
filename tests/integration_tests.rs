
use draw_tasks::*;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

// --- Gateway ---

#[tokio::test]
async fn test_unknown_model_rejected_without_io() {
    // Nothing listens on port 9; any network attempt would surface as a
    // transport error rather than the unknown-model message.
    let client = DrawClient::new("http://127.0.0.1:9", "sk-test");
    let request = DrawRequest::new("fox", "dall-e-9000");

    let envelope = client.submit(&request).await;
    assert_ne!(envelope.code, Envelope::OK);
    assert_eq!(envelope.msg.as_deref(), Some("Unknown model: dall-e-9000"));
}

#[tokio::test]
async fn test_unknown_model_unit_reports_submission_failed() {
    let (sink, mut events) = ChannelSink::new();
    let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
    let unit = TaskUnit::new(
        Arc::new(DrawClient::new("http://127.0.0.1:9", "sk-test")),
        ledger.clone(),
        Arc::new(sink),
        TaskConfig::default(),
        DrawRequest::new("fox", "midjourney"),
    );

    let outcome = unit.run().await.unwrap();
    assert_eq!(
        outcome,
        Err(TaskFailure::SubmissionFailed("Unknown model: midjourney".into()))
    );
    match events.try_recv().unwrap() {
        TaskEvent::Finished(f) => {
            assert!(!f.success);
            assert_eq!(f.reason, "Submission failed");
            assert!(f.job_id.is_none());
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(ledger.list(10).unwrap().is_empty());
}

// --- Task unit ---

#[tokio::test(start_paused = true)]
async fn test_end_to_end_sequence() {
    let api = ScriptedApi::new()
        .with_submits([submitted("job-1")])
        .with_polls([not_ready(), running(40), succeeded(&["https://x/y.png"])]);
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).spawn().join().await.unwrap();
    let path = outcome.unwrap();

    let events = h.drain();
    assert_eq!(events.len(), 2, "events: {:?}", events);
    match &events[0] {
        TaskEvent::Progress(p) => {
            assert_eq!(p.progress, 40);
            assert_eq!(p.status, "running");
            assert_eq!(p.job_id, "job-1");
        }
        other => panic!("expected progress, got {:?}", other),
    }
    match &events[1] {
        TaskEvent::Finished(f) => {
            assert!(f.success);
            assert_eq!(f.reason, "Success");
            assert_eq!(f.result, path.display().to_string());
        }
        other => panic!("expected finished, got {:?}", other),
    }

    assert_eq!(path.parent(), Some(h.dir.path().join("output").as_path()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap();
    assert_eq!(stem.len(), "2024-01-01-00-00-00".len());
    assert!(path.exists());

    assert_eq!(h.api.submits(), 1);
    assert_eq!(h.api.polls(), 3);
    assert_eq!(*h.api.downloaded.lock().unwrap(), vec!["https://x/y.png"]);
}

#[tokio::test(start_paused = true)]
async fn test_jpg_result_keeps_extension() {
    let api = ScriptedApi::new().with_polls([succeeded(&[
        "https://cdn.example.com/out/abc.jpg",
        "https://cdn.example.com/out/def.jpg",
    ])]);
    let mut h = Harness::new(api);

    let path = h.unit(request()).run().await.unwrap().unwrap();
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
    assert_eq!(path.parent(), Some(h.dir.path().join("output").as_path()));
    assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG fake image");

    let finished = finished(&h.drain()).into_iter().cloned().collect::<Vec<_>>();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].result, path.display().to_string());

    // Only the first result is downloaded.
    assert_eq!(h.api.downloads(), 1);

    let entry = h.ledger.get("job-1").unwrap().unwrap();
    assert_eq!(entry.status, HistoryStatus::Succeeded);
    assert_eq!(entry.result_path, Some(path.display().to_string()));
    assert_eq!(
        entry.preview_url.as_deref(),
        Some("https://cdn.example.com/out/abc.jpg")
    );
}

#[tokio::test(start_paused = true)]
async fn test_zero_results_never_downloads() {
    let api = ScriptedApi::new().with_polls([running(90), succeeded(&[])]);
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert_eq!(outcome, Err(TaskFailure::NoResults));
    assert_eq!(h.api.downloads(), 0);

    let events = h.drain();
    let finished = finished(&events);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].reason, "No Results");

    let entry = h.ledger.get("job-1").unwrap().unwrap();
    assert_eq!(entry.status, HistoryStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_download_is_reported_and_recorded() {
    let api = ScriptedApi::new()
        .with_polls([succeeded(&["https://x/gone.png"])])
        .with_download_failure(404, "gone");
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    match outcome {
        Err(TaskFailure::DownloadFailed(msg)) => assert!(msg.contains("404"), "msg: {}", msg),
        other => panic!("expected download failure, got {:?}", other),
    }
    assert_eq!(h.api.downloads(), 1);

    let events = h.drain();
    let finished = finished(&events);
    assert_eq!(finished.len(), 1);
    assert!(!finished[0].success);
    assert_eq!(finished[0].reason, "Download Failed");

    let entry = h.ledger.get("job-1").unwrap().unwrap();
    assert_eq!(entry.status, HistoryStatus::Failed);

    let saved = std::fs::read_dir(h.dir.path().join("output"))
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(saved, 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_poll_payload_is_processing_error() {
    let api = ScriptedApi::new().with_polls([Reply::Envelope(Envelope::ok(
        serde_json::json!({ "status": "running", "progress": "almost" }),
    ))]);
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert!(matches!(outcome, Err(TaskFailure::ProcessingError(_))));
    assert_eq!(h.api.polls(), 1);

    let events = h.drain();
    assert!(progress(&events).is_empty());
    assert_eq!(finished(&events)[0].reason, "Processing Error");

    let entry = h.ledger.get("job-1").unwrap().unwrap();
    assert_eq!(entry.status, HistoryStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_five_transport_errors_give_network_error() {
    let api = ScriptedApi::new().with_polls([
        running(10),
        transport("connection reset"),
        transport("connection reset"),
        transport("connection reset"),
        transport("connection reset"),
        transport("connection reset"),
        running(20),
    ]);
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert!(matches!(outcome, Err(TaskFailure::NetworkError(_))));
    assert_eq!(h.api.polls(), 6);

    let events = h.drain();
    let progress = progress(&events);
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].progress, 10);
    assert!(matches!(events.last(), Some(TaskEvent::Finished(f)) if f.reason == "Network Error"));

    let entry = h.ledger.get("job-1").unwrap().unwrap();
    assert_eq!(entry.status, HistoryStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_count_resets_on_success() {
    let mut polls = vec![transport("timeout"); 4];
    polls.push(running(50));
    polls.extend(vec![transport("timeout"); 4]);
    polls.push(succeeded(&["https://x/z.png"]));
    let api = ScriptedApi::new().with_polls(polls);
    let h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(h.api.polls(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_waits_until_cancelled() {
    let api = ScriptedApi::new().with_poll_fallback(not_ready());
    let mut h = Harness::new(api);

    let handle = h.unit(request()).spawn();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!handle.is_finished());
    assert!(h.api.polls() >= 50);

    handle.stop();
    assert_eq!(handle.join().await, None);

    let events = h.drain();
    assert!(events.is_empty(), "events: {:?}", events);

    // Submitted jobs stay recorded as running when the unit is stopped.
    let entry = h.ledger.get("job-1").unwrap().unwrap();
    assert_eq!(entry.status, HistoryStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_poll_cadence_is_two_seconds() {
    let api = ScriptedApi::new().with_poll_fallback(not_ready());
    let h = Harness::new(api);

    let handle = h.unit(request()).spawn();
    tokio::time::sleep(Duration::from_millis(9_900)).await;
    // Polls at t = 0, 2, 4, 6, 8.
    assert_eq!(h.api.polls(), 5);
    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_cancel_checks_keeps_cadence() {
    let api = ScriptedApi::new().with_poll_fallback(not_ready());
    let h = Harness::new(api);
    let config = TaskConfig {
        cancel_checks: 0,
        ..h.config()
    };
    let unit = TaskUnit::new(Arc::clone(&h.api), h.ledger.clone(), h.sink.clone(), config, request());

    let handle = unit.spawn();
    tokio::time::sleep(Duration::from_millis(9_900)).await;
    assert_eq!(h.api.polls(), 5);
    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn test_job_failure_uses_remote_reason() {
    let api = ScriptedApi::new().with_polls([running(30), failed("content policy", "prompt blocked")]);
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert_eq!(
        outcome,
        Err(TaskFailure::JobFailed {
            reason: "content policy".into(),
            detail: Some("prompt blocked".into()),
        })
    );

    let events = h.drain();
    let finished = finished(&events);
    assert_eq!(finished[0].reason, "content policy");

    let entry = h.ledger.get("job-1").unwrap().unwrap();
    assert_eq!(entry.status, HistoryStatus::Failed);
    assert_eq!(entry.failure_reason.as_deref(), Some("content policy"));
    assert_eq!(entry.error_message.as_deref(), Some("prompt blocked"));
}

#[tokio::test(start_paused = true)]
async fn test_job_failure_without_reason_is_unknown() {
    let api = ScriptedApi::new().with_polls([Reply::Envelope(Envelope::ok(
        serde_json::json!({ "status": "failed" }),
    ))]);
    let h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert!(matches!(outcome, Err(TaskFailure::JobFailed { ref reason, .. }) if reason == "Unknown"));
}

#[tokio::test(start_paused = true)]
async fn test_poll_error_code_is_api_error() {
    let api = ScriptedApi::new().with_polls([Reply::Envelope(Envelope::error(-500, "task expired"))]);
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert_eq!(outcome, Err(TaskFailure::ApiError("task expired".into())));
    assert_eq!(finished(&h.drain())[0].reason, "API Error");
}

#[tokio::test(start_paused = true)]
async fn test_submission_rejected() {
    let api = ScriptedApi::new()
        .with_submits([Reply::Envelope(Envelope::error(1, "insufficient credits"))]);
    let mut h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert_eq!(
        outcome,
        Err(TaskFailure::SubmissionFailed("insufficient credits".into()))
    );
    assert_eq!(h.api.polls(), 0);
    assert_eq!(finished(&h.drain())[0].reason, "Submission failed");
}

#[tokio::test(start_paused = true)]
async fn test_submission_transport_error() {
    let api = ScriptedApi::new().with_submits([transport("dns failure")]);
    let h = Harness::new(api);

    let outcome = h.unit(request()).run().await.unwrap();
    assert!(matches!(outcome, Err(TaskFailure::SubmissionException(_))));
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_submission() {
    let api = ScriptedApi::new().with_polls([running(70), succeeded(&["https://x/r.png"])]);
    let h = Harness::new(api);

    let unit = h.unit(request()).with_job_id("job-9");
    assert_eq!(unit.job_id(), Some("job-9"));
    let outcome = unit.run().await.unwrap();

    assert!(outcome.is_ok());
    assert_eq!(h.api.submits(), 0);
    assert_eq!(h.api.polls(), 2);
}

// --- Registry / manager ---

#[tokio::test(start_paused = true)]
async fn test_replacing_handle_stops_old_unit() {
    let api = ScriptedApi::new().with_poll_fallback(running(10));
    let mut h = Harness::new(api);
    let manager = h.manager::<u32>();

    let first = manager.start(1, request());
    tokio::time::sleep(Duration::from_secs(5)).await;
    let before = h.drain();
    assert!(progress(&before).iter().all(|p| p.unit_id == first.to_string()));
    assert!(!before.is_empty());

    let second = manager.start(1, request());
    assert_ne!(first, second);
    assert_eq!(manager.active_count(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let after = h.drain();
    assert!(!after.is_empty());
    for event in &after {
        match event {
            TaskEvent::Progress(p) => assert_eq!(p.unit_id, second.to_string()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_resuming_live_job_under_new_handle_replaces_poller() {
    let api = ScriptedApi::new().with_poll_fallback(not_ready());
    let h = Harness::new(api);
    let manager = h.manager::<u32>();

    manager.resume(1, request(), "job-1");
    let second = manager.resume(2, request(), "job-1");

    tokio::time::sleep(Duration::from_millis(9_900)).await;
    assert_eq!(manager.active_count(), 1);
    assert!(!manager.is_active(&1));
    assert_eq!(manager.registry().unit_id(&2), Some(second));
    // One poller: t = 0, 2, 4, 6, 8.
    assert_eq!(h.api.polls(), 5);

    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_resuming_submitted_job_stops_its_first_unit() {
    let api = ScriptedApi::new().with_poll_fallback(not_ready());
    let h = Harness::new(api);
    let manager = h.manager::<u32>();

    manager.start(1, request());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.api.polls(), 1);

    manager.resume(2, request(), "job-1");
    tokio::time::sleep(Duration::from_millis(8_500)).await;
    assert!(!manager.is_active(&1));
    assert!(manager.is_active(&2));
    // The first unit polled once at t = 0; the second at t = 1, 3, 5, 7, 9.
    assert_eq!(h.api.polls(), 6);
    assert_eq!(h.api.submits(), 1);

    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_is_bounded_and_empties_registry() {
    let api = ScriptedApi::new().with_poll_fallback(not_ready());
    let mut h = Harness::new(api);
    let manager = h.manager::<usize>();

    for slot in 0..4 {
        manager.start(slot, request());
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(manager.active_count(), 4);

    let start = tokio::time::Instant::now();
    let stopped = manager.stop_all().await;
    assert_eq!(stopped, 4);
    assert!(start.elapsed() <= manager.config().stop_wait * 4);
    assert_eq!(manager.active_count(), 0);
    assert!(finished(&h.drain()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_finished_unit_leaves_registry() {
    let api = ScriptedApi::new().with_polls([succeeded(&["https://x/done.png"])]);
    let mut h = Harness::new(api);
    let manager = h.manager::<&'static str>();

    manager.start("row-1", request());
    match h.events.recv().await {
        Some(TaskEvent::Finished(f)) => assert!(f.success),
        other => panic!("unexpected event: {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!manager.is_active(&"row-1"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_single_handle() {
    let api = ScriptedApi::new().with_poll_fallback(not_ready());
    let h = Harness::new(api);
    let manager = h.manager::<u32>();

    manager.start(1, request());
    manager.start(2, request());
    assert!(manager.stop(&1));
    assert!(!manager.stop(&1));
    assert!(manager.is_active(&2));
    manager.stop_all().await;
}

// --- Retry ---

#[tokio::test(start_paused = true)]
async fn test_retry_until_success() {
    let api = ScriptedApi::new()
        .with_submits([
            Reply::Envelope(Envelope::error(1, "busy")),
            Reply::Envelope(Envelope::error(1, "busy")),
        ])
        .with_polls([succeeded(&["https://x/retry.png"])]);
    let mut h = Harness::new(api);
    let manager = h
        .manager::<u32>()
        .with_retry_policy(RetryPolicy::new(3, Duration::from_secs(1)));

    let unit_id = manager.start(0, request());

    let mut events = Vec::new();
    loop {
        let event = h.events.recv().await.unwrap();
        let done = matches!(event, TaskEvent::Finished(_));
        events.push(event);
        if done {
            break;
        }
    }

    let retries: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Retry(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].attempt, 1);
    assert_eq!(retries[1].attempt, 2);
    assert_eq!(retries[0].max_retries, 3);
    assert_eq!(retries[0].reason, "Submission failed");
    assert!(retries.iter().all(|r| r.unit_id == unit_id.to_string()));

    let finished = finished(&events);
    assert_eq!(finished.len(), 1);
    assert!(finished[0].success);
    assert_eq!(h.api.submits(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let api = ScriptedApi::new().with_submit_fallback(Reply::Envelope(Envelope::error(1, "busy")));
    let mut h = Harness::new(api);
    let manager = h
        .manager::<u32>()
        .with_retry_policy(RetryPolicy::new(2, Duration::from_secs(1)));

    manager.start(0, request());
    tokio::time::sleep(Duration::from_secs(30)).await;

    let events = h.drain();
    assert_eq!(h.api.submits(), 3);
    let finished = finished(&events);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].reason, "Submission failed");
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TaskEvent::Retry(_)))
            .count(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_retry_delay_emits_nothing() {
    let api = ScriptedApi::new().with_submit_fallback(Reply::Envelope(Envelope::error(1, "busy")));
    let mut h = Harness::new(api);
    let manager = h
        .manager::<u32>()
        .with_retry_policy(RetryPolicy::new(5, Duration::from_secs(10)));

    manager.start(0, request());
    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.stop(&0);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let events = h.drain();
    assert!(finished(&events).is_empty());
    assert_eq!(h.api.submits(), 1);
}

// --- Storage ---

#[test]
fn test_clipboard_image_lands_in_input_dir() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");

    let path = storage::save_clipboard_image(&input, b"png bytes").unwrap();
    assert_eq!(path.parent(), Some(input.as_path()));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap();
    assert!(name.starts_with("clipboard_"));
    assert!(name.ends_with(".png"));
}

#[test]
fn test_reference_files_become_data_uris() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("ref.jpg");
    std::fs::write(&file, b"jpeg bytes").unwrap();

    let prepared = storage::prepare_reference_images(&[
        file.display().to_string(),
        "https://example.com/remote.png".to_string(),
    ])
    .unwrap();
    assert!(prepared[0].starts_with("data:image/jpeg;base64,"));
    assert_eq!(prepared[1], "https://example.com/remote.png");
}
