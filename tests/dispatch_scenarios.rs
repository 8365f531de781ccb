//! End-to-end dispatch scenarios on virtual time.
//!
//! Every test runs with a paused tokio clock, so minute-long budget waits
//! complete instantly while `Instant::now()` still reports the simulated time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modelqueue::budget::CostEstimator;
use modelqueue::{
    transport_fn, CallResult, DispatchError, Dispatcher, DispatcherConfig, EstimationError, Message,
    MemoryCache, PendingCall, ResourceClassConfig, TokenUsage, Transport, TransportError,
};
use serde_json::json;
use tokio::time::Instant;

fn fixed_cost(tokens: u64) -> CostEstimator {
    CostEstimator::new(move |_: &[Message]| Ok::<u64, EstimationError>(tokens))
}

fn call(class: &str) -> PendingCall {
    PendingCall::new(class, vec![Message::user("What is a token bucket?")])
}

/// Transport that succeeds and records when each attempt started.
fn recording_transport(log: Arc<Mutex<Vec<Instant>>>) -> Arc<dyn Transport> {
    Arc::new(transport_fn(move |_call: PendingCall| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(Instant::now());
            Ok::<_, TransportError>(CallResult::new(
                json!({"choices": [{"message": {"content": "ok"}}]}),
                TokenUsage::new(600, 0),
            ))
        }
    }))
}

#[tokio::test(start_paused = true)]
async fn test_one_request_per_minute_blocks_second_call_for_a_full_window() {
    let dispatcher = Dispatcher::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    dispatcher
        .register_with_estimator(
            "slow",
            ResourceClassConfig::new(1, 1000),
            recording_transport(Arc::clone(&log)),
            fixed_cost(600),
        )
        .unwrap();

    let start = Instant::now();
    let first = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch(call("slow")).await }
    });
    let second = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch(call("slow")).await }
    });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(log.lock().unwrap().len(), 1);
    // Exactly one of the two got through; the other is still waiting.
    assert!(first.is_finished() ^ second.is_finished());
    assert_eq!(dispatcher.get("slow").unwrap().status().waiting, 1);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(log[0] - start < Duration::from_secs(1));
    let gap = log[1] - start;
    assert!(gap >= Duration::from_secs(60), "second call admitted after {gap:?}");
    assert!(gap < Duration::from_secs(61), "second call admitted after {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_class_fails_without_waiting() {
    let dispatcher = Dispatcher::new();
    dispatcher
        .register_class(
            "gpt-4",
            200,
            40_000,
            recording_transport(Arc::default()),
        )
        .unwrap();

    let start = Instant::now();
    let err = dispatcher.dispatch(call("gpt-x")).await.unwrap_err();

    assert_eq!(start.elapsed(), Duration::ZERO);
    match err {
        DispatchError::UnknownResourceClass { name } => assert_eq!(name, "gpt-x"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_never_overcommit_tokens() {
    let dispatcher = Dispatcher::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    dispatcher
        .register_with_estimator(
            "shared",
            ResourceClassConfig::new(1_000, 1_000),
            recording_transport(Arc::clone(&log)),
            fixed_cost(250),
        )
        .unwrap();

    let start = Instant::now();
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            // An explicit zero cap keeps the reservation at exactly 250.
            tokio::spawn(async move { dispatcher.dispatch(call("shared").with_output_cap(0)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 6);
    // 250 tokens take 15s to refill, so only four fit before then.
    let early = log
        .iter()
        .filter(|at| **at - start < Duration::from_secs(15))
        .count();
    assert_eq!(early, 4);
}

#[tokio::test(start_paused = true)]
async fn test_failing_transport_is_tried_exactly_max_attempts_times() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let transport = transport_fn(move |_call: PendingCall| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<CallResult, _>(TransportError::Remote {
                status: 503,
                message: "overloaded".to_string(),
            })
        }
    });

    let dispatcher = Dispatcher::new();
    dispatcher
        .register_with_estimator(
            "flaky",
            ResourceClassConfig::new(100, 100_000).with_max_attempts(3),
            Arc::new(transport),
            fixed_cost(10),
        )
        .unwrap();

    let err = dispatcher.dispatch(call("flaky")).await.unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(err.is_retryable());
    match err {
        DispatchError::Exhausted {
            resource_class,
            attempts,
            last_error,
        } => {
            assert_eq!(resource_class, "flaky");
            assert_eq!(attempts, 3);
            assert!(matches!(last_error, TransportError::Remote { status: 503, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // No stray attempt shows up later.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_class_does_not_block_other_classes() {
    let dispatcher = Dispatcher::new();
    let busy_log = Arc::new(Mutex::new(Vec::new()));
    let free_log = Arc::new(Mutex::new(Vec::new()));
    dispatcher
        .register_with_estimator(
            "busy",
            ResourceClassConfig::new(1, 1000),
            recording_transport(Arc::clone(&busy_log)),
            fixed_cost(600),
        )
        .unwrap();
    dispatcher
        .register_with_estimator(
            "free",
            ResourceClassConfig::new(100, 100_000),
            recording_transport(Arc::clone(&free_log)),
            fixed_cost(600),
        )
        .unwrap();

    dispatcher.dispatch(call("busy")).await.unwrap();
    let blocked = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch(call("busy")).await }
    });
    tokio::task::yield_now().await;

    let start = Instant::now();
    dispatcher.dispatch(call("free")).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!blocked.is_finished());

    blocked.await.unwrap().unwrap();
    assert_eq!(busy_log.lock().unwrap().len(), 2);
    assert_eq!(free_log.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_hit_skips_budget_and_transport() {
    let cache = Arc::new(MemoryCache::new());
    let dispatcher = Dispatcher::with_cache(cache.clone());
    let log = Arc::new(Mutex::new(Vec::new()));
    dispatcher
        .register_with_estimator(
            "slow",
            ResourceClassConfig::new(1, 1000),
            recording_transport(Arc::clone(&log)),
            fixed_cost(600),
        )
        .unwrap();

    let first = dispatcher.dispatch(call("slow")).await.unwrap();

    // A second identical call would otherwise wait a full minute.
    let start = Instant::now();
    let second = dispatcher.dispatch(call("slow")).await.unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(first, second);
    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reregistering_resets_the_budget() {
    let dispatcher = Dispatcher::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let config = ResourceClassConfig::new(1, 1000);
    dispatcher
        .register_with_estimator(
            "m",
            config.clone(),
            recording_transport(Arc::clone(&log)),
            fixed_cost(600),
        )
        .unwrap();
    dispatcher.dispatch(call("m")).await.unwrap();
    assert_eq!(dispatcher.get("m").unwrap().status().budget.available_requests, 0);

    dispatcher
        .register_with_estimator(
            "m",
            config,
            recording_transport(Arc::clone(&log)),
            fixed_cost(600),
        )
        .unwrap();

    let start = Instant::now();
    dispatcher.dispatch(call("m")).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_works_as_a_tower_service() {
    use tower::Service;

    let mut service = Dispatcher::new();
    service
        .register_class("gpt-4", 200, 40_000, recording_transport(Arc::default()))
        .unwrap();

    futures::future::poll_fn(|cx| service.poll_ready(cx))
        .await
        .unwrap();
    let result = service
        .call(call("gpt-4").with_output_cap(32))
        .await
        .unwrap();
    assert_eq!(result.usage.prompt_tokens, 600);

    let err = service.call(call("nope")).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownResourceClass { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_classes_loaded_from_file_keep_their_names() {
    let temp_dir = tempfile::TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("limits.toml");
    std::fs::write(
        &path,
        "[classes.\"Claude-3-Opus\"]\nrequest_capacity = 50\ntoken_capacity = 20000\n",
    )
    .expect("write config");

    let config = DispatcherConfig::load(&path).expect("load");
    let log = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Dispatcher::from_config(config, |_| recording_transport(Arc::clone(&log)))
        .unwrap();

    assert_eq!(dispatcher.classes(), vec!["Claude-3-Opus"]);
    dispatcher
        .dispatch(call("Claude-3-Opus").with_output_cap(16))
        .await
        .unwrap();
    assert_eq!(log.lock().unwrap().len(), 1);
}
