//! End-to-end coordination tests over an in-memory link
//!
//! Two runtimes, one per endpoint: a content-script client submitting
//! operations and a background server with registered handlers. Everything
//! crosses the wire message model; no component is short-circuited.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

use crosslink_core::types::CorrelationId;
use crosslink_runtime::{
    mem, Coordinator, CrosslinkConfig, CrosslinkError, CrosslinkRuntime, ErrorInfo,
    ExecutionContext, HandlerOutcome, OperationRequest, RecordingSink, RequestId, RequestStatus,
    StreamEvent, Submission, TabId, TransportError, WireMessage,
};

const TAB: u32 = 7;

struct Pair {
    client: Arc<Coordinator>,
    server: Arc<Coordinator>,
    client_sink: Arc<RecordingSink>,
    client_faults: Arc<mem::LinkFaults>,
    // Held for their Drop impls; dropping stops the background tasks
    _client_rt: CrosslinkRuntime,
    _server_rt: CrosslinkRuntime,
}

fn client_context() -> ExecutionContext {
    ExecutionContext::content_script(TabId::new(TAB))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn start_pair(config: CrosslinkConfig) -> Pair {
    init_tracing();
    let (mut client_end, mut server_end) =
        mem::link(client_context(), ExecutionContext::Background);

    let client_sink = Arc::new(RecordingSink::new());
    let server_sink = Arc::new(RecordingSink::new());
    let client_faults = client_end.faults();

    let mut client_rt = CrosslinkRuntime::new(
        config.clone(),
        client_context(),
        client_end.transport(),
        Arc::clone(&client_sink) as _,
    )
    .expect("client runtime");
    let mut server_rt = CrosslinkRuntime::new(
        config,
        ExecutionContext::Background,
        server_end.transport(),
        server_sink as _,
    )
    .expect("server runtime");

    client_rt
        .start(client_end.take_inbound().expect("client inbound"))
        .expect("client start");
    server_rt
        .start(server_end.take_inbound().expect("server inbound"))
        .expect("server start");

    Pair {
        client: client_rt.coordinator(),
        server: server_rt.coordinator(),
        client_sink,
        client_faults,
        _client_rt: client_rt,
        _server_rt: server_rt,
    }
}

/// Testing preset with retention long enough for late-delivery scenarios
fn late_delivery_config() -> CrosslinkConfig {
    let mut config = CrosslinkConfig::testing();
    config.tracker.terminal_retention = Duration::from_secs(3);
    config
}

fn request(id: &str, action: &str, payload: Value) -> OperationRequest {
    OperationRequest::new(RequestId::new(id), action, payload, client_context())
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ----------------------------------------------------------------------------
// Fast path
// ----------------------------------------------------------------------------

#[tokio::test]
async fn fast_path_completes_synchronously() {
    let pair = start_pair(CrosslinkConfig::testing());
    pair.server.register_handler("echo.fast", |payload, _sender| {
        Box::pin(async move { Ok(HandlerOutcome::Reply(json!({ "echo": payload }))) })
    });

    let id = RequestId::new("fast-1");
    let outcome = pair
        .client
        .submit(request("fast-1", "echo.fast", json!({"text": "hi"})))
        .await
        .unwrap();

    match outcome {
        Submission::Completed(value) => {
            assert_eq!(value, json!({"echo": {"text": "hi"}}));
        }
        other => panic!("expected completed, got {other:?}"),
    }
    // Synchronous completion leaves nothing behind on the sender
    assert_eq!(pair.client.request_status(&id), None);
}

// ----------------------------------------------------------------------------
// Deferred durable result
// ----------------------------------------------------------------------------

#[tokio::test]
async fn deferred_result_resolves_submission() {
    let pair = start_pair(CrosslinkConfig::testing());
    let server = Arc::clone(&pair.server);
    pair.server.register_handler("echo.later", move |payload, sender| {
        let server = Arc::clone(&server);
        Box::pin(async move {
            let id = sender.request_id.clone().expect("request id");
            tokio::spawn(async move {
                sleep(Duration::from_millis(30)).await;
                server
                    .complete_request(&id, Ok(json!({ "later": payload })))
                    .await
                    .expect("complete");
            });
            Ok(HandlerOutcome::WillRespondLater)
        })
    });

    let outcome = pair
        .client
        .submit(request("later-1", "echo.later", json!({"n": 2})))
        .await
        .unwrap();
    match outcome {
        Submission::Completed(value) => assert_eq!(value, json!({"later": {"n": 2}})),
        other => panic!("expected completed, got {other:?}"),
    }
    assert_eq!(
        pair.client.request_status(&RequestId::new("later-1")),
        Some(RequestStatus::Completed)
    );
}

// ----------------------------------------------------------------------------
// Streaming
// ----------------------------------------------------------------------------

#[tokio::test]
async fn streaming_delivers_updates_in_order_then_end() {
    let pair = start_pair(CrosslinkConfig::testing());
    let server = Arc::clone(&pair.server);
    pair.server
        .register_handler("stream.chunks", move |_payload, sender| {
            let server = Arc::clone(&server);
            Box::pin(async move {
                let id = sender.request_id.clone().expect("request id");
                tokio::spawn(async move {
                    for seq in 1..=3u64 {
                        server
                            .stream_update(&id, seq, json!({ "chunk": seq }))
                            .await
                            .expect("update");
                    }
                    server
                        .end_stream(&id, Ok(json!("assembled")))
                        .await
                        .expect("end");
                });
                Ok(HandlerOutcome::Streaming)
            })
        });

    let outcome = pair
        .client
        .submit(request("stream-1", "stream.chunks", json!({"text": "body"})))
        .await
        .unwrap();
    let mut rx = match outcome {
        Submission::Streaming(rx) => rx,
        other => panic!("expected streaming, got {other:?}"),
    };

    let mut seqs = Vec::new();
    loop {
        match rx.recv().await.expect("stream event") {
            StreamEvent::Update { seq, .. } => seqs.push(seq),
            StreamEvent::End { outcome } => {
                assert_eq!(outcome, Ok(json!("assembled")));
                break;
            }
        }
    }
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn large_text_payload_selects_streaming_path_up_front() {
    let pair = start_pair(CrosslinkConfig::testing());
    let server = Arc::clone(&pair.server);
    // The destination only ACKs; the payload shape alone must pick the
    // streaming path on the sending side
    pair.server
        .register_handler("translate.page", move |_payload, sender| {
            let server = Arc::clone(&server);
            Box::pin(async move {
                let id = sender.request_id.clone().expect("request id");
                tokio::spawn(async move {
                    for seq in 1..=2u64 {
                        server
                            .stream_update(&id, seq, json!({ "part": seq }))
                            .await
                            .expect("update");
                    }
                    server
                        .end_stream(&id, Ok(json!("whole page")))
                        .await
                        .expect("end");
                });
                Ok(HandlerOutcome::WillRespondLater)
            })
        });

    let text = "x".repeat(3000);
    let outcome = pair
        .client
        .submit(request("page-1", "translate.page", json!({ "text": text })))
        .await
        .unwrap();
    let mut rx = match outcome {
        Submission::Streaming(rx) => rx,
        other => panic!("expected streaming for a 3000-char payload, got {other:?}"),
    };

    let mut seqs = Vec::new();
    loop {
        match rx.recv().await.expect("stream event") {
            StreamEvent::Update { seq, .. } => seqs.push(seq),
            StreamEvent::End { outcome } => {
                assert_eq!(outcome, Ok(json!("whole page")));
                break;
            }
        }
    }
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn stream_finishing_before_the_ack_still_resolves() {
    let pair = start_pair(CrosslinkConfig::testing());
    let server = Arc::clone(&pair.server);
    // The whole stream is produced before the fast reply leaves
    pair.server
        .register_handler("stream.instant", move |_payload, sender| {
            let server = Arc::clone(&server);
            Box::pin(async move {
                let id = sender.request_id.clone().expect("request id");
                server
                    .stream_update(&id, 1, json!("only"))
                    .await
                    .expect("update");
                server
                    .end_stream(&id, Ok(json!("done")))
                    .await
                    .expect("end");
                Ok(HandlerOutcome::Streaming)
            })
        });

    let outcome = pair
        .client
        .submit(request("instant-1", "stream.instant", json!({})))
        .await
        .unwrap();
    let mut rx = match outcome {
        Submission::Streaming(rx) => rx,
        other => panic!("expected streaming, got {other:?}"),
    };

    assert!(matches!(
        rx.recv().await,
        Some(StreamEvent::Update { seq: 1, .. })
    ));
    match rx.recv().await.expect("end event") {
        StreamEvent::End { outcome } => assert_eq!(outcome, Ok(json!("done"))),
        other => panic!("expected end, got {other:?}"),
    }
    assert_eq!(
        pair.client.request_status(&RequestId::new("instant-1")),
        Some(RequestStatus::Completed)
    );
}

#[tokio::test]
async fn result_message_terminates_streaming_subscriber() {
    let pair = start_pair(CrosslinkConfig::testing());
    let server = Arc::clone(&pair.server);
    // The destination opens a stream but finishes with a plain result
    pair.server
        .register_handler("stream.result", move |_payload, sender| {
            let server = Arc::clone(&server);
            Box::pin(async move {
                let id = sender.request_id.clone().expect("request id");
                tokio::spawn(async move {
                    sleep(Duration::from_millis(30)).await;
                    server
                        .complete_request(&id, Ok(json!("final")))
                        .await
                        .expect("complete");
                });
                Ok(HandlerOutcome::Streaming)
            })
        });

    let outcome = pair
        .client
        .submit(request("sr-1", "stream.result", json!({})))
        .await
        .unwrap();
    let mut rx = match outcome {
        Submission::Streaming(rx) => rx,
        other => panic!("expected streaming, got {other:?}"),
    };

    match rx.recv().await.expect("terminal event") {
        StreamEvent::End { outcome } => assert_eq!(outcome, Ok(json!("final"))),
        other => panic!("expected terminal event, got {other:?}"),
    }
    assert_eq!(
        pair.client.request_status(&RequestId::new("sr-1")),
        Some(RequestStatus::Completed)
    );
}

#[tokio::test]
async fn stalled_stream_times_out_softly_and_late_end_is_dispatched() {
    let pair = start_pair(late_delivery_config());
    let server = Arc::clone(&pair.server);
    pair.server
        .register_handler("stream.stall", move |_payload, sender| {
            let server = Arc::clone(&server);
            Box::pin(async move {
                let id = sender.request_id.clone().expect("request id");
                tokio::spawn(async move {
                    server
                        .stream_update(&id, 1, json!("first"))
                        .await
                        .expect("update");
                    // Stall well past the progress window, then finish anyway
                    sleep(Duration::from_millis(1500)).await;
                    server
                        .end_stream(&id, Ok(json!("eventually")))
                        .await
                        .expect("end");
                });
                Ok(HandlerOutcome::Streaming)
            })
        });

    let outcome = pair
        .client
        .submit(request("stall-1", "stream.stall", json!({"text": "x"})))
        .await
        .unwrap();
    let mut rx = match outcome {
        Submission::Streaming(rx) => rx,
        other => panic!("expected streaming, got {other:?}"),
    };

    assert!(matches!(
        rx.recv().await,
        Some(StreamEvent::Update { seq: 1, .. })
    ));
    match rx.recv().await.expect("timeout event") {
        StreamEvent::End { outcome: Err(error) } => {
            assert_eq!(error.kind, "stream_timeout");
        }
        other => panic!("expected soft timeout, got {other:?}"),
    }
    assert_eq!(
        pair.client.request_status(&RequestId::new("stall-1")),
        Some(RequestStatus::TimedOut)
    );

    // The stream finishes anyway; the outcome reaches the origin through
    // the dispatcher instead of the (gone) subscriber
    let sink = Arc::clone(&pair.client_sink);
    wait_for("late stream end dispatch", || !sink.deliveries().is_empty()).await;
    let deliveries = pair.client_sink.deliveries();
    assert_eq!(deliveries[0].1.id, RequestId::new("stall-1"));
    assert_eq!(deliveries[0].1.outcome, Ok(json!("eventually")));
}

// ----------------------------------------------------------------------------
// Circuit breaker
// ----------------------------------------------------------------------------

#[tokio::test]
async fn breaker_opens_after_threshold_failures() {
    let pair = start_pair(CrosslinkConfig::testing());
    pair.client_faults.close();

    // Three consecutive failures leave the breaker closed
    for i in 0..3 {
        let err = pair
            .client
            .submit(request(&format!("b-{i}"), "echo.fast", json!({})))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                CrosslinkError::Transport(TransportError::ChannelClosed { .. })
            ),
            "failure {i} should still reach the wire"
        );
    }

    // The fourth opens it
    let err = pair
        .client
        .submit(request("b-3", "echo.fast", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CrosslinkError::Transport(TransportError::ChannelClosed { .. })
    ));

    // Now attempts are rejected without touching the wire
    let err = pair
        .client
        .submit(request("b-4", "echo.fast", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, CrosslinkError::CircuitOpen { .. }));

    // Every failed submission went terminal in the tracker
    assert_eq!(
        pair.client.request_status(&RequestId::new("b-4")),
        Some(RequestStatus::Failed)
    );
}

#[tokio::test]
async fn breaker_recovers_after_reset_timeout() {
    let pair = start_pair(CrosslinkConfig::testing());
    pair.server.register_handler("echo.fast", |payload, _sender| {
        Box::pin(async move { Ok(HandlerOutcome::Reply(payload)) })
    });
    pair.client_faults.close();

    for i in 0..4 {
        let _ = pair
            .client
            .submit(request(&format!("rb-{i}"), "echo.fast", json!({})))
            .await
            .unwrap_err();
    }
    pair.client_faults.reopen();

    // Wait out the reset timeout (200ms in the testing preset), then the
    // half-open probe goes through and recovery begins
    sleep(Duration::from_millis(250)).await;
    let outcome = pair
        .client
        .submit(request("rb-probe", "echo.fast", json!({"ok": 1})))
        .await
        .unwrap();
    assert!(matches!(outcome, Submission::Completed(_)));
}

// ----------------------------------------------------------------------------
// Durable fallback after an unanswered fast exchange
// ----------------------------------------------------------------------------

#[tokio::test]
async fn unanswered_fast_exchange_resolves_through_durable_resend() {
    let pair = start_pair(CrosslinkConfig::testing());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_handler = Arc::clone(&calls);
    pair.server.register_handler("echo.fast", move |payload, _sender| {
        let calls = Arc::clone(&calls_in_handler);
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Reply(json!({ "echo": payload })))
        })
    });
    // Only the fast exchange is lossy; the durable path stays up
    pair.client_faults.drop_next_requests(1);

    let outcome = pair
        .client
        .submit(request("fb-1", "echo.fast", json!({"text": "hi"})))
        .await
        .unwrap();
    match outcome {
        Submission::Completed(value) => {
            assert_eq!(value, json!({"echo": {"text": "hi"}}));
        }
        other => panic!("expected completed, got {other:?}"),
    }

    // Exactly one fallback, exactly one handler run
    assert_eq!(pair.client.channel().stats().durable_fallbacks, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ----------------------------------------------------------------------------
// Deduplication at the receiving side
// ----------------------------------------------------------------------------

#[tokio::test]
async fn wire_duplicate_replays_cached_result_without_rerunning_handler() {
    let pair = start_pair(CrosslinkConfig::testing());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_handler = Arc::clone(&calls);
    pair.server
        .register_handler("count.calls", move |_payload, _sender| {
            let calls = Arc::clone(&calls_in_handler);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(HandlerOutcome::Reply(json!({ "call": n })))
            })
        });

    let channel = Arc::clone(pair.client.channel());
    let message = WireMessage::request(
        "count.calls",
        RequestId::new("dup-1"),
        json!({}),
        Some(client_context()),
    );
    let sender = crosslink_runtime::SenderInfo::new(Some(client_context()));

    let first = channel
        .request(message.clone(), sender.clone(), true)
        .await
        .unwrap();
    let second = channel.request(message, sender, true).await.unwrap();

    assert_eq!(
        first,
        crosslink_runtime::ChannelOutcome::Completed(json!({"call": 1}))
    );
    assert_eq!(second, crosslink_runtime::ChannelOutcome::Completed(json!({"call": 1})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ----------------------------------------------------------------------------
// Soft result timeout and late delivery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn late_result_after_timeout_reaches_dispatcher_once() {
    let pair = start_pair(late_delivery_config());
    let server = Arc::clone(&pair.server);
    pair.server
        .register_handler("echo.slow", move |_payload, sender| {
            let server = Arc::clone(&server);
            Box::pin(async move {
                let id = sender.request_id.clone().expect("request id");
                tokio::spawn(async move {
                    // Past the default timeout class (300ms in testing)
                    sleep(Duration::from_millis(600)).await;
                    server
                        .complete_request(&id, Ok(json!({"slow": true})))
                        .await
                        .expect("complete");
                });
                Ok(HandlerOutcome::WillRespondLater)
            })
        });

    let err = pair
        .client
        .submit(request("slow-1", "echo.slow", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CrosslinkError::Transport(TransportError::ResultTimeout { .. })
    ));
    assert_eq!(
        pair.client.request_status(&RequestId::new("slow-1")),
        Some(RequestStatus::TimedOut)
    );

    let sink = Arc::clone(&pair.client_sink);
    wait_for("late result dispatch", || !sink.deliveries().is_empty()).await;
    let deliveries = pair.client_sink.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].1.outcome, Ok(json!({"slow": true})));

    // A duplicate of the same result must not be delivered twice
    pair.server
        .channel()
        .send(WireMessage::result_ok(RequestId::new("slow-1"), json!({"slow": true})))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(pair.client_sink.deliveries().len(), 1);
}

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn tab_navigation_cancels_in_flight_requests() {
    let pair = start_pair(CrosslinkConfig::testing());
    pair.server.register_handler("hang", |_payload, _sender| {
        Box::pin(async move { Ok(HandlerOutcome::WillRespondLater) })
    });

    let client = Arc::clone(&pair.client);
    let pending = tokio::spawn(async move {
        client
            .submit(
                request("nav-1", "hang", json!({}))
                    .with_correlation(CorrelationId::new("ui-1")),
            )
            .await
    });

    // Give the fast exchange time to complete and the request to park
    let coordinator = Arc::clone(&pair.client);
    wait_for("request in processing", move || {
        coordinator.request_status(&RequestId::new("nav-1")) == Some(RequestStatus::Processing)
    })
    .await;

    let cancelled = pair.client.cancel_for_tab(TabId::new(TAB), "navigation");
    assert_eq!(cancelled, 1);
    assert_eq!(
        pair.client.request_status(&RequestId::new("nav-1")),
        Some(RequestStatus::Cancelled)
    );

    // The parked submission resolves with an error, not a hang
    let result = pending.await.expect("join");
    assert!(result.is_err());
}

#[tokio::test]
async fn cancel_notifies_the_destination() {
    let pair = start_pair(CrosslinkConfig::testing());
    pair.server.register_handler("hang", |_payload, _sender| {
        Box::pin(async move { Ok(HandlerOutcome::WillRespondLater) })
    });

    let client = Arc::clone(&pair.client);
    let pending = tokio::spawn(async move {
        client.submit(request("rc-1", "hang", json!({}))).await
    });

    let server = Arc::clone(&pair.server);
    wait_for("request accepted remotely", move || {
        server.request_status(&RequestId::new("rc-1")) == Some(RequestStatus::Processing)
    })
    .await;

    let cancelled = pair.client.cancel(&RequestId::new("rc-1"), "user closed view");
    assert!(matches!(cancelled, Ok(true)));

    // The notice crosses the wire and stops the remote entry too
    let server = Arc::clone(&pair.server);
    wait_for("remote cancellation", move || {
        server.request_status(&RequestId::new("rc-1")) == Some(RequestStatus::Cancelled)
    })
    .await;

    // An unknown id is a no-op, not an error
    assert!(matches!(
        pair.client.cancel(&RequestId::new("rc-nope"), "noise"),
        Ok(false)
    ));

    let result = pending.await.expect("join");
    assert!(result.is_err());
}

// ----------------------------------------------------------------------------
// Destination-reported failure
// ----------------------------------------------------------------------------

#[tokio::test]
async fn destination_failure_propagates_without_retry() {
    let pair = start_pair(CrosslinkConfig::testing());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_handler = Arc::clone(&calls);
    pair.server
        .register_handler("always.fails", move |_payload, _sender| {
            let calls = Arc::clone(&calls_in_handler);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(crosslink_core::CrosslinkError::destination(
                    "provider",
                    "quota exceeded",
                ))
            })
        });

    let err = pair
        .client
        .submit(request("df-1", "always.fails", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, CrosslinkError::Destination { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The channel stayed healthy: a follow-up to a working handler succeeds
    pair.server.register_handler("echo.fast", |payload, _sender| {
        Box::pin(async move { Ok(HandlerOutcome::Reply(payload)) })
    });
    let outcome = pair
        .client
        .submit(request("df-2", "echo.fast", json!({"ok": true})))
        .await
        .unwrap();
    assert!(matches!(outcome, Submission::Completed(_)));
}

// ----------------------------------------------------------------------------
// Unknown actions
// ----------------------------------------------------------------------------

#[tokio::test]
async fn unknown_action_fails_fast() {
    let pair = start_pair(CrosslinkConfig::testing());

    let err = pair
        .client
        .submit(request("ua-1", "no.such.action", json!({})))
        .await
        .unwrap_err();
    match err {
        CrosslinkError::Destination { kind, .. } => assert_eq!(kind, "unknown_action"),
        other => panic!("expected destination failure, got {other}"),
    }
}

// ----------------------------------------------------------------------------
// Wire format sanity across the link
// ----------------------------------------------------------------------------

#[tokio::test]
async fn error_payload_shape_survives_the_wire() {
    let info = ErrorInfo::new("quota exceeded", "provider");
    let message = WireMessage::result_err(RequestId::new("w-1"), info);
    let raw = message.to_json().unwrap();
    assert!(raw.contains("\"type\":\"provider\""));
    let parsed = WireMessage::from_json(&raw).unwrap();
    assert_eq!(parsed, message);
}
