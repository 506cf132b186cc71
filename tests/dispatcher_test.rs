use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mail_dispatcher::{
    DedupKey, DispatchError, DispatchOutcome, DispatchStatus, Dispatcher, DispatcherConfig,
    InMemoryStorage, MailRequest, MailTransport, SkipReason, TransportError,
};

/// Counts sends; fails when primed with an error.
struct FakeTransport {
    sends: AtomicUsize,
    failure: Option<fn() -> TransportError>,
}

impl FakeTransport {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            sends: AtomicUsize::new(0),
            failure: None,
        })
    }

    fn failing(failure: fn() -> TransportError) -> Arc<Self> {
        Arc::new(Self {
            sends: AtomicUsize::new(0),
            failure: Some(failure),
        })
    }

    fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn send(&self, _request: &MailRequest) -> Result<(), TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }
}

fn request(key: &str) -> MailRequest {
    MailRequest::new("RECEIPT", "noreply@example.com", "user@example.com", "Receipt")
        .with_dedup_key(key)
        .with_trace_id("trace-abc")
}

fn dispatcher(transport: Arc<FakeTransport>) -> (Dispatcher, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let config = DispatcherConfig {
        delay_table: Some("PROMO:3000".to_string()),
        default_max_retries: 3,
    };
    (
        Dispatcher::new(config, storage.clone(), transport),
        storage,
    )
}

#[tokio::test]
async fn sent_flow_records_success() {
    let transport = FakeTransport::ok();
    let (dispatcher, _storage) = dispatcher(transport.clone());
    let key = DedupKey("order-1".to_string());

    let outcome = dispatcher.dispatch(request("order-1")).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Sent {
            key: key.clone(),
            receiver: "user@example.com".to_string()
        }
    );
    assert_eq!(transport.send_count(), 1);

    let record = dispatcher.record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, DispatchStatus::Success);
    assert_eq!(record.trace_id.as_deref(), Some("trace-abc"));
    assert!(record.last_success_at.is_some());
}

#[tokio::test]
async fn replay_after_success_is_skipped_without_transport_call() {
    let transport = FakeTransport::ok();
    let (dispatcher, _storage) = dispatcher(transport.clone());

    dispatcher.dispatch(request("order-2")).await.unwrap();

    let mut handles = Vec::new();
    let dispatcher = Arc::new(dispatcher);
    for _ in 0..8 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.dispatch(request("order-2")).await.unwrap()
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped {
                key: DedupKey("order-2".to_string()),
                reason: SkipReason::AlreadySent
            }
        );
    }
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test]
async fn throttled_request_is_skipped() {
    let transport = FakeTransport::failing(|| TransportError::other("relay unavailable"));
    let (dispatcher, _storage) = dispatcher(transport.clone());
    let promo = MailRequest::new("PROMO", "noreply@example.com", "user@example.com", "Sale")
        .with_dedup_key("promo-1");

    // First attempt claims and fails at the transport.
    let err = dispatcher.dispatch(promo.clone()).await.unwrap_err();
    assert!(matches!(err, DispatchError::Transport(_)));

    // Immediate replay lands inside the delay window.
    let outcome = dispatcher.dispatch(promo).await.unwrap();
    let DispatchOutcome::Skipped { reason, .. } = outcome else {
        panic!("expected skip");
    };
    assert_eq!(
        reason,
        SkipReason::DelayActive {
            message_type: "PROMO".to_string()
        }
    );
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test]
async fn exhausted_key_reports_attempt_count() {
    let transport = FakeTransport::failing(|| TransportError::other("relay unavailable"));
    let storage = Arc::new(InMemoryStorage::new());
    let config = DispatcherConfig {
        delay_table: Some("PROMO:0".to_string()),
        default_max_retries: 2,
    };
    let dispatcher = Dispatcher::new(config, storage, transport.clone());
    let promo = MailRequest::new("PROMO", "noreply@example.com", "user@example.com", "Sale")
        .with_dedup_key("promo-2");

    for _ in 0..2 {
        let err = dispatcher.dispatch(promo.clone()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }

    let outcome = dispatcher.dispatch(promo).await.unwrap();
    let DispatchOutcome::Skipped { key, reason } = outcome else {
        panic!("expected skip");
    };
    assert_eq!(reason, SkipReason::Exhausted { attempts: 2 });
    assert_eq!(reason.to_string(), "permanently failed after 2 attempts");
    assert_eq!(transport.send_count(), 2);

    let record = dispatcher.record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, DispatchStatus::Failed);
}

#[tokio::test]
async fn validation_failure_records_outcome_and_skips_transport() {
    let transport = FakeTransport::ok();
    let (dispatcher, _storage) = dispatcher(transport.clone());
    let mut bad = request("order-3");
    bad.sender = "bad".to_string();
    bad.receiver = "bad;ok@x.com;also-bad".to_string();

    let err = dispatcher.dispatch(bad).await.unwrap_err();
    let DispatchError::Validation { errors } = err else {
        panic!("expected validation error");
    };
    assert_eq!(errors.len(), 3);
    assert_eq!(transport.send_count(), 0);

    let record = dispatcher
        .record(&DedupKey("order-3".to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DispatchStatus::Failed);
    assert_eq!(record.http_code.as_deref(), Some("400"));
    assert_eq!(record.error_code.as_deref(), Some("VALIDATION_ERROR"));
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .contains("Invalid sender email: bad"));
}

#[tokio::test]
async fn transport_timeout_recorded_as_timeout() {
    let transport = FakeTransport::failing(|| TransportError::timeout("connect timed out"));
    let (dispatcher, _storage) = dispatcher(transport);

    let err = dispatcher.dispatch(request("order-4")).await.unwrap_err();
    assert!(matches!(err, DispatchError::Transport(_)));

    let record = dispatcher
        .record(&DedupKey("order-4".to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DispatchStatus::Timeout);
    assert_eq!(record.http_code.as_deref(), Some("500"));
    assert_eq!(record.error_code.as_deref(), Some("SEND_ERROR"));
}

#[tokio::test]
async fn generates_dedup_key_and_trace_id_when_absent() {
    let transport = FakeTransport::ok();
    let (dispatcher, _storage) = dispatcher(transport);
    let req = MailRequest::new("RECEIPT", "noreply@example.com", "user@example.com", "Hi");

    let outcome = dispatcher.dispatch(req).await.unwrap();
    let DispatchOutcome::Sent { key, .. } = outcome else {
        panic!("expected sent");
    };
    assert_eq!(key.0.len(), 32);

    let record = dispatcher.record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, DispatchStatus::Success);
    assert_eq!(record.trace_id.as_deref().map(str::len), Some(32));
}

#[tokio::test]
async fn canonical_receiver_reaches_the_record_snapshot() {
    let transport = FakeTransport::ok();
    let (dispatcher, _storage) = dispatcher(transport);
    let mut req = request("order-5");
    req.receiver = "a@x.com;b@x.com".to_string();

    let outcome = dispatcher.dispatch(req).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Sent {
            key: DedupKey("order-5".to_string()),
            receiver: "a@x.com,b@x.com".to_string()
        }
    );

    let record = dispatcher
        .record(&DedupKey("order-5".to_string()))
        .await
        .unwrap()
        .unwrap();
    let snapshot = record.request_snapshot.unwrap();
    assert_eq!(
        snapshot.get("receiver").and_then(|v| v.as_str()),
        Some("a@x.com,b@x.com")
    );
}

#[tokio::test]
async fn policy_reload_takes_effect() {
    let transport = FakeTransport::failing(|| TransportError::other("down"));
    let (dispatcher, _storage) = dispatcher(transport.clone());
    let alert = MailRequest::new("ALERT", "noreply@example.com", "user@example.com", "Alert")
        .with_dedup_key("alert-1");

    // ALERT is undelayed initially: both attempts reach the transport.
    let _ = dispatcher.dispatch(alert.clone()).await;
    let _ = dispatcher.dispatch(alert.clone()).await;
    assert_eq!(transport.send_count(), 2);

    dispatcher.reload_delay_policy("ALERT:60000").await;

    // Now throttled: the claim proceeds once, then the window closes.
    let _ = dispatcher.dispatch(alert.clone()).await;
    let outcome = dispatcher.dispatch(alert).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Skipped {
            reason: SkipReason::DelayActive { .. },
            ..
        }
    ));
    assert_eq!(transport.send_count(), 3);
}
