//! End-to-end scenarios exercised against the in-memory queue transport and
//! idempotency doubles, since neither a live SQS-compatible queue nor
//! Postgres is available in this test environment.

use async_trait::async_trait;
use message_bus::{
    testing::FakeQueueTransport, ConsumerLoop, CycleOutcome, Envelope, IdempotencyStore, InMemoryCache,
    InMemoryProcessedEventsStore, Listener, ListenerError, Publisher, QueueResolver, TracingNotifier,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct RecordingListener {
    calls: Arc<AtomicU32>,
    last_payload: std::sync::Mutex<Option<Value>>,
}

impl RecordingListener {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            last_payload: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Listener for RecordingListener {
    async fn handle(&self, payload: &Value) -> Result<(), ListenerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_payload.lock().unwrap() = Some(payload.clone());
        Ok(())
    }
}

struct TestEnvironment {
    transport: Arc<FakeQueueTransport>,
    resolver: Arc<QueueResolver>,
    publisher: Publisher,
}

impl TestEnvironment {
    fn new() -> Self {
        let transport = Arc::new(FakeQueueTransport::new());
        let resolver = Arc::new(QueueResolver::new(transport.clone(), "test"));
        let publisher = Publisher::new(transport.clone(), resolver.clone(), "payment");
        Self {
            transport,
            resolver,
            publisher,
        }
    }

    fn consumer(&self, listeners: HashMap<String, Arc<dyn Listener>>) -> ConsumerLoop {
        let idempotency = Arc::new(IdempotencyStore::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryProcessedEventsStore::new()),
            300,
            604_800,
        ));
        ConsumerLoop::new(
            self.transport.clone(),
            self.resolver.clone(),
            idempotency,
            Arc::new(TracingNotifier),
            listeners,
            vec![],
            0.01,
            0.10,
            "payments",
            "payment",
        )
    }
}

#[tokio::test]
async fn happy_path_publish_and_consume() {
    let env = TestEnvironment::new();
    env.publisher
        .publish("payments", "payment.paid", json!({"student_id": 42, "amount": 500}), HashMap::new())
        .await
        .unwrap();

    let listener = Arc::new(RecordingListener::new());
    let mut listeners: HashMap<String, Arc<dyn Listener>> = HashMap::new();
    listeners.insert("payment.paid".to_string(), listener.clone());

    let consumer = env.consumer(listeners);
    match consumer.run_one_cycle().await.unwrap() {
        CycleOutcome::Processed(stats) => assert_eq!(stats.success.load(Ordering::SeqCst), 1),
        CycleOutcome::NoMessages => panic!("expected a processed message"),
    }

    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        listener.last_payload.lock().unwrap().clone().unwrap(),
        json!({"student_id": 42, "amount": 500})
    );

    let expected_key = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"payment.paid|");
        hasher.update(br#"{"amount":500,"student_id":42}"#);
        hex::encode(hasher.finalize())
    };
    let envelope = Envelope::wrap("payment.paid", json!({"student_id": 42, "amount": 500}), "payment");
    assert_eq!(envelope.idempotency_key, expected_key);
}

#[tokio::test]
async fn duplicate_publish_is_suppressed_on_the_second_delivery() {
    let env = TestEnvironment::new();
    let payload = json!({"student_id": 7, "amount": 100});
    env.publisher
        .publish("payments", "payment.paid", payload.clone(), HashMap::new())
        .await
        .unwrap();
    env.publisher
        .publish("payments", "payment.paid", payload, HashMap::new())
        .await
        .unwrap();

    let listener = Arc::new(RecordingListener::new());
    let mut listeners: HashMap<String, Arc<dyn Listener>> = HashMap::new();
    listeners.insert("payment.paid".to_string(), listener.clone());

    let consumer = env.consumer(listeners);
    match consumer.run_one_cycle().await.unwrap() {
        CycleOutcome::Processed(stats) => assert_eq!(stats.success.load(Ordering::SeqCst), 2),
        CycleOutcome::NoMessages => panic!("expected both deliveries to be processed"),
    }

    // Both deliveries are acked as successful, but the listener only ran once.
    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    assert_eq!(env.transport.depth("test-payments"), 0);
}

#[tokio::test]
async fn repeated_transient_failures_drain_to_the_dlq() {
    struct AlwaysTimesOut;

    #[async_trait]
    impl Listener for AlwaysTimesOut {
        async fn handle(&self, _payload: &Value) -> Result<(), ListenerError> {
            Err(ListenerError::Transient("downstream connection timed out".to_string()))
        }
    }

    let env = TestEnvironment::new();
    env.publisher
        .publish("payments", "payment.paid", json!({"student_id": 9, "amount": 250}), HashMap::new())
        .await
        .unwrap();

    let mut listeners: HashMap<String, Arc<dyn Listener>> = HashMap::new();
    listeners.insert("payment.paid".to_string(), Arc::new(AlwaysTimesOut));
    let consumer = env.consumer(listeners);

    for _ in 0..5 {
        match consumer.run_one_cycle().await.unwrap() {
            CycleOutcome::Processed(stats) => assert_eq!(stats.transient_error.load(Ordering::SeqCst), 1),
            CycleOutcome::NoMessages => panic!("expected the message to still be in flight"),
        }
    }

    // The 6th receive now exceeds max_receive_count and the transport has
    // already diverted the message straight to the DLQ.
    assert!(matches!(consumer.run_one_cycle().await.unwrap(), CycleOutcome::NoMessages));
    assert_eq!(env.transport.depth("test-payments"), 0);
    assert_eq!(env.transport.depth("test-payments-dlq"), 1);
}

#[tokio::test]
async fn permanent_failure_is_acked_on_first_attempt_and_alerts_once() {
    struct AlreadyEnrolled;

    #[async_trait]
    impl Listener for AlreadyEnrolled {
        async fn handle(&self, _payload: &Value) -> Result<(), ListenerError> {
            Err(ListenerError::BusinessRule("student already enrolled".to_string()))
        }
    }

    let env = TestEnvironment::new();
    env.publisher
        .publish("payments", "payment.paid", json!({"student_id": 3, "amount": 50}), HashMap::new())
        .await
        .unwrap();

    let mut listeners: HashMap<String, Arc<dyn Listener>> = HashMap::new();
    listeners.insert("payment.paid".to_string(), Arc::new(AlreadyEnrolled));
    let consumer = env.consumer(listeners);

    match consumer.run_one_cycle().await.unwrap() {
        CycleOutcome::Processed(stats) => assert_eq!(stats.permanent_error.load(Ordering::SeqCst), 1),
        CycleOutcome::NoMessages => panic!("expected a processed message"),
    }

    // Acked on the very first attempt, never redelivered to the DLQ.
    assert_eq!(env.transport.depth("test-payments"), 0);
    assert_eq!(env.transport.depth("test-payments-dlq"), 0);
}

#[tokio::test]
async fn unmapped_event_type_is_acked_without_a_registered_listener() {
    let env = TestEnvironment::new();
    env.publisher
        .publish("payments", "refund.issued", json!({"student_id": 3}), HashMap::new())
        .await
        .unwrap();

    // No listener registered for "refund.issued".
    let listeners: HashMap<String, Arc<dyn Listener>> = HashMap::new();
    let consumer = env.consumer(listeners);

    match consumer.run_one_cycle().await.unwrap() {
        CycleOutcome::Processed(stats) => assert_eq!(stats.permanent_error.load(Ordering::SeqCst), 1),
        CycleOutcome::NoMessages => panic!("expected a processed message"),
    }
    assert_eq!(env.transport.depth("test-payments"), 0);
}

#[tokio::test]
async fn replaying_the_dlq_republishes_onto_the_main_queue() {
    let env = TestEnvironment::new();
    env.resolver.resolve("payments").await.unwrap();
    let dlq_url = env.resolver.resolve("payments-dlq").await.unwrap();

    let stranded = Envelope::wrap("payment.paid", json!({"student_id": 11, "amount": 75}), "payment");
    env.transport
        .send_message(
            &dlq_url,
            String::from_utf8(stranded.to_bytes().unwrap()).unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(env.transport.depth("test-payments-dlq"), 1);

    let outcome = message_bus::dlq_tools::replay_dlq(
        &(env.transport.clone() as Arc<dyn message_bus::QueueTransport>),
        &env.resolver,
        &env.publisher,
        "payments",
        10,
    )
    .await
    .unwrap();

    assert_eq!(outcome.replayed, 1);
    assert_eq!(outcome.failed, 0);
    assert_eq!(env.transport.depth("test-payments-dlq"), 0);
    assert_eq!(env.transport.depth("test-payments"), 1);
}
