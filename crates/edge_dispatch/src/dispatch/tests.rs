use super::*;
use crate::activator::{Activator, Constructor};
use crate::config::DispatchConfig;
use crate::discovery::{discover, HandlerDeclaration, Registration, Subscribe};
use crate::error::{DispatchError, HandlerError};
use crate::handler::{MessageHandler, TagMessage};
use crate::marshal::{TagValue, ValueMarshaller};
use crate::transport::{Connection, ConnectionSet, MemoryConnection};
use crate::types::{Quality, RawValue, SubscriptionState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Seen<T> = Arc<Mutex<Vec<TagMessage<T>>>>;

struct Recorder<T> {
    seen: Seen<T>,
}

#[async_trait]
impl<T: TagValue> MessageHandler<T> for Recorder<T> {
    async fn handle(&self, message: TagMessage<T>, _cancel: CancellationToken) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(message);
        Ok(())
    }
}

struct AlwaysFails {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageHandler<i64> for AlwaysFails {
    async fn handle(&self, _message: TagMessage<i64>, _cancel: CancellationToken) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::msg("sensor offline"))
    }
}

#[derive(Default)]
struct Explodes;

#[async_trait]
impl MessageHandler<bool> for Explodes {
    async fn handle(&self, _message: TagMessage<bool>, _cancel: CancellationToken) -> Result<(), HandlerError> {
        panic!("handler exploded");
    }
}

struct Harness {
    engine: Arc<DispatchEngine>,
    activator: Arc<Activator>,
    plc: Arc<MemoryConnection>,
}

async fn harness(config: DispatchConfig) -> Harness {
    let plc = Arc::new(MemoryConnection::new("plc1", "plc"));
    plc.connect().await.unwrap();

    let connections = Arc::new(ConnectionSet::new());
    connections.insert(plc.clone());

    let activator = Arc::new(Activator::new(connections.clone()));
    let engine = DispatchEngine::new(
        activator.clone(),
        Arc::new(ValueMarshaller::new()),
        connections,
        config,
        tokio::runtime::Handle::current(),
        CancellationToken::new(),
    );

    Harness { engine, activator, plc }
}

fn recorder<T: TagValue>(activator: &Activator) -> Seen<T> {
    let seen: Seen<T> = Arc::new(Mutex::new(Vec::new()));
    let shared = seen.clone();
    activator
        .register_handler(vec![Constructor::new(Vec::new(), move |_| {
            Ok(Recorder { seen: shared.clone() })
        })])
        .unwrap();
    seen
}

fn registrations<H, T>(subscription: Subscribe) -> Vec<Registration>
where
    H: MessageHandler<T>,
    T: TagValue,
{
    discover(&[HandlerDeclaration::message_handler::<H, T>().subscribe(subscription)])
}

async fn settle(engine: &DispatchEngine) {
    assert!(engine.wait_idle(Duration::from_secs(5)).await, "handler tasks did not finish");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_value_invokes_handler_once() {
    let h = harness(DispatchConfig::default()).await;
    let seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "Tank.Level"));

    assert_eq!(h.engine.start_connection("plc1", &regs).await.unwrap(), 1);
    assert!(h.plc.is_subscribed("Tank.Level"));

    h.plc.set_value("Tank.Level", 4.2);
    h.plc.set_value("Tank.Level", 4.2);
    settle(&h.engine).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value, 4.2);
    assert_eq!(&*seen[0].connection, "plc1");
    assert!(seen[0].previous.is_none());
    assert!(seen[0].is_good());

    let stats = h.engine.stats();
    assert_eq!(stats.notifications_received, 2);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadband_suppresses_small_changes() {
    let h = harness(DispatchConfig::default()).await;
    let seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "Oven.Temp").deadband(0.5));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    for value in [10.0, 10.3, 11.0] {
        h.plc.set_value("Oven.Temp", value);
    }
    settle(&h.engine).await;

    let mut values: Vec<f64> = seen.lock().unwrap().iter().map(|m| m.value).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    assert_eq!(values, [10.0, 11.0]);

    let changed = seen
        .lock()
        .unwrap()
        .iter()
        .find(|m| m.value == 11.0)
        .and_then(|m| m.previous.clone());
    assert_eq!(changed, Some(RawValue::Float(10.3)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_quality_is_filtered() {
    let h = harness(DispatchConfig::default()).await;
    let seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "Flow"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    h.plc.set_value_with_quality("Flow", 3.0, Quality::Bad);
    h.plc.set_value("Flow", 3.0);
    settle(&h.engine).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(h.engine.stats().filtered, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pattern_subscription_tracks_concrete_keys() {
    let h = harness(DispatchConfig::default()).await;
    let seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "line1/+/temp"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    h.plc.set_value("line1/a/temp", 20.0);
    h.plc.set_value("line1/b/temp", 20.0);
    h.plc.set_value("line1/a/temp", 20.0);
    h.engine.on_changed("plc1", "line2/a/temp", RawValue::Float(1.0), Quality::Good);
    settle(&h.engine).await;

    let mut keys: Vec<String> = seen.lock().unwrap().iter().map(|m| m.key.to_string()).collect();
    keys.sort();
    assert_eq!(keys, ["line1/a/temp", "line1/b/temp"]);

    let stats = h.engine.stats();
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.dropped, 1);

    let infos = h.engine.subscriptions("plc1");
    assert_eq!(infos.len(), 1);
    assert!(infos[0].is_pattern);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_failures_suppress_key() {
    let config = DispatchConfig {
        error_threshold: 2,
        ..DispatchConfig::default()
    };
    let h = harness(config).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let shared = calls.clone();
    h.activator
        .register_handler(vec![Constructor::new(Vec::new(), move |_| {
            Ok(AlwaysFails { calls: shared.clone() })
        })])
        .unwrap();

    let regs = registrations::<AlwaysFails, i64>(Subscribe::new("plc1", "Counter").on_change_only(false));
    h.engine.start_connection("plc1", &regs).await.unwrap();
    assert_eq!(h.engine.state("plc1", "Counter"), SubscriptionState::Active);

    for value in 1..=3i64 {
        h.plc.set_value("Counter", value);
        settle(&h.engine).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.engine.state("plc1", "Counter"), SubscriptionState::Suppressed);
    assert!(!h.plc.is_subscribed("Counter"));

    // unsubscribed from the transport, so nothing arrives any more
    h.plc.set_value("Counter", 4i64);
    settle(&h.engine).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = h.engine.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.suppressed_keys, 1);
    assert_eq!(stats.active_subscriptions, 0);

    // an explicit re-subscribe lifts the suppression
    h.engine.subscribe_registration(&regs[0]).await.unwrap();
    assert_eq!(h.engine.state("plc1", "Counter"), SubscriptionState::Active);
    assert!(h.plc.is_subscribed("Counter"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_success_resets_failure_counter() {
    let config = DispatchConfig {
        error_threshold: 1,
        ..DispatchConfig::default()
    };
    let h = harness(config).await;

    let id = h
        .engine
        .subscribe_callback::<i64, _, _>(Subscribe::new("plc1", "Batch"), |message, _cancel| async move {
            if message.value % 2 == 1 {
                Err(HandlerError::msg("odd batch"))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

    for value in [1i64, 2, 3, 4, 5] {
        h.plc.set_value("Batch", value);
        settle(&h.engine).await;
    }

    assert_eq!(h.engine.state("plc1", "Batch"), SubscriptionState::Active);
    let infos = h.engine.subscriptions("plc1");
    assert_eq!(infos[0].id, id);
    assert_eq!(infos[0].consecutive_failures, 1);
    assert_eq!(infos[0].handler, "callback");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conversion_failure_delivers_degraded_default() {
    let h = harness(DispatchConfig::default()).await;
    let seen = recorder::<i32>(&h.activator);
    let regs = registrations::<Recorder<i32>, i32>(Subscribe::new("plc1", "Count"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    h.plc.set_value("Count", "not a number");
    settle(&h.engine).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value, 0);
    assert!(seen[0].degraded);
    assert!(!seen[0].is_good());
    assert_eq!(seen[0].raw, RawValue::Text("not a number".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_panic_is_contained_and_released() {
    let h = harness(DispatchConfig::default()).await;
    h.activator.register_default::<Explodes>().unwrap();
    let regs = registrations::<Explodes, bool>(Subscribe::new("plc1", "Estop"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    h.plc.set_value("Estop", true);
    settle(&h.engine).await;

    let stats = h.engine.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 0);
    assert_eq!(h.activator.release_count(), 1);
    assert_eq!(h.engine.subscriptions("plc1")[0].consecutive_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scoped_instance_released_per_invocation() {
    let h = harness(DispatchConfig::default()).await;
    let released = Arc::new(AtomicUsize::new(0));
    let seen: Seen<u16> = Arc::new(Mutex::new(Vec::new()));

    let shared = seen.clone();
    let counter = released.clone();
    h.activator
        .register_handler(vec![Constructor::new(Vec::new(), move |_| {
            Ok(Recorder { seen: shared.clone() })
        })
        .on_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })])
        .unwrap();

    let regs = registrations::<Recorder<u16>, u16>(Subscribe::new("plc1", "Speed"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    for value in [100u16, 200, 300] {
        h.plc.set_value("Speed", value);
    }
    settle(&h.engine).await;

    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert_eq!(h.activator.activation_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callback_subscription() {
    let h = harness(DispatchConfig::default()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    h.engine
        .subscribe_callback::<bool, _, _>(Subscribe::new("plc1", "Door.Open").unsolicited(), move |message, _cancel| {
            let tx = tx.clone();
            async move {
                tx.send((message.key.to_string(), message.value))
                    .map_err(|_| HandlerError::msg("receiver gone"))
            }
        })
        .await
        .unwrap();

    assert_eq!(
        h.plc.subscription("Door.Open").map(|s| s.mode),
        Some(crate::types::SubscriptionMode::Unsolicited)
    );

    h.plc.set_value("Door.Open", true);
    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, ("Door.Open".to_string(), true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_poll_interval_applied() {
    let config = DispatchConfig {
        default_poll_interval_ms: 250,
        ..DispatchConfig::default()
    };
    let h = harness(config).await;
    let _seen = recorder::<f64>(&h.activator);

    let regs = discover(&[HandlerDeclaration::message_handler::<Recorder<f64>, f64>()
        .subscribe(Subscribe::new("plc1", "A"))
        .subscribe(Subscribe::new("plc1", "B").poll_interval_ms(50))]);
    h.engine.start_connection("plc1", &regs).await.unwrap();

    assert_eq!(h.plc.subscription("A").unwrap().poll_interval, Duration::from_millis(250));
    assert_eq!(h.plc.subscription("B").unwrap().poll_interval, Duration::from_millis(50));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_subscriptions_rejected() {
    let h = harness(DispatchConfig::default()).await;

    let err = h
        .engine
        .subscribe_callback::<f64, _, _>(Subscribe::new("plc1", "a/#/b"), |_m, _c| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidKey(_)));

    let err = h
        .engine
        .subscribe_callback::<f64, _, _>(Subscribe::new("plc9", "A"), |_m, _c| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownConnection(name) if name == "plc9"));

    // transport refusal rolls the local subscription back
    h.plc.disconnect().await.unwrap();
    let err = h
        .engine
        .subscribe_callback::<f64, _, _>(Subscribe::new("plc1", "A"), |_m, _c| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Comm(_)));
    assert_eq!(h.engine.state("plc1", "A"), SubscriptionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_and_teardown() {
    let h = harness(DispatchConfig::default()).await;
    let _seen = recorder::<f64>(&h.activator);
    let regs = discover(&[HandlerDeclaration::message_handler::<Recorder<f64>, f64>()
        .subscribe(Subscribe::new("plc1", "A"))
        .subscribe(Subscribe::new("plc1", "B"))]);
    h.engine.start_connection("plc1", &regs).await.unwrap();

    assert!(h.engine.unsubscribe("plc1", "A").await.unwrap());
    assert!(!h.engine.unsubscribe("plc1", "A").await.unwrap());
    assert_eq!(h.engine.state("plc1", "A"), SubscriptionState::Idle);
    assert_eq!(h.plc.subscribed_keys(), ["B"]);

    assert_eq!(h.engine.teardown_connection("plc1").await, 1);
    assert!(h.plc.subscribed_keys().is_empty());
    assert_eq!(h.engine.stats().active_subscriptions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_while_disconnected_drops_local_state() {
    let h = harness(DispatchConfig::default()).await;
    let _seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "Valve.Position"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    h.plc.disconnect().await.unwrap();
    assert!(h.engine.unsubscribe("plc1", "Valve.Position").await.unwrap());
    assert_eq!(h.engine.state("plc1", "Valve.Position"), SubscriptionState::Idle);
    assert!(h.engine.subscriptions("plc1").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_replacement_keeps_live_subscription() {
    let h = harness(DispatchConfig::default()).await;
    let seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "Tank.Level"));
    h.engine.start_connection("plc1", &regs).await.unwrap();
    let original = h.engine.subscriptions("plc1")[0].id;

    h.plc.disconnect().await.unwrap();
    let err = h
        .engine
        .subscribe_callback::<f64, _, _>(Subscribe::new("plc1", "Tank.Level"), |_m, _c| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Comm(_)));
    assert_eq!(h.engine.state("plc1", "Tank.Level"), SubscriptionState::Active);
    assert_eq!(h.engine.subscriptions("plc1")[0].id, original);

    h.plc.connect().await.unwrap();
    assert_eq!(h.engine.resubscribe_connection("plc1").await.unwrap(), 1);

    h.plc.set_value("Tank.Level", 3.5);
    settle(&h.engine).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value, 3.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_restores_subscriptions() {
    let mut config = DispatchConfig::default();
    config.reconnect.initial_delay_ms = 5;
    config.reconnect.max_delay_ms = 20;
    let h = harness(config).await;
    let seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "Pressure"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    h.plc.fail_next_connects(2);
    h.plc.inject_fault("cable unplugged");
    assert!(!h.plc.is_subscribed("Pressure"));

    settle(&h.engine).await;

    assert!(h.plc.is_connected());
    assert!(h.plc.is_subscribed("Pressure"));
    assert_eq!(h.plc.connect_attempts(), 4);

    h.plc.set_value("Pressure", 2.5);
    settle(&h.engine).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_dispatch() {
    let h = harness(DispatchConfig::default()).await;
    let seen = recorder::<f64>(&h.activator);
    let regs = registrations::<Recorder<f64>, f64>(Subscribe::new("plc1", "Level"));
    h.engine.start_connection("plc1", &regs).await.unwrap();

    h.engine.shutdown().await;
    assert!(h.engine.is_shut_down());

    h.plc.set_value("Level", 1.0);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(h.engine.stats().dropped, 1);

    let err = h.engine.subscribe_registration(&regs[0]).await.unwrap_err();
    assert!(matches!(err, DispatchError::ShutDown));
}
