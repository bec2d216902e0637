#![allow(clippy::unwrap_used)]
// Integration tests for the loopback provider through the transport traits.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;

use pretty_assertions::assert_eq;

use pvac_api::{
    Action, BitSet, Callback, Channel, ChannelProvider, ConnectionState, LoopbackProvider,
    MonitorEvent, OperationEvent, OperationKind, PvRequest, PvStructure, Scalar, Status,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

fn sink<E: Send + 'static>() -> (Callback<E>, Receiver<E>) {
    let (tx, rx) = channel();
    let tx = parking_lot::Mutex::new(tx);
    let callback: Callback<E> = Arc::new(move |event| {
        let _ = tx.lock().send(event);
    });
    (callback, rx)
}

fn connect(provider: &LoopbackProvider, name: &str) -> Arc<dyn Channel> {
    let (on_state, states) = sink();
    let channel = provider.create_channel(name, on_state).unwrap();
    assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Connected);
    channel
}

fn completion(rx: &Receiver<OperationEvent>) -> (Status, Option<PvStructure>) {
    match rx.recv_timeout(WAIT).unwrap() {
        OperationEvent::Completed { status, value, .. } => (status, value),
        other => panic!("expected completion, got {other:?}"),
    }
}

fn connected(rx: &Receiver<OperationEvent>) -> (Status, Option<PvStructure>, Option<PvStructure>) {
    match rx.recv_timeout(WAIT).unwrap() {
        OperationEvent::Connected {
            status,
            put_shape,
            get_shape,
        } => (status, put_shape, get_shape),
        other => panic!("expected connect, got {other:?}"),
    }
}

// ── Channel lifecycle ───────────────────────────────────────────────

#[test]
fn channel_connects_to_existing_record() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("exampleDouble", 1.5).unwrap();

    let channel = connect(&provider, "exampleDouble");
    assert_eq!(channel.connection_state(), ConnectionState::Connected);
    assert_eq!(channel.provider_name(), "pva");
}

#[test]
fn missing_record_never_connects_until_added() {
    let provider = LoopbackProvider::new("pva").unwrap();
    let (on_state, states) = sink();
    let channel = provider.create_channel("late", on_state).unwrap();

    assert!(states.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(channel.connection_state(), ConnectionState::NeverConnected);

    provider.add_scalar("late", 0.0).unwrap();
    assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Connected);
}

#[test]
fn offline_record_disconnects_and_reconnects() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("flaky", 0.0).unwrap();
    let (on_state, states) = sink();
    let _channel = provider.create_channel("flaky", on_state).unwrap();
    assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Connected);

    provider.set_online("flaky", false).unwrap();
    assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Disconnected);
    provider.set_online("flaky", true).unwrap();
    assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Connected);
}

#[test]
fn destroyed_channel_rejects_new_requests() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    channel.destroy();
    channel.destroy();

    let (events, _rx) = sink();
    let result = channel.create_operation(OperationKind::Get, &PvRequest::all(), events);
    assert!(matches!(result, Err(pvac_api::Error::ChannelDestroyed(_))));
    assert_eq!(channel.connection_state(), ConnectionState::Destroyed);
}

// ── One-shot operations ─────────────────────────────────────────────

#[test]
fn put_then_get_round_trips() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("exampleDouble", 0.0).unwrap();
    let channel = connect(&provider, "exampleDouble");
    let request = PvRequest::parse("field(value)").unwrap();

    let (events, rx) = sink();
    let put = channel
        .create_operation(OperationKind::Put, &request, events)
        .unwrap();
    let (status, put_shape, _) = connected(&rx);
    assert!(status.is_ok());
    let mut value = put_shape.unwrap();
    value.add_field("value", 5.0);
    let mut changed = BitSet::new();
    changed.set(value.offset_of("value").unwrap());
    put.issue(Action::Put { value, changed });
    assert!(completion(&rx).0.is_ok());

    let (events, rx) = sink();
    let get = channel
        .create_operation(OperationKind::Get, &request, events)
        .unwrap();
    connected(&rx);
    get.issue(Action::Get);
    let (status, value) = completion(&rx);
    assert!(status.is_ok());
    assert_eq!(value.unwrap().scalar("value"), Some(&Scalar::Double(5.0)));
}

#[test]
fn completions_arrive_in_issue_order() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, rx) = sink();
    let put = channel
        .create_operation(OperationKind::Put, &PvRequest::all(), events)
        .unwrap();
    let shape = connected(&rx).1.unwrap();

    for v in [1.0, 2.0, 3.0] {
        let mut value = shape.clone();
        value.add_field("value", v);
        let mut changed = BitSet::new();
        changed.set(1);
        put.issue(Action::Put { value, changed });
    }
    for _ in 0..3 {
        assert!(completion(&rx).0.is_ok());
    }
    let value = provider.value("pv").unwrap();
    assert_eq!(value.scalar("value"), Some(&Scalar::Double(3.0)));
}

#[test]
fn incompatible_put_leaves_record_untouched() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 1.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, rx) = sink();
    let put = channel
        .create_operation(OperationKind::Put, &PvRequest::all(), events)
        .unwrap();
    let shape = connected(&rx).1.unwrap();

    let mut value = shape;
    value.add_field("value", "not a number");
    put.issue(Action::Put {
        value,
        changed: BitSet::whole(),
    });
    assert!(!completion(&rx).0.is_ok());
    let stored = provider.value("pv").unwrap();
    assert_eq!(stored.scalar("value"), Some(&Scalar::Double(1.0)));
}

#[test]
fn process_bumps_count() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, rx) = sink();
    let op = channel
        .create_operation(OperationKind::Process, &PvRequest::all(), events)
        .unwrap();
    assert!(connected(&rx).0.is_ok());
    op.issue(Action::Process);
    assert!(completion(&rx).0.is_ok());
    assert_eq!(provider.process_count("pv"), Some(1));
}

#[test]
fn rpc_handler_answers() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider
        .add_rpc("sum", |args| {
            let a = args.scalar("a").and_then(Scalar::as_f64).unwrap_or(0.0);
            let b = args.scalar("b").and_then(Scalar::as_f64).unwrap_or(0.0);
            Ok(PvStructure::default().with_field("sum", a + b))
        })
        .unwrap();
    let channel = connect(&provider, "sum");
    let (events, rx) = sink();
    let op = channel
        .create_operation(OperationKind::Rpc, &PvRequest::all(), events)
        .unwrap();
    assert!(connected(&rx).0.is_ok());

    let arguments = PvStructure::default()
        .with_field("a", 2.0)
        .with_field("b", 3.5);
    op.issue(Action::Rpc { arguments });
    let (status, value) = completion(&rx);
    assert!(status.is_ok());
    assert_eq!(value.unwrap().scalar("sum"), Some(&Scalar::Double(5.5)));
}

#[test]
fn rpc_on_plain_record_fails_connect() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, rx) = sink();
    let _op = channel
        .create_operation(OperationKind::Rpc, &PvRequest::all(), events)
        .unwrap();
    assert!(!connected(&rx).0.is_ok());
}

// ── Monitors ────────────────────────────────────────────────────────

#[test]
fn handles_count_one_release_each() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, _ops) = sink();
    let op = channel
        .create_operation(OperationKind::Get, &PvRequest::all(), events)
        .unwrap();
    let (events, _monitors) = sink();
    let monitor = channel
        .create_monitor(&PvRequest::all(), events)
        .unwrap();
    assert_eq!(provider.released_handles(), 0);

    op.destroy();
    op.destroy();
    monitor.destroy();
    monitor.destroy();
    assert_eq!(provider.released_handles(), 2);

    channel.destroy();
    assert_eq!(provider.released_handles(), 2);
}

#[test]
fn monitor_delivers_initial_and_updates() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, rx) = sink();
    let monitor = channel
        .create_monitor(&PvRequest::parse("value").unwrap(), events)
        .unwrap();
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        MonitorEvent::Connected { .. }
    ));
    assert!(monitor.start().is_ok());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), MonitorEvent::Event));

    let first = monitor.poll().unwrap();
    assert!(first.changed.get(0));
    monitor.release(first);

    provider.write("pv", "value", 4.0).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), MonitorEvent::Event));
    let element = monitor.poll().unwrap();
    assert_eq!(element.value.scalar("value"), Some(&Scalar::Double(4.0)));
    assert!(element.changed.get(1));
    monitor.release(element);
    assert_eq!(monitor.pending(), 0);
}

#[test]
fn full_queue_marks_overrun() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, _rx) = sink();
    let monitor = channel
        .create_monitor(
            &PvRequest::parse("record[queueSize=2]field(value)").unwrap(),
            events,
        )
        .unwrap();
    monitor.start();

    for v in 1..=4 {
        provider.write("pv", "value", f64::from(v)).unwrap();
    }
    assert_eq!(monitor.pending(), 2);
    let _initial = monitor.poll().unwrap();
    let merged = monitor.poll().unwrap();
    assert_eq!(merged.value.scalar("value"), Some(&Scalar::Double(4.0)));
    assert!(merged.overrun.get(1));
}

#[test]
fn removed_record_unlistens_monitor() {
    let provider = LoopbackProvider::new("pva").unwrap();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = connect(&provider, "pv");
    let (events, rx) = sink();
    let monitor = channel.create_monitor(&PvRequest::all(), events).unwrap();
    monitor.start();

    provider.remove_record("pv").unwrap();
    let saw_unlisten = (0..3).any(|_| {
        matches!(rx.recv_timeout(WAIT), Ok(MonitorEvent::Unlisten))
    });
    assert!(saw_unlisten);
}
