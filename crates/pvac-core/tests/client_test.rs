#![allow(clippy::unwrap_used, clippy::float_cmp)]
// End-to-end tests of the blocking client against the loopback provider.

use std::sync::mpsc::channel;
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use pvac_api::{LoopbackProvider, PvField, PvStructure, Scalar, ScalarArray, Status};
use pvac_core::{
    ClientConfig, ConnectPhase, CoreError, JoinMode, OperationPhase, PvaClient, ValueView,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> ClientConfig {
    ClientConfig {
        default_provider: "loopback".into(),
        connect_timeout: Duration::from_secs(2),
        operation_timeout: Duration::from_secs(2),
        monitor_queue_size: None,
        multi_connect_timeout: Duration::from_millis(300),
        min_connect: None,
    }
}

fn setup() -> (PvaClient, LoopbackProvider) {
    let provider = LoopbackProvider::default_name().unwrap();
    let client = PvaClient::new(config());
    client.register_provider(provider.clone());
    (client, provider)
}

fn stored(provider: &LoopbackProvider, record: &str) -> Scalar {
    provider
        .value(record)
        .and_then(|v| v.scalar("value").cloned())
        .unwrap()
}

// ── Channel and single requests ─────────────────────────────────────

#[test]
fn put_double_then_get_double() {
    let (client, provider) = setup();
    provider.add_scalar("exampleDouble", 0.0).unwrap();

    let channel = client.channel("exampleDouble").unwrap();
    assert!(channel.is_connected());
    channel.put_double(5.0).unwrap();
    assert_eq!(channel.get_double().unwrap(), 5.0);
    assert_eq!(stored(&provider, "exampleDouble"), Scalar::Double(5.0));
}

#[test]
fn string_and_array_conveniences() {
    let (client, provider) = setup();
    provider.add_scalar("name", "idle").unwrap();
    provider
        .add_scalar_array("wave", ScalarArray::from_doubles([0.0, 0.0]))
        .unwrap();

    let name = client.channel("name").unwrap();
    name.put_string("busy").unwrap();
    assert_eq!(name.get_string().unwrap(), "busy");

    let wave = client.channel("wave").unwrap();
    wave.put_double_array(&[1.0, 2.5, 4.0]).unwrap();
    assert_eq!(wave.get_double_array().unwrap(), vec![1.0, 2.5, 4.0]);
}

#[test]
fn unknown_provider_is_rejected() {
    let (client, _provider) = setup();
    let err = client.create_channel("pv", "ca").unwrap_err();
    assert_eq!(
        err,
        CoreError::UnknownProvider {
            provider: "ca".into()
        }
    );
}

#[test]
fn missing_record_times_out_on_connect() {
    let (client, _provider) = setup();
    let err = client
        .channel_with("nowhere", "loopback", Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, CoreError::ConnectFailed { .. }), "{err}");
}

#[test]
fn channels_and_requests_are_cached() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 1.0).unwrap();

    let a = client.channel("pv").unwrap();
    let b = client.channel("pv").unwrap();
    assert!(a.ptr_eq(&b));
    assert_eq!(client.cache_size(), 1);

    let get1 = a.get("field(value)").unwrap();
    let get2 = b.get("  field(value)  ").unwrap();
    assert!(Arc::ptr_eq(&get1, &get2));
    let other = a.get("field(value,alarm)").unwrap();
    assert!(!Arc::ptr_eq(&get1, &other));
    assert_eq!(a.cache_size(), 2);

    let uncached = a.create_get("field(value)").unwrap();
    assert!(!Arc::ptr_eq(&get1, &uncached));
    assert_eq!(a.cache_size(), 2);
}

#[test]
fn show_cache_lists_channels_and_requests() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 1.0).unwrap();
    let channel = client.channel("pv").unwrap();
    channel.get("field(value)").unwrap();
    channel.put("field(value)").unwrap();

    let shown = client.show_cache();
    assert!(shown.contains("channel pv provider loopback state"), "{shown}");
    assert!(shown.contains("pv get \"field(value)\""), "{shown}");
    assert!(shown.contains("pv put \"field(value)\""), "{shown}");
}

#[test]
fn get_state_machine_rejects_double_issue() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 2.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let get = channel.create_get("field(value)").unwrap();
    assert_eq!(get.connect_phase(), ConnectPhase::Idle);
    get.connect().unwrap();
    assert_eq!(get.connect_phase(), ConnectPhase::Connected);
    assert!(matches!(
        get.issue_connect(),
        Err(CoreError::IllegalState { .. })
    ));

    get.issue_get().unwrap();
    let again = get.issue_get();
    // A completion may already be in, which still forbids a second issue.
    assert!(matches!(again, Err(CoreError::AlreadyActive { .. })));
    assert!(get.wait_get().unwrap().is_ok());
    assert_eq!(get.operation_phase(), OperationPhase::Idle);
    assert_eq!(get.data().unwrap().get_double().unwrap(), 2.0);

    assert!(matches!(get.wait_get(), Err(CoreError::NotActive { .. })));
}

#[test]
fn put_put_get_and_process_reject_double_issue() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 1.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let put = channel.put("field(value)").unwrap();
    put.update(|data| data.put_double(2.0)).unwrap();
    put.issue_put().unwrap();
    assert!(matches!(put.issue_put(), Err(CoreError::AlreadyActive { .. })));
    assert!(put.wait_put().unwrap().is_ok());
    assert!(matches!(put.wait_put(), Err(CoreError::NotActive { .. })));
    assert_eq!(stored(&provider, "pv"), Scalar::Double(2.0));

    let put_get = channel
        .put_get("putField(value)getField(value)")
        .unwrap();
    put_get.update(|data| data.put_double(3.0)).unwrap();
    put_get.issue_put_get().unwrap();
    assert!(matches!(
        put_get.issue_put_get(),
        Err(CoreError::AlreadyActive { .. })
    ));
    assert!(matches!(
        put_get.issue_get_get(),
        Err(CoreError::AlreadyActive { .. })
    ));
    assert!(put_get.wait_put_get().unwrap().is_ok());
    assert_eq!(put_get.get_data().unwrap().get_double().unwrap(), 3.0);

    let before = provider.process_count("pv").unwrap();
    let process = channel.process("").unwrap();
    process.issue_process().unwrap();
    assert!(matches!(
        process.issue_process(),
        Err(CoreError::AlreadyActive { .. })
    ));
    assert!(process.wait_process().unwrap().is_ok());
    assert_eq!(provider.process_count("pv"), Some(before + 1));
}

#[test]
fn concurrent_callers_share_one_cached_request() {
    let (client, provider) = setup();
    provider.add_scalar("a", 1.0).unwrap();
    provider.set_connect_delay(Duration::from_millis(200));
    let channel = client.create_channel("a", "loopback").unwrap();

    let barrier = Barrier::new(2);
    let (first, second) = std::thread::scope(|s| {
        let one = s.spawn(|| {
            barrier.wait();
            channel.get("field(value)")
        });
        let two = s.spawn(|| {
            barrier.wait();
            channel.get("field(value)")
        });
        (one.join().unwrap(), two.join().unwrap())
    });
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(channel.cache_size(), 1);
    // Both connected one; the one left out was destroyed.
    assert_eq!(provider.released_handles(), 1);
    first.get().unwrap();
    assert_eq!(first.data().unwrap().get_double().unwrap(), 1.0);
}

#[test]
fn double_destroy_releases_transport_handle_once() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 1.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let get = channel.create_get("field(value)").unwrap();
    get.connect().unwrap();
    assert_eq!(provider.released_handles(), 0);
    get.destroy();
    get.destroy();
    assert_eq!(provider.released_handles(), 1);

    // Destroying the channel reaches the same handle again.
    channel.destroy();
    assert_eq!(provider.released_handles(), 1);
}

#[test]
fn destroyed_request_rejects_everything() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 2.0).unwrap();
    let channel = client.channel("pv").unwrap();
    let get = channel.create_get("field(value)").unwrap();
    get.connect().unwrap();

    get.destroy();
    get.destroy();
    assert!(matches!(get.issue_get(), Err(CoreError::Destroyed { .. })));
    assert!(matches!(get.get(), Err(CoreError::Destroyed { .. })));
}

#[test]
fn destroyed_channel_rejects_new_requests() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 2.0).unwrap();
    let channel = client.channel("pv").unwrap();
    let get = channel.get("field(value)").unwrap();

    channel.destroy();
    channel.destroy();
    assert_eq!(channel.cache_size(), 0);
    assert!(get.get().is_err());
    assert!(channel.get("field(value)").is_err());
}

#[test]
fn put_only_sends_changed_fields() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 1.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let put = channel.create_put("field(value)").unwrap();
    put.update(|data| data.put_double(7.0)).unwrap();
    let staged = put.data().unwrap();
    assert!(staged.changed_fields().contains(&"value".to_owned()));
    put.put().unwrap();
    assert_eq!(stored(&provider, "pv"), Scalar::Double(7.0));
    assert!(put.data().unwrap().changed_fields().is_empty());
}

#[test]
fn put_rejects_incompatible_value() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 1.0).unwrap();
    let channel = client.channel("pv").unwrap();
    let put = channel.put("field(value)").unwrap();

    let err = put.update(|data| data.put_string("not a number")).unwrap_err();
    assert!(matches!(err, CoreError::Incompatible { .. }), "{err}");
    assert_eq!(stored(&provider, "pv"), Scalar::Double(1.0));
}

#[test]
fn put_get_returns_processed_value() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 1.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let put_get = channel
        .put_get("putField(value)getField(value,alarm)")
        .unwrap();
    put_get.update(|data| data.put_double(3.5)).unwrap();
    put_get.put_get().unwrap();
    let got = put_get.get_data().unwrap();
    assert_eq!(got.get_double().unwrap(), 3.5);
    assert!(got.alarm().is_ok());

    provider.write("pv", "value", 9.0).unwrap();
    put_get.get_get().unwrap();
    assert_eq!(put_get.get_data().unwrap().get_double().unwrap(), 9.0);

    put_get.get_put().unwrap();
    assert_eq!(put_get.put_data().unwrap().get_double().unwrap(), 9.0);
}

#[test]
fn process_bumps_record_count() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let process = channel.process("").unwrap();
    process.process().unwrap();
    process.process().unwrap();
    assert_eq!(provider.process_count("pv"), Some(2));
}

// ── RPC ─────────────────────────────────────────────────────────────

fn add_sum(provider: &LoopbackProvider) {
    provider
        .add_rpc("sum", |args| {
            let a = args.scalar("a").and_then(Scalar::as_f64).unwrap_or(0.0);
            let b = args.scalar("b").and_then(Scalar::as_f64).unwrap_or(0.0);
            if a < 0.0 {
                return Err(Status::error("negative input"));
            }
            Ok(PvStructure::default().with_field("sum", a + b))
        })
        .unwrap();
}

#[test]
fn rpc_blocking_request() {
    let (client, provider) = setup();
    add_sum(&provider);
    let rpc = client.channel("sum").unwrap().rpc("").unwrap();

    let arguments = PvStructure::default()
        .with_field("a", 2.0)
        .with_field("b", 3.5);
    let result = rpc.request(arguments).unwrap();
    assert_eq!(result.scalar("sum"), Some(&Scalar::Double(5.5)));

    let bad = PvStructure::default().with_field("a", -1.0);
    let err = rpc.request(bad).unwrap_err();
    assert!(matches!(err, CoreError::OperationFailed { .. }), "{err}");
}

#[test]
fn rpc_callback_request() {
    let (client, provider) = setup();
    add_sum(&provider);
    let rpc = client.channel("sum").unwrap().create_rpc("").unwrap();
    rpc.connect().unwrap();

    let (tx, rx) = channel();
    let arguments = PvStructure::default()
        .with_field("a", 1.0)
        .with_field("b", 1.0);
    rpc.request_with(arguments, move |result| {
        let _ = tx.send(result);
    })
    .unwrap();
    let result = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(result.scalar("sum"), Some(&Scalar::Double(2.0)));
}

#[test]
fn rpc_rejects_second_request_while_one_is_outstanding() {
    let (client, provider) = setup();
    let (gate_tx, gate_rx) = channel::<()>();
    let gate = Mutex::new(gate_rx);
    provider
        .add_rpc("slow", move |args| {
            let _ = gate.lock().unwrap().recv_timeout(WAIT);
            Ok(args.clone())
        })
        .unwrap();
    let rpc = client.channel("slow").unwrap().rpc("").unwrap();

    let (tx, rx) = channel();
    let arguments = PvStructure::default().with_field("a", 1.0);
    rpc.request_with(arguments.clone(), move |result| {
        let _ = tx.send(result);
    })
    .unwrap();
    assert!(matches!(
        rpc.request_with(arguments.clone(), |_| {}),
        Err(CoreError::AlreadyActive { .. })
    ));
    assert!(matches!(
        rpc.request(arguments),
        Err(CoreError::AlreadyActive { .. })
    ));

    gate_tx.send(()).unwrap();
    let result = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(result.scalar("a"), Some(&Scalar::Double(1.0)));
}

// ── Monitor ─────────────────────────────────────────────────────────

#[test]
fn monitor_delivers_elements_in_order() {
    let (client, provider) = setup();
    provider.add_scalar("counter", 0.0).unwrap();
    let channel = client.channel("counter").unwrap();
    let monitor = channel.monitor("field(value)").unwrap();
    assert!(monitor.is_started());

    assert!(monitor.wait_event(WAIT).unwrap());
    assert_eq!(monitor.data().unwrap().get_double().unwrap(), 0.0);
    monitor.release_event().unwrap();

    provider.write("counter", "value", 1.0).unwrap();
    provider.write("counter", "value", 2.0).unwrap();

    assert!(monitor.wait_event(WAIT).unwrap());
    assert_eq!(monitor.data().unwrap().get_double().unwrap(), 1.0);
    monitor.release_event().unwrap();
    assert!(monitor.wait_event(WAIT).unwrap());
    assert_eq!(monitor.data().unwrap().get_double().unwrap(), 2.0);
    monitor.release_event().unwrap();
}

#[test]
fn monitor_enforces_poll_release_protocol() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let monitor = channel.create_monitor("field(value)").unwrap();
    assert!(matches!(monitor.poll(), Err(CoreError::NotStarted { .. })));
    monitor.start().unwrap();
    monitor.start().unwrap();

    assert!(monitor.wait_event(WAIT).unwrap());
    assert!(matches!(
        monitor.poll(),
        Err(CoreError::DidNotRelease { .. })
    ));
    monitor.release_event().unwrap();
    assert!(matches!(
        monitor.release_event(),
        Err(CoreError::NotPolled { .. })
    ));
    assert!(matches!(
        monitor.data(),
        Err(CoreError::IllegalState { .. })
    ));

    monitor.stop().unwrap();
    assert!(!monitor.is_started());
    monitor.destroy();
    monitor.destroy();
    assert!(matches!(monitor.start(), Err(CoreError::Destroyed { .. })));
}

#[test]
fn monitor_double_start_keeps_one_subscription() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 3.0).unwrap();
    let channel = client.channel("pv").unwrap();

    let monitor = channel.create_monitor("field(value)").unwrap();
    monitor.start().unwrap();
    monitor.start().unwrap();
    assert!(monitor.is_started());

    assert!(monitor.wait_event(WAIT).unwrap());
    assert_eq!(monitor.data().unwrap().get_double().unwrap(), 3.0);
    monitor.release_event().unwrap();
    assert_eq!(monitor.pending(), 0);

    monitor.destroy();
    monitor.destroy();
    assert_eq!(provider.released_handles(), 1);
}

#[test]
fn monitor_restart_with_new_request() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 4.0).unwrap();
    let channel = client.channel("pv").unwrap();
    let monitor = channel.create_monitor("field(value)").unwrap();
    monitor.start().unwrap();

    monitor.start_with("field(value,alarm)").unwrap();
    assert_eq!(monitor.request(), "field(value,alarm)");
    assert!(monitor.wait_event(WAIT).unwrap());
    let data = monitor.data().unwrap();
    assert_eq!(data.get_double().unwrap(), 4.0);
    assert!(data.alarm().is_ok());
    monitor.release_event().unwrap();
}

// ── Multi-channel ───────────────────────────────────────────────────

#[test]
fn multi_connect_reaches_minimum() {
    let (client, provider) = setup();
    for (name, value) in [("m1", 1.0), ("m2", 2.0), ("m3", 3.0)] {
        provider.add_scalar(name, value).unwrap();
    }
    let multi = client
        .create_multi_channel(&["m1", "m2", "m3", "gone1", "gone2"], "loopback")
        .unwrap();

    let connected = multi.connect_with(Duration::from_secs(1), 3).unwrap();
    assert_eq!(connected, 3);
    assert_eq!(multi.is_connected(), vec![true, true, true, false, false]);
    assert!(!multi.all_connected());
}

#[test]
fn multi_connect_below_minimum_fails() {
    let (client, provider) = setup();
    provider.add_scalar("only", 1.0).unwrap();
    let multi = client
        .create_multi_channel(&["only", "gone"], "loopback")
        .unwrap();

    let err = multi.connect().unwrap_err();
    assert_eq!(
        err,
        CoreError::ConnectCount {
            connected: 1,
            required: 2
        }
    );
    // A failed wait still ends the pending connect.
    assert!(multi.issue_connect().is_ok());
    assert_eq!(
        multi.issue_connect().unwrap_err(),
        CoreError::ConnectAlreadyIssued
    );
}

#[test]
fn multi_get_fills_nan_for_missing_channels() {
    let (client, provider) = setup();
    provider.add_scalar("g1", 1.0).unwrap();
    provider.add_scalar("g2", 2.0).unwrap();
    let multi = client
        .create_multi_channel(&["g1", "gone", "g2"], "loopback")
        .unwrap();
    multi.connect_with(Duration::from_secs(1), 2).unwrap();

    let get = multi.create_get("field(value)", JoinMode::Double).unwrap();
    get.get().unwrap();
    let values = get.double_array();
    assert_eq!(values[0], 1.0);
    assert!(values[1].is_nan());
    assert_eq!(values[2], 2.0);
    assert!(get.data(1).is_none());
    assert!(matches!(
        get.joined_structure(),
        Err(CoreError::IllegalState { .. })
    ));
}

#[test]
fn multi_get_skips_channel_lost_after_connect() {
    let (client, provider) = setup();
    provider.add_scalar("s1", 1.0).unwrap();
    provider.add_scalar("s2", 2.0).unwrap();
    let multi = client
        .create_multi_channel(&["s1", "s2"], "loopback")
        .unwrap();
    multi.connect().unwrap();

    let get = multi.create_get("field(value)", JoinMode::Double).unwrap();
    get.get().unwrap();
    assert_eq!(get.double_array(), vec![1.0, 2.0]);

    provider.set_online("s2", false).unwrap();
    let deadline = Instant::now() + WAIT;
    while multi.is_connected()[1] {
        assert!(Instant::now() < deadline, "s2 never disconnected");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(multi.connected_count(), 1);

    get.get().unwrap();
    let values = get.double_array();
    assert_eq!(values[0], 1.0);
    assert!(values[1].is_nan());
    assert!(get.data(1).is_none());
}

#[test]
fn multi_get_joins_nt_multi_channel() {
    let (client, provider) = setup();
    provider.add_scalar("j1", 1.5).unwrap();
    let multi = client
        .create_multi_channel(&["j1", "gone"], "loopback")
        .unwrap();
    multi.connect_with(Duration::from_secs(1), 1).unwrap();

    let get = multi
        .create_get("field(value,alarm,timeStamp)", JoinMode::NtMultiChannel)
        .unwrap();
    get.get().unwrap();
    let joined = get.joined_structure().unwrap();

    let Some(PvField::UnionArray(values)) = joined.field("value") else {
        panic!("value is not a union array");
    };
    assert_eq!(values[0], Some(PvField::Scalar(Scalar::Double(1.5))));
    assert_eq!(values[1], None);
    let names = joined
        .field("channelName")
        .and_then(PvField::as_scalar_array)
        .unwrap();
    assert_eq!(names.to_strings(), vec!["j1".to_owned(), "gone".to_owned()]);
    let severity = joined
        .field("severity")
        .and_then(PvField::as_scalar_array)
        .unwrap();
    assert_eq!(severity.to_doubles().unwrap()[1], 3.0);
}

#[test]
fn multi_put_is_all_or_nothing() {
    let (client, provider) = setup();
    provider.add_scalar("p1", 1.0).unwrap();
    provider.add_scalar("p2", 2.0).unwrap();
    provider.add_scalar("flag", true).unwrap();
    let multi = client
        .create_multi_channel(&["p1", "p2", "flag"], "loopback")
        .unwrap();
    multi.connect().unwrap();

    let put = multi.create_put("field(value)", JoinMode::Double).unwrap();
    let err = put.put_double_array(&[10.0, 20.0, 30.0]).unwrap_err();
    assert!(
        matches!(err, CoreError::IncompatibleType { index: 2, .. }),
        "{err}"
    );
    assert_eq!(stored(&provider, "p1"), Scalar::Double(1.0));
    assert_eq!(stored(&provider, "p2"), Scalar::Double(2.0));

    assert!(matches!(
        put.put_double_array(&[1.0]),
        Err(CoreError::ArrayLength {
            expected: 3,
            found: 1
        })
    ));
}

#[test]
fn multi_put_joined_is_all_or_nothing() {
    let (client, provider) = setup();
    provider.add_scalar("p1", 1.0).unwrap();
    provider.add_scalar("flag", true).unwrap();
    let multi = client
        .create_multi_channel(&["p1", "flag"], "loopback")
        .unwrap();
    multi.connect().unwrap();
    let put = multi
        .create_put("field(value)", JoinMode::NtMultiChannel)
        .unwrap();

    let mismatched = PvStructure::default().with_field(
        "value",
        PvField::UnionArray(vec![
            Some(PvField::Scalar(Scalar::Double(10.0))),
            Some(PvField::Scalar(Scalar::Double(1.0))),
        ]),
    );
    let err = put.put_joined(&mismatched).unwrap_err();
    assert!(
        matches!(err, CoreError::IncompatibleType { index: 1, .. }),
        "{err}"
    );
    assert_eq!(stored(&provider, "p1"), Scalar::Double(1.0));
    assert_eq!(stored(&provider, "flag"), Scalar::Boolean(true));

    // An empty slot leaves its channel alone.
    let partial = PvStructure::default().with_field(
        "value",
        PvField::UnionArray(vec![Some(PvField::Scalar(Scalar::Double(10.0))), None]),
    );
    put.put_joined(&partial).unwrap();
    assert_eq!(stored(&provider, "p1"), Scalar::Double(10.0));
    assert_eq!(stored(&provider, "flag"), Scalar::Boolean(true));

    let joined = put.joined_structure().unwrap();
    let Some(PvField::UnionArray(values)) = joined.field("value") else {
        panic!("value is not a union array");
    };
    assert_eq!(values[0], Some(PvField::Scalar(Scalar::Double(10.0))));
}

#[test]
fn multi_put_writes_every_channel() {
    let (client, provider) = setup();
    provider.add_scalar("w1", 0.0).unwrap();
    provider.add_scalar("w2", 0).unwrap();
    let multi = client
        .create_multi_channel(&["w1", "w2"], "loopback")
        .unwrap();
    multi.connect().unwrap();

    let put = multi.create_put("field(value)", JoinMode::Double).unwrap();
    put.put_double_array(&[1.5, 7.0]).unwrap();
    assert_eq!(stored(&provider, "w1"), Scalar::Double(1.5));
    assert_eq!(stored(&provider, "w2"), Scalar::Int(7));
}

#[test]
fn multi_monitor_polls_every_channel() {
    let (client, provider) = setup();
    provider.add_scalar("e1", 1.0).unwrap();
    provider.add_scalar("e2", 2.0).unwrap();
    let multi = client
        .create_multi_channel(&["e1", "e2", "gone"], "loopback")
        .unwrap();
    multi.connect_with(Duration::from_secs(1), 2).unwrap();

    let monitor = multi
        .create_monitor("field(value)", JoinMode::Double)
        .unwrap();
    assert!(matches!(monitor.poll(), Err(CoreError::NotStarted { .. })));
    monitor.start().unwrap();

    let mut seen = 0;
    while seen < 2 {
        let claimed = monitor.wait_event(WAIT).unwrap();
        assert!(claimed > 0);
        seen += claimed;
        assert!(matches!(
            monitor.poll(),
            Err(CoreError::DidNotRelease { .. })
        ));
        monitor.release().unwrap();
    }
    let values = monitor.double_array();
    assert_eq!(values[0], 1.0);
    assert_eq!(values[1], 2.0);
    assert!(values[2].is_nan());

    provider.write("e2", "value", 5.0).unwrap();
    assert_eq!(monitor.wait_event(WAIT).unwrap(), 1);
    monitor.release().unwrap();
    assert_eq!(monitor.double_array()[1], 5.0);
    assert!(matches!(monitor.release(), Err(CoreError::NotPolled { .. })));
    monitor.destroy();
}

#[test]
fn destroyed_aggregates_reject_everything() {
    let (client, provider) = setup();
    provider.add_scalar("d1", 1.0).unwrap();
    let multi = client.create_multi_channel(&["d1"], "loopback").unwrap();
    multi.connect().unwrap();

    let get = multi.create_get("field(value)", JoinMode::Double).unwrap();
    get.get().unwrap();
    let before = provider.released_handles();
    get.destroy();
    get.destroy();
    assert!(get.is_destroyed());
    assert_eq!(provider.released_handles(), before + 1);
    assert!(matches!(get.get(), Err(CoreError::Destroyed { .. })));
    assert!(matches!(get.connect(), Err(CoreError::Destroyed { .. })));
    assert!(matches!(get.wait_get(), Err(CoreError::Destroyed { .. })));

    let put = multi.create_put("field(value)", JoinMode::Double).unwrap();
    put.put_double_array(&[2.0]).unwrap();
    let before = provider.released_handles();
    put.destroy();
    put.destroy();
    assert_eq!(provider.released_handles(), before + 1);
    assert!(matches!(
        put.put_double_array(&[9.0]),
        Err(CoreError::Destroyed { .. })
    ));
    assert!(matches!(
        put.set_double_array(&[9.0]),
        Err(CoreError::Destroyed { .. })
    ));
    assert!(matches!(put.issue_put(), Err(CoreError::Destroyed { .. })));
    assert_eq!(stored(&provider, "d1"), Scalar::Double(2.0));

    let monitor = multi
        .create_monitor("field(value)", JoinMode::Double)
        .unwrap();
    monitor.start().unwrap();
    assert_eq!(monitor.wait_event(WAIT).unwrap(), 1);
    let before = provider.released_handles();
    monitor.destroy();
    monitor.destroy();
    assert_eq!(provider.released_handles(), before + 1);
    assert!(matches!(monitor.start(), Err(CoreError::Destroyed { .. })));
    assert!(matches!(monitor.poll(), Err(CoreError::Destroyed { .. })));
    assert!(matches!(monitor.release(), Err(CoreError::Destroyed { .. })));
    assert!(matches!(
        monitor.wait_event(WAIT),
        Err(CoreError::Destroyed { .. })
    ));
    assert!(matches!(monitor.stop(), Err(CoreError::Destroyed { .. })));

    // A destroyed set fails aggregates created before it was destroyed.
    let late = multi.create_get("field(value)", JoinMode::Double).unwrap();
    multi.destroy();
    assert!(matches!(late.get(), Err(CoreError::Destroyed { .. })));
    assert!(matches!(
        multi.create_put("field(value)", JoinMode::Double),
        Err(CoreError::Destroyed { .. })
    ));
}

// ── Context ─────────────────────────────────────────────────────────

#[test]
fn destroyed_client_creates_nothing() {
    let (client, provider) = setup();
    provider.add_scalar("pv", 0.0).unwrap();
    let channel = client.channel("pv").unwrap();

    client.destroy();
    client.destroy();
    assert_eq!(client.cache_size(), 0);
    assert!(!channel.is_connected());
    assert!(matches!(
        client.channel("pv"),
        Err(CoreError::Destroyed { .. })
    ));
}
