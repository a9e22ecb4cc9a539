//! Integration tests for runner-bridge.
//!
//! Each test drives a [`Bridge`] against a scripted runner on the other end
//! of a [`ChannelTransport`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runner_bridge::codec::WireFormat;
use runner_bridge::protocol::{Envelope, FrameBody, ResponseFrame, PING_MESSAGE};
use runner_bridge::transport::{channel_transport, ChannelTransport, RunnerPort};
use runner_bridge::{
    subscriber, Bridge, BridgeBuilder, BridgeError, CallOptions, LivenessState, RunnerStatus,
    CANCEL_METHOD,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

const T1: Duration = Duration::from_secs(18);
const T2: Duration = Duration::from_secs(16);

struct Harness {
    bridge: Bridge,
    transport: ChannelTransport,
    runner: RunnerPort,
    _listener: JoinHandle<()>,
}

fn harness_with(builder: BridgeBuilder) -> Harness {
    let (transport, inbound, runner) = channel_transport(64);
    let bridge = builder.transport(transport.clone()).build();
    let listener = bridge.spawn_listener(inbound);
    Harness {
        bridge,
        transport,
        runner,
        _listener: listener,
    }
}

fn harness() -> Harness {
    harness_with(Bridge::builder())
}

fn status(name: &str) -> ResponseFrame {
    ResponseFrame::response("0", json!({ "status": name }))
}

impl Harness {
    async fn report(&self, name: &str) {
        self.runner.reply(&status(name)).await.unwrap();
    }

    async fn boot(&self) {
        self.report("load").await;
        self.report("crypto_ready").await;
        self.bridge.wait_ready().await.unwrap();
    }

    async fn next_envelope(&mut self) -> Envelope {
        self.runner.recv().await.unwrap().unwrap()
    }

    /// Round-trip one call so every frame sent before it has been processed.
    async fn settle(&mut self) {
        let call = self.bridge.call("svc.settle", Value::Null);
        loop {
            let env = self.next_envelope().await;
            if env.message == "svc.settle" {
                self.runner
                    .reply(&ResponseFrame::response(env.id, Value::Null))
                    .await
                    .unwrap();
                break;
            }
        }
        call.await.unwrap();
    }
}

#[tokio::test]
async fn test_get_balance_round_trip() {
    let mut h = harness();
    h.boot().await;

    let call = h.bridge.call_with(
        "svc.getBalance",
        json!({"addr": "X"}),
        CallOptions::default().with_id("A1"),
    );

    let env = h.next_envelope().await;
    assert_eq!(env.id, "A1");
    assert_eq!(env.message, "svc.getBalance");
    assert_eq!(env.request, json!({"addr": "X"}));
    assert!(h.bridge.is_pending("A1"));

    h.runner
        .reply(&ResponseFrame::response("A1", json!({"balance": "100"})))
        .await
        .unwrap();

    assert_eq!(call.await.unwrap(), json!({"balance": "100"}));
    assert!(!h.bridge.is_pending("A1"));
}

#[tokio::test]
async fn test_subscription_updates_in_order() {
    let mut h = harness();
    h.boot().await;

    let (tx, mut updates) = mpsc::unbounded_channel();
    let call = h.bridge.call_with(
        "svc.subscribeBalance",
        json!({"addr": "X"}),
        CallOptions::subscribe(subscriber(move |v| {
            let _ = tx.send(v);
        }))
        .with_id("S1"),
    );
    assert_eq!(h.next_envelope().await.id, "S1");

    for balance in ["100", "150"] {
        h.runner
            .reply(&ResponseFrame::subscription("S1", json!({ "balance": balance })))
            .await
            .unwrap();
    }

    assert_eq!(updates.recv().await.unwrap(), json!({"balance": "100"}));
    assert_eq!(updates.recv().await.unwrap(), json!({"balance": "150"}));
    assert!(h.bridge.is_pending("S1"));

    h.runner
        .reply(&ResponseFrame::response("S1", json!({"balance": "150"})))
        .await
        .unwrap();
    assert_eq!(call.await.unwrap(), json!({"balance": "150"}));
    assert!(h.bridge.is_pending("S1"));
}

#[tokio::test]
async fn test_reload_rejects_everything_outstanding() {
    let mut h = harness();
    h.boot().await;
    let mut events = h.bridge.status_events();

    let s1 = h.bridge.call_with(
        "svc.subscribeBalance",
        json!({}),
        CallOptions::subscribe(subscriber(|_| {})).with_id("S1"),
    );
    let a2 = h
        .bridge
        .call_with("pri(accounts.list)", json!({}), CallOptions::default().with_id("A2"));
    h.next_envelope().await;
    h.next_envelope().await;

    h.bridge.reload().unwrap();

    assert!(matches!(s1.await, Err(BridgeError::RunnerReloaded)));
    assert!(matches!(a2.await, Err(BridgeError::RunnerReloaded)));
    assert_eq!(h.bridge.pending_count(), 0);
    assert_eq!(h.transport.reload_count(), 1);
    assert_eq!(h.bridge.status(), RunnerStatus::Reloading);
    assert_eq!(events.recv().await.unwrap(), RunnerStatus::Reloading);

    // Late answers for drained ids are ignored.
    h.runner
        .reply(&ResponseFrame::response("A2", json!([])))
        .await
        .unwrap();
    h.boot().await;
    h.settle().await;
    assert_eq!(h.bridge.pending_count(), 0);
}

#[tokio::test]
async fn test_unknown_response_is_ignored() {
    let mut h = harness();
    h.boot().await;

    let _a1 = h
        .bridge
        .call_with("svc.getBalance", json!({}), CallOptions::default().with_id("A1"));
    h.next_envelope().await;

    h.runner
        .reply(&ResponseFrame::response("Z9", json!("stray")))
        .await
        .unwrap();
    h.settle().await;

    assert!(h.bridge.is_pending("A1"));
    assert_eq!(h.bridge.pending_count(), 1);
}

#[tokio::test]
async fn test_unhandled_hook_sees_unknown_frames() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let mut h = harness_with(Bridge::builder().on_unhandled(move |frame| {
        counter.fetch_add(1, Ordering::SeqCst);
        frame.id == "Z9"
    }));
    h.boot().await;

    h.runner
        .reply(&ResponseFrame::response("Z9", json!(1)))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_app_error_is_surfaced_verbatim() {
    let mut h = harness();
    h.boot().await;

    let call = h.bridge.call("pri(accounts.export)", json!({"password": "x"}));
    let env = h.next_envelope().await;
    h.runner
        .reply(&ResponseFrame::error(env.id, "Unable to decode using the supplied passphrase"))
        .await
        .unwrap();

    match call.await {
        Err(BridgeError::App(message)) => {
            assert_eq!(message, "Unable to decode using the supplied passphrase")
        }
        other => panic!("expected app error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_missed_pong_reloads_exactly_once() {
    let mut h = harness();
    h.boot().await;
    let call = h.bridge.call("pri(x)", json!(1));

    time::sleep(T1 + T2 + Duration::from_millis(1)).await;

    assert_eq!(h.transport.reload_count(), 1);
    assert_eq!(h.bridge.status(), RunnerStatus::Reloading);
    assert_eq!(h.bridge.liveness(), LivenessState::Idle);
    assert!(matches!(call.await, Err(BridgeError::RunnerReloaded)));

    // The dead cycle does not repeat on its own.
    time::sleep(T1 * 10).await;
    assert_eq!(h.transport.reload_count(), 1);

    let x = h.next_envelope().await;
    assert_eq!(x.message, "pri(x)");
    let ping = h.next_envelope().await;
    assert_eq!(ping.id, "0");
    assert_eq!(ping.message, PING_MESSAGE);
    assert!(h.runner.try_recv().is_none());

    // After the runner boots again, pings resume on a fresh cadence.
    h.boot().await;
    assert_eq!(h.bridge.liveness(), LivenessState::Alive);
    time::sleep(T1 + Duration::from_millis(1)).await;

    assert_eq!(h.bridge.liveness(), LivenessState::Probing);
    let ping = h.next_envelope().await;
    assert_eq!(ping.id, "0");
    assert_eq!(ping.message, PING_MESSAGE);

    h.report("ping").await;
    h.settle().await;
    assert_eq!(h.bridge.liveness(), LivenessState::Alive);
    assert_eq!(h.transport.reload_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_runner_alive() {
    let h = harness();
    h.boot().await;

    let Harness {
        bridge,
        transport,
        mut runner,
        _listener,
    } = h;
    let responder = tokio::spawn(async move {
        while let Some(Ok(env)) = runner.recv().await {
            if env.message == PING_MESSAGE {
                runner.reply(&status("ping")).await.unwrap();
            }
        }
    });

    time::sleep(T1 * 6).await;
    assert_eq!(transport.reload_count(), 0);
    assert_eq!(bridge.status(), RunnerStatus::Ready);
    responder.abort();
}

#[tokio::test]
async fn test_calls_wait_for_ready() {
    let mut h = harness();
    let call = h.bridge.call("pri(accounts.list)", json!({}));
    assert_eq!(h.bridge.queued_count(), 1);
    assert!(h.runner.try_recv().is_none());

    h.report("load").await;
    h.report("crypto_ready").await;
    h.bridge.wait_ready().await.unwrap();

    let env = h.next_envelope().await;
    assert_eq!(env.message, "pri(accounts.list)");
    h.runner
        .reply(&ResponseFrame::response(env.id, json!([])))
        .await
        .unwrap();
    assert_eq!(call.await.unwrap(), json!([]));
}

#[tokio::test]
async fn test_restore_methods_bypass_gate() {
    let mut h = harness();
    let mut events = h.bridge.status_events();
    let _normal = h.bridge.call("pri(accounts.list)", json!({}));
    let _restore = h.bridge.call("mobile(storage.restore)", json!({"data": "..."}));

    h.report("require_restore").await;
    assert_eq!(events.recv().await.unwrap(), RunnerStatus::RequireRestore);
    assert_eq!(h.next_envelope().await.message, "mobile(storage.restore)");
    assert!(h.runner.try_recv().is_none());

    h.report("crypto_ready").await;
    h.bridge.wait_ready().await.unwrap();
    assert_eq!(h.next_envelope().await.message, "pri(accounts.list)");
}

#[tokio::test]
async fn test_channel_not_ready_without_transport() {
    let bridge = Bridge::builder().build();
    let result = bridge.call("svc.getBalance", json!({})).await;
    assert!(matches!(result, Err(BridgeError::ChannelNotReady)));
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn test_duplicate_explicit_id() {
    let mut h = harness();
    h.boot().await;

    let first = h
        .bridge
        .call_with("svc.a", json!(1), CallOptions::default().with_id("D1"));
    let second = h
        .bridge
        .call_with("svc.b", json!(2), CallOptions::default().with_id("D1"));
    assert!(matches!(second.await, Err(BridgeError::DuplicateId(_))));

    let env = h.next_envelope().await;
    assert_eq!(env.message, "svc.a");
    h.runner
        .reply(&ResponseFrame::response("D1", json!("a")))
        .await
        .unwrap();
    assert_eq!(first.await.unwrap(), json!("a"));
}

#[tokio::test]
async fn test_cancel_subscription() {
    let mut h = harness();
    h.boot().await;

    let _s1 = h.bridge.call_with(
        "pri(price.subscribe)",
        json!({}),
        CallOptions::subscribe(subscriber(|_| {})).with_id("S1"),
    );
    h.next_envelope().await;

    let (bridge, port) = (&h.bridge, &mut h.runner);
    let runner = async {
        let env = port.recv().await.unwrap().unwrap();
        assert_eq!(env.message, CANCEL_METHOD);
        assert_eq!(env.request, json!("S1"));
        port
            .reply(&ResponseFrame::response(env.id, json!(true)))
            .await
            .unwrap();
    };
    let (cancelled, ()) = tokio::join!(bridge.cancel("S1"), runner);

    assert!(cancelled.unwrap());
    assert!(!h.bridge.is_pending("S1"));
}

#[tokio::test]
async fn test_cancel_refused_keeps_handler() {
    let mut h = harness();
    h.boot().await;

    let _s1 = h.bridge.call_with(
        "pri(price.subscribe)",
        json!({}),
        CallOptions::subscribe(subscriber(|_| {})).with_id("S1"),
    );
    h.next_envelope().await;

    let (bridge, port) = (&h.bridge, &mut h.runner);
    let runner = async {
        let env = port.recv().await.unwrap().unwrap();
        port
            .reply(&ResponseFrame::response(env.id, json!(false)))
            .await
            .unwrap();
    };
    let (cancelled, ()) = tokio::join!(bridge.cancel("S1"), runner);

    assert!(!cancelled.unwrap());
    assert!(h.bridge.is_pending("S1"));
}

#[tokio::test]
async fn test_clear_handler_for_unclassified_id_is_local() {
    let mut h = harness();
    h.boot().await;

    let _call = h
        .bridge
        .call_with("svc.watch", json!({}), CallOptions::default().with_id("W1"));
    h.next_envelope().await;

    assert!(h.bridge.clear_handler("W1").await.unwrap());
    assert!(!h.bridge.is_pending("W1"));
    assert!(h.bridge.clear_handler("never-existed").await.unwrap());
    assert!(h.runner.try_recv().is_none());
}

#[tokio::test]
async fn test_dapp_frames_are_published() {
    let mut h = harness();
    h.boot().await;
    let mut dapp = h.bridge.dapp_events();

    let call = h.bridge.call("evm(eth_requestAccounts)", json!([]));
    let id = call.id().clone();
    h.next_envelope().await;

    h.runner
        .reply(&ResponseFrame::response(id.as_str(), json!(["0xabc"])))
        .await
        .unwrap();

    let event = dapp.recv().await.unwrap();
    assert_eq!(event.id, id);
    assert_eq!(event.frame.body, FrameBody::Response(json!(["0xabc"])));
    assert!(h.bridge.is_pending(id.as_str()));
}

#[tokio::test]
async fn test_runner_info_and_console() {
    let mut h = harness();
    h.boot().await;

    h.runner
        .reply(&ResponseFrame::response(
            "-1",
            json!({"url": "http://localhost/index.html", "version": "1.0.3", "userAgent": "UA/1"}),
        ))
        .await
        .unwrap();
    h.runner
        .reply(&ResponseFrame::response("-2", json!(["log", "runner", "started"])))
        .await
        .unwrap();
    h.settle().await;

    let info = h.bridge.runner_info().unwrap();
    assert_eq!(info.version.as_deref(), Some("1.0.3"));
    assert_eq!(info.user_agent, "UA/1");
    assert_eq!(h.bridge.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_sleep_resumes_with_probe() {
    let mut h = harness();
    h.boot().await;

    h.bridge.sleep();
    assert_eq!(h.bridge.status(), RunnerStatus::Sleeping);
    assert_eq!(h.bridge.liveness(), LivenessState::Idle);

    let queued = h.bridge.call("pri(x)", json!(1));
    time::sleep(Duration::from_secs(600)).await;
    assert!(h.runner.try_recv().is_none());

    h.bridge.wake().unwrap();
    assert_eq!(h.bridge.status(), RunnerStatus::Ready);
    assert_eq!(h.transport.reload_count(), 0);

    let x = h.next_envelope().await;
    assert_eq!(x.message, "pri(x)");
    let ping = h.next_envelope().await;
    assert_eq!(ping.message, PING_MESSAGE);

    h.runner.reply(&status("ping")).await.unwrap();
    h.runner
        .reply(&ResponseFrame::response(x.id, json!(2)))
        .await
        .unwrap();
    assert_eq!(queued.await.unwrap(), json!(2));
    assert_eq!(h.bridge.liveness(), LivenessState::Alive);
}

#[tokio::test(start_paused = true)]
async fn test_long_sleep_reloads_on_wake() {
    let h = harness();
    h.boot().await;
    let call = h.bridge.call("pri(x)", json!(1));

    h.bridge.sleep();
    time::sleep(Duration::from_secs(2 * 60 * 60)).await;
    h.bridge.wake().unwrap();

    assert_eq!(h.transport.reload_count(), 1);
    assert_eq!(h.bridge.status(), RunnerStatus::Reloading);
    assert!(matches!(call.await, Err(BridgeError::RunnerReloaded)));
}

#[tokio::test]
async fn test_rebind_and_restart_subscriptions() {
    let mut h = harness();
    h.boot().await;

    let _s1 = h.bridge.call_with(
        "pri(balance.subscribe)",
        json!({"addr": "X"}),
        CallOptions::subscribe(subscriber(|_| {})).with_id("S1"),
    );
    h.next_envelope().await;

    let (transport, _inbound, mut runner) = channel_transport(8);
    h.bridge.bind(transport);

    assert_eq!(h.bridge.restart_all().unwrap(), 1);
    let env = runner.recv().await.unwrap().unwrap();
    assert_eq!(env.id, "S1");
    assert_eq!(env.request, json!({"addr": "X"}));
}

#[tokio::test]
async fn test_msgpack_wire_format() {
    let (transport, inbound, runner) = channel_transport(16);
    let mut runner = runner.with_format(WireFormat::MsgPack);
    let bridge = Bridge::builder()
        .wire_format(WireFormat::MsgPack)
        .transport(transport)
        .build();
    bridge.spawn_listener(inbound);

    runner.reply(&status("crypto_ready")).await.unwrap();
    bridge.wait_ready().await.unwrap();

    let call = bridge.call("pri(x)", json!({"n": 1}));
    let env = runner.recv().await.unwrap().unwrap();
    assert_eq!(env.request, json!({"n": 1}));
    runner
        .reply(&ResponseFrame::response(env.id, json!({"n": 2})))
        .await
        .unwrap();
    assert_eq!(call.await.unwrap(), json!({"n": 2}));
}
