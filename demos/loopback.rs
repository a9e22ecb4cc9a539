//! Loopback - a bridge talking to an in-process mock runner.
//!
//! This example demonstrates:
//! - Binding a [`ChannelTransport`] and spawning the listener
//! - Calls queued before the runner is ready and flushed on `crypto_ready`
//! - A subscription receiving updates before its first response
//! - Answering liveness pings on the runner side
//!
//! ```text
//! cargo run --example loopback
//! ```

use std::time::Duration;

use runner_bridge::protocol::{Envelope, ResponseFrame, PING_MESSAGE};
use runner_bridge::transport::{channel_transport, RunnerPort};
use runner_bridge::{subscriber, Bridge};
use serde_json::json;

/// Mock runner: boots, then answers a small fixed set of methods.
async fn run_runner(mut port: RunnerPort) -> runner_bridge::Result<()> {
    port.reply(&ResponseFrame::response("0", json!({"status": "load"})))
        .await?;
    port.reply(&ResponseFrame::response(
        "-1",
        json!({"url": "about:blank", "version": "0.1.0", "userAgent": "loopback"}),
    ))
    .await?;
    port.reply(&ResponseFrame::response("0", json!({"status": "crypto_ready"})))
        .await?;

    while let Some(envelope) = port.recv().await {
        let Envelope {
            id,
            message,
            request,
            ..
        } = envelope?;

        match message.as_str() {
            PING_MESSAGE => {
                port.reply(&ResponseFrame::response("0", json!({"status": "ping"})))
                    .await?
            }
            "pri(balance.get)" => {
                port.reply(&ResponseFrame::response(id, json!({"free": "100", "request": request})))
                    .await?
            }
            "pri(balance.subscribe)" => {
                for free in ["100", "125", "150"] {
                    port.reply(&ResponseFrame::subscription(id.clone(), json!({"free": free})))
                        .await?;
                }
                port.reply(&ResponseFrame::response(id, json!({"free": "150"})))
                    .await?;
            }
            other => {
                port.reply(&ResponseFrame::error(id, format!("Unknown method {}", other)))
                    .await?
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (transport, inbound, port) = channel_transport(64);
    let bridge = Bridge::builder()
        .probe_interval(Duration::from_millis(200))
        .probe_deadline(Duration::from_millis(150))
        .transport(transport)
        .build();
    bridge.spawn_listener(inbound);

    // Issued before the runner is up; held until it reports ready.
    let early = bridge.call("pri(balance.get)", json!({"address": "5F..."}));
    eprintln!("queued before ready: {}", bridge.queued_count());

    let runner = tokio::spawn(run_runner(port));

    bridge.wait_ready().await?;
    eprintln!("runner ready: {:?}", bridge.runner_info());
    eprintln!("early call: {}", early.await?);

    let first = bridge
        .subscribe(
            "pri(balance.subscribe)",
            json!({"address": "5F..."}),
            subscriber(|update| eprintln!("update: {}", update)),
        )
        .await?;
    eprintln!("subscription answered: {}", first);

    match bridge.call("pri(unknown.method)", json!({})).await {
        Ok(value) => eprintln!("unexpected success: {}", value),
        Err(e) => eprintln!("runner error: {}", e),
    }

    // Let a few probe rounds pass; the runner answers each one.
    tokio::time::sleep(Duration::from_secs(1)).await;
    eprintln!("status after probing: {}, liveness: {:?}", bridge.status(), bridge.liveness());

    bridge.unbind();
    drop(bridge);
    runner.abort();
    Ok(())
}
