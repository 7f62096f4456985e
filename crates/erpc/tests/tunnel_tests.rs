// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Transport tunneling: a transport passed as an argument must behave on the
//! far side exactly like the real one.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use meshkit_core::{memory, Transport, WireError};
use meshkit_erpc::{ErpcConfig, ErpcNode, Procedure, Router, RpcValue};
use meshkit_mux::{MuxConfig, MuxTransport, Side};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn transport_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let (a, b) = memory::link_pair(64);
    (
        Arc::new(MuxTransport::connect(a, Side::Initiator, MuxConfig::default())),
        Arc::new(MuxTransport::connect(b, Side::Acceptor, MuxConfig::default())),
    )
}

#[tokio::test]
async fn proxy_stream_channel_reaches_the_real_transport() {
    init_tracing();
    // The callee opens a stream channel on the proxied transport and sends
    // one payload through it.
    let router = Router::new().route(
        "use-transport",
        Procedure::new(|mut args, _ctx| async move {
            let RpcValue::Transport(proxy) = args.remove(0) else {
                return Err(WireError::procedure("bad-arg", "expected a transport"));
            };
            let channel = proxy.open_stream_channel().await?;
            channel.send(serde_json::json!("x")).await?;
            Ok(RpcValue::null())
        }),
    );
    let (host_a, host_b) = transport_pair();
    let caller = ErpcNode::new(host_a, Router::new(), ErpcConfig::default());
    let _callee = ErpcNode::new(host_b, router, ErpcConfig::default());

    // The tunneled transport: one end is passed as the argument, the other
    // stays with the test and stands in for the real peer.
    let (tunneled, far_end) = transport_pair();

    caller
        .ask("use-transport", vec![RpcValue::Transport(tunneled)])
        .await
        .expect("call succeeds");

    let incoming = timeout(Duration::from_secs(2), far_end.accept_stream_channel())
        .await
        .expect("proxied stream surfaces on the real transport")
        .expect("transport open");
    let payload = timeout(Duration::from_secs(2), incoming.recv())
        .await
        .expect("payload arrives")
        .expect("channel open");
    assert_eq!(payload, serde_json::json!("x"));
}

#[tokio::test]
async fn tunnel_is_transparent_in_both_directions() {
    init_tracing();
    // The callee hands the proxy back to the test body so the test can keep
    // driving it after the call returns.
    let (proxy_tx, mut proxy_rx) = mpsc::unbounded_channel::<Arc<dyn Transport>>();
    let router = Router::new().route(
        "adopt",
        Procedure::new(move |mut args, _ctx| {
            let proxy_tx = proxy_tx.clone();
            async move {
                let RpcValue::Transport(proxy) = args.remove(0) else {
                    return Err(WireError::procedure("bad-arg", "expected a transport"));
                };
                let _ = proxy_tx.send(proxy);
                Ok(RpcValue::null())
            }
        }),
    );
    let (host_a, host_b) = transport_pair();
    let caller = ErpcNode::new(host_a, Router::new(), ErpcConfig::default());
    let _callee = ErpcNode::new(host_b, router, ErpcConfig::default());

    let (tunneled, far_end) = transport_pair();
    caller.ask("adopt", vec![RpcValue::Transport(tunneled)]).await.expect("ok");
    let proxy = timeout(Duration::from_secs(2), proxy_rx.recv()).await.expect("timely").expect("proxy");

    // Control traffic, proxy -> real peer.
    proxy.control_channel().send(serde_json::json!("from-proxy")).await.expect("send");
    let got = timeout(Duration::from_secs(2), far_end.control_channel().recv())
        .await
        .expect("timely")
        .expect("open");
    assert_eq!(got, serde_json::json!("from-proxy"));

    // Control traffic, real peer -> proxy.
    far_end.control_channel().send(serde_json::json!("from-peer")).await.expect("send");
    let got = timeout(Duration::from_secs(2), proxy.control_channel().recv())
        .await
        .expect("timely")
        .expect("open");
    assert_eq!(got, serde_json::json!("from-peer"));

    // A stream opened by the real peer surfaces as an incoming stream on the
    // proxy, payloads included.
    let peer_stream = far_end.open_stream_channel().await.expect("open");
    peer_stream.send(serde_json::json!("upstream")).await.expect("send");
    let proxied = timeout(Duration::from_secs(2), proxy.accept_stream_channel())
        .await
        .expect("incoming stream surfaces")
        .expect("proxy open");
    let got = timeout(Duration::from_secs(2), proxied.recv()).await.expect("timely").expect("open");
    assert_eq!(got, serde_json::json!("upstream"));

    // And the reverse answer flows back to the real peer.
    proxied.send(serde_json::json!("echo")).await.expect("send");
    let got = timeout(Duration::from_secs(2), peer_stream.recv()).await.expect("timely").expect("open");
    assert_eq!(got, serde_json::json!("echo"));
}

#[tokio::test]
async fn closing_the_host_tears_down_the_tunnel() {
    init_tracing();
    let (proxy_tx, mut proxy_rx) = mpsc::unbounded_channel::<Arc<dyn Transport>>();
    let router = Router::new().route(
        "adopt",
        Procedure::new(move |mut args, _ctx| {
            let proxy_tx = proxy_tx.clone();
            async move {
                let RpcValue::Transport(proxy) = args.remove(0) else {
                    return Err(WireError::procedure("bad-arg", "expected a transport"));
                };
                let _ = proxy_tx.send(proxy);
                Ok(RpcValue::null())
            }
        }),
    );
    let (host_a, host_b) = transport_pair();
    let caller = ErpcNode::new(host_a, Router::new(), ErpcConfig::default());
    let callee = ErpcNode::new(host_b, router, ErpcConfig::default());

    let (tunneled, far_end) = transport_pair();
    caller.ask("adopt", vec![RpcValue::Transport(tunneled)]).await.expect("ok");
    let proxy = timeout(Duration::from_secs(2), proxy_rx.recv()).await.expect("timely").expect("proxy");

    // Closing the host connection destroys the bridge (closing the real
    // transport) and signals close on the proxy.
    caller.close().await;

    let reason = timeout(Duration::from_secs(2), far_end.closed())
        .await
        .expect("real transport closes");
    assert!(reason.is_terminal(), "got {reason:?}");

    let reason = timeout(Duration::from_secs(2), proxy.closed())
        .await
        .expect("proxy signals close");
    assert!(reason.is_terminal(), "got {reason:?}");

    drop(callee);
}
