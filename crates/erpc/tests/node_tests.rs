// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end RPC tests over real multiplexed transports.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use meshkit_core::{memory, Transport, WireError};
use meshkit_erpc::{pipe, ErpcConfig, ErpcNode, Procedure, Router, RpcValue};
use meshkit_mux::{MuxConfig, MuxTransport, Side};
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

fn node_pair(remote_router: Router) -> (ErpcNode, ErpcNode) {
    let (a, b) = transport_pair();
    (
        ErpcNode::new(a, Router::new(), ErpcConfig::default()),
        ErpcNode::new(b, remote_router, ErpcConfig::default()),
    )
}

#[tokio::test]
async fn ask_roundtrip() {
    init_tracing();
    let router = Router::new().route(
        "echo",
        Procedure::new(|mut args, _ctx| async move { Ok(args.pop().unwrap_or_else(RpcValue::null)) }),
    );
    let (caller, _callee) = node_pair(router);

    let reply = timeout(Duration::from_secs(2), caller.ask("echo", vec![RpcValue::from("hi")]))
        .await
        .expect("timely")
        .expect("ok");
    assert_eq!(reply.as_str(), Some("hi"));
}

#[tokio::test]
async fn client_proxy_builds_the_same_path() {
    init_tracing();
    let router = Router::new().route(
        "math.add",
        Procedure::new(|args, _ctx| async move {
            let sum: i64 = args.iter().filter_map(RpcValue::as_i64).sum();
            Ok(RpcValue::from(sum))
        }),
    );
    let (caller, _callee) = node_pair(router);

    let via_client = caller
        .client()
        .path("math")
        .path("add")
        .ask(vec![RpcValue::from(2_i64), RpcValue::from(3_i64)])
        .await
        .expect("ok");
    let via_path = caller
        .ask("math.add", vec![RpcValue::from(2_i64), RpcValue::from(3_i64)])
        .await
        .expect("ok");
    assert_eq!(via_client.as_i64(), Some(5));
    assert_eq!(via_path.as_i64(), Some(5));
}

#[tokio::test]
async fn procedure_errors_propagate_with_classification() {
    init_tracing();
    let router = Router::new().route(
        "fail",
        Procedure::new(|_args, _ctx| async move {
            Err::<RpcValue, _>(WireError::procedure("disk", "spindle jammed"))
        }),
    );
    let (caller, _callee) = node_pair(router);

    let err = caller.ask("fail", vec![]).await.expect_err("must fail");
    assert_eq!(err, WireError::procedure("disk", "spindle jammed"));
}

#[tokio::test]
async fn unknown_path_is_rejected() {
    init_tracing();
    let (caller, _callee) = node_pair(Router::new());
    let err = caller.ask("no.such.path", vec![]).await.expect_err("must fail");
    assert!(matches!(err, WireError::Procedure { ref tag, .. } if tag == "procedure-not-found"));
}

#[tokio::test]
async fn pinned_procedure_is_callable_from_the_peer() {
    init_tracing();
    // The callee invokes whatever procedure the caller passed in.
    let router = Router::new().route(
        "apply",
        Procedure::new(|mut args, _ctx| async move {
            let RpcValue::Pin(callback) = args.remove(0) else {
                return Err(WireError::procedure("bad-arg", "expected a pin"));
            };
            callback.ask(vec![RpcValue::from(2_i64), RpcValue::from(3_i64)]).await
        }),
    );
    let (caller, _callee) = node_pair(router);

    let adder = Procedure::new(|args, _ctx| async move {
        let sum: i64 = args.iter().filter_map(RpcValue::as_i64).sum();
        Ok(RpcValue::from(sum))
    });
    let reply = timeout(
        Duration::from_secs(2),
        caller.ask("apply", vec![RpcValue::Procedure(adder)]),
    )
    .await
    .expect("timely")
    .expect("ok");
    assert_eq!(reply.as_i64(), Some(5));
}

#[tokio::test]
async fn reader_argument_streams_chunks_to_the_peer() {
    init_tracing();
    let router = Router::new().route(
        "sum",
        Procedure::new(|mut args, _ctx| async move {
            let RpcValue::Reader(reader) = args.remove(0) else {
                return Err(WireError::procedure("bad-arg", "expected a stream"));
            };
            let mut sum = 0_i64;
            while let Some(chunk) = reader.next().await? {
                sum += chunk.as_i64().unwrap_or(0);
            }
            Ok(RpcValue::from(sum))
        }),
    );
    let (caller, _callee) = node_pair(router);

    let (writer, reader) = pipe(4);
    let ask = tokio::spawn({
        let caller = caller.clone();
        async move { caller.ask("sum", vec![RpcValue::Reader(reader)]).await }
    });
    for i in 1..=3 {
        writer.push(serde_json::json!(i)).await.expect("push");
    }
    writer.finish();

    let reply = timeout(Duration::from_secs(2), ask).await.expect("timely").expect("join").expect("ok");
    assert_eq!(reply.as_i64(), Some(6));
}

#[tokio::test]
async fn writer_argument_receives_chunks_from_the_peer() {
    init_tracing();
    let router = Router::new().route(
        "produce",
        Procedure::new(|mut args, _ctx| async move {
            let RpcValue::Writer(writer) = args.remove(0) else {
                return Err(WireError::procedure("bad-arg", "expected a writer"));
            };
            writer.push(serde_json::json!("a")).await?;
            writer.push(serde_json::json!("b")).await?;
            writer.finish();
            Ok(RpcValue::null())
        }),
    );
    let (caller, _callee) = node_pair(router);

    let (writer, reader) = pipe(4);
    caller.ask("produce", vec![RpcValue::Writer(writer)]).await.expect("ok");

    assert_eq!(reader.next().await.expect("ok"), Some(serde_json::json!("a")));
    assert_eq!(reader.next().await.expect("ok"), Some(serde_json::json!("b")));
    assert_eq!(reader.next().await.expect("ok"), None);
}

#[tokio::test]
async fn graceful_close_rejects_outstanding_asks() {
    init_tracing();
    let router = Router::new().route(
        "block",
        Procedure::new(|_args, _ctx| async move {
            // Never answers; the caller's future must reject on shutdown.
            std::future::pending::<()>().await;
            Ok(RpcValue::null())
        }),
    );
    let (caller, _callee) = node_pair(router);

    let blocked = tokio::spawn({
        let caller = caller.clone();
        async move { caller.ask("block", vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    caller.close().await;
    let err = timeout(Duration::from_millis(200), blocked)
        .await
        .expect("rejects promptly")
        .expect("join")
        .expect_err("rejected");
    assert_eq!(err, WireError::NodeClosing);

    // New calls reject the same way.
    let err = caller.ask("echo", vec![]).await.expect_err("node is closed");
    assert_eq!(err, WireError::NodeClosing);
}

#[tokio::test]
async fn transport_failure_fails_outstanding_asks() {
    init_tracing();
    let (a, b) = transport_pair();
    let caller = ErpcNode::new(Arc::clone(&a), Router::new(), ErpcConfig::default());
    let _callee = ErpcNode::new(
        Arc::clone(&b),
        Router::new().route(
            "block",
            Procedure::new(|_args, _ctx| async move {
                std::future::pending::<()>().await;
                Ok(RpcValue::null())
            }),
        ),
        ErpcConfig::default(),
    );

    let blocked = tokio::spawn({
        let caller = caller.clone();
        async move { caller.ask("block", vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.abort(WireError::link_closed("pulled the plug")).await;
    let err = timeout(Duration::from_secs(1), blocked)
        .await
        .expect("fails promptly")
        .expect("join")
        .expect_err("failed");
    assert!(err.is_terminal(), "got {err:?}");
}
