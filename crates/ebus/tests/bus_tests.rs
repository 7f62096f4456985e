// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bus-tree integration tests: routing, Pub/Sub, sessions and shutdown over
//! real multiplexed links.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshkit_core::{memory, Transport, WireError};
use meshkit_ebus::{BusConfig, BusPeer, NodeConfig, Procedure, Router, RpcValue};
use meshkit_mux::{MuxConfig, MuxTransport, Side};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn bus(name: &str) -> BusPeer {
    BusPeer::new(BusConfig {
        bus_id: Some(name.to_string()),
        request_timeout: Duration::from_secs(2),
    })
}

/// Connects `parent` and `child` over an in-memory link.
async fn link_buses(parent: &BusPeer, child: &BusPeer) {
    let (a, b) = memory::link_pair(64);
    let parent_side: Arc<dyn Transport> =
        Arc::new(MuxTransport::connect(a, Side::Initiator, MuxConfig::default()));
    let child_side: Arc<dyn Transport> =
        Arc::new(MuxTransport::connect(b, Side::Acceptor, MuxConfig::default()));
    let (child_attach, parent_attach) =
        tokio::join!(parent.attach_child(parent_side), child.attach_parent(child_side));
    child_attach.expect("child attach");
    parent_attach.expect("parent attach");
}

fn echo_router() -> Router {
    Router::new().route(
        "echo.say",
        Procedure::new(|mut args, _ctx| async move { Ok(args.pop().unwrap_or_else(RpcValue::null)) }),
    )
}

/// Retries `attempt` until it yields a value; routing-table propagation is
/// asynchronous, so first tries may race the announcements.
async fn eventually<T, F, Fut>(mut attempt: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = attempt().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn local_p2p_ask_roundtrip() {
    init_tracing();
    let x = bus("x");
    let caller = x.join(NodeConfig::new("caller")).await.expect("join");
    let _callee = x
        .join(NodeConfig::new("callee").with_router(echo_router()))
        .await
        .expect("join");

    let reply = caller
        .ask("callee", "echo.say", vec![RpcValue::from("hi")])
        .await
        .expect("ok");
    assert_eq!(reply.as_str(), Some("hi"));
}

#[tokio::test]
async fn unknown_destination_is_node_not_found() {
    init_tracing();
    let x = bus("x");
    let caller = x.join(NodeConfig::new("caller")).await.expect("join");
    let err = caller.ask("ghost", "echo.say", vec![]).await.expect_err("unroutable");
    assert_eq!(err, WireError::node_not_found("ghost"));
}

#[tokio::test]
async fn group_allow_list_gates_calls() {
    init_tracing();
    let x = bus("x");
    let outsider = x.join(NodeConfig::new("outsider")).await.expect("join");
    let admin = x
        .join(NodeConfig::new("admin").with_groups(vec!["admins".to_string()]))
        .await
        .expect("join");
    let _guarded = x
        .join(
            NodeConfig::new("guarded")
                .with_allowed_caller_groups(vec!["admins".to_string()])
                .with_router(echo_router()),
        )
        .await
        .expect("join");

    let err = outsider.ask("guarded", "echo.say", vec![]).await.expect_err("denied");
    assert_eq!(err, WireError::GroupPermissionDenied { node_id: "guarded".to_string() });

    let reply = admin
        .ask("guarded", "echo.say", vec![RpcValue::from("in")])
        .await
        .expect("admitted");
    assert_eq!(reply.as_str(), Some("in"));
}

#[tokio::test]
async fn routerless_node_is_not_ready() {
    init_tracing();
    let x = bus("x");
    let caller = x.join(NodeConfig::new("caller")).await.expect("join");
    let _mute = x.join(NodeConfig::new("mute")).await.expect("join");

    let err = caller.ask("mute", "any.path", vec![]).await.expect_err("not ready");
    assert_eq!(err, WireError::ProcedureNotReady { node_id: "mute".to_string() });
}

#[tokio::test]
async fn p2p_routes_through_two_hops() {
    init_tracing();
    // B is the parent of both A and C.
    let a = bus("a");
    let b = bus("b");
    let c = bus("c");
    link_buses(&b, &a).await;
    link_buses(&b, &c).await;

    let n1 = a.join(NodeConfig::new("n1")).await.expect("join");
    let _n2 = c.join(NodeConfig::new("n2").with_router(echo_router())).await.expect("join");

    let reply = eventually(|| async {
        match timeout(Duration::from_millis(300), n1.ask("n2", "echo.say", vec![RpcValue::from("hi")]))
            .await
        {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    })
    .await;
    assert_eq!(reply.as_str(), Some("hi"));
}

#[tokio::test]
async fn broadcast_ask_collects_across_the_tree() {
    init_tracing();
    // X is the parent of Y; s1 lives on X, s2 and s3 on Y.
    let x = bus("x");
    let y = bus("y");
    link_buses(&x, &y).await;

    let asker = x.join(NodeConfig::new("asker")).await.expect("join");
    let s1 = x.join(NodeConfig::new("s1")).await.expect("join");
    let s2 = y.join(NodeConfig::new("s2")).await.expect("join");
    let s3 = y.join(NodeConfig::new("s3")).await.expect("join");

    let answer = |name: &'static str| {
        Procedure::new(move |_args, _ctx| async move { Ok(RpcValue::from(name)) })
    };
    s1.subscribe("t", answer("s1")).await.expect("subscribe");
    s2.subscribe("t", answer("s2")).await.expect("subscribe");
    s3.subscribe("t", answer("s3")).await.expect("subscribe");

    let results = eventually(|| async {
        let results = timeout(
            Duration::from_secs(1),
            asker.broadcast_ask("t", vec![RpcValue::from("q")], true),
        )
        .await
        .ok()?
        .ok()?;
        (results.len() == 3).then_some(results)
    })
    .await;
    let mut names: Vec<String> = results
        .into_iter()
        .map(|result| result.expect("subscriber answered").as_str().expect("string").to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn disconnected_branch_truncates_broadcast_ask() {
    init_tracing();
    // X is the parent of Y (answers) and Z (never answers, then dies).
    let x = bus("x");
    let y = bus("y");
    let z = bus("z");
    link_buses(&x, &y).await;
    link_buses(&x, &z).await;

    let asker = x.join(NodeConfig::new("asker")).await.expect("join");
    let s1 = x.join(NodeConfig::new("s1")).await.expect("join");
    let s3 = y.join(NodeConfig::new("s3")).await.expect("join");
    let s2 = z.join(NodeConfig::new("s2")).await.expect("join");

    s1.subscribe("t", Procedure::new(|_args, _ctx| async move { Ok(RpcValue::from("s1")) }))
        .await
        .expect("subscribe");
    s3.subscribe("t", Procedure::new(|_args, _ctx| async move { Ok(RpcValue::from("s3")) }))
        .await
        .expect("subscribe");
    // s2 suspends forever; its branch only closes by disconnecting.
    s2.subscribe(
        "t",
        Procedure::new(|_args, _ctx| async move {
            std::future::pending::<()>().await;
            Ok(RpcValue::null())
        }),
    )
    .await
    .expect("subscribe");

    // Subscribed after "t" on both remote buses, so once "ready" answers
    // from both branches, the interest in "t" has propagated too.
    s2.subscribe("ready", Procedure::new(|_args, _ctx| async move { Ok(RpcValue::from("s2")) }))
        .await
        .expect("subscribe");
    s3.subscribe("ready", Procedure::new(|_args, _ctx| async move { Ok(RpcValue::from("s3")) }))
        .await
        .expect("subscribe");
    eventually(|| async {
        let results =
            timeout(Duration::from_secs(1), asker.broadcast_ask("ready", vec![], true)).await.ok()?.ok()?;
        (results.len() == 2).then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ask = tokio::spawn({
        let args = vec![RpcValue::from("q")];
        async move { asker.broadcast_ask("t", args, true).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    z.close().await;

    let results = timeout(Duration::from_secs(3), ask)
        .await
        .expect("resolves after the branch drops")
        .expect("join")
        .expect("ok");
    let mut names: Vec<String> = results
        .into_iter()
        .map(|result| result.expect("answered").as_str().expect("string").to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["s1", "s3"], "the dead branch contributes nothing");
}

#[tokio::test]
async fn bus_streams_flow_between_nodes() {
    init_tracing();
    let x = bus("x");
    let y = bus("y");
    link_buses(&x, &y).await;

    let producer = x.join(NodeConfig::new("producer")).await.expect("join");
    let consumer = y.join(NodeConfig::new("consumer")).await.expect("join");

    let writer = eventually(|| async {
        producer.open_stream("consumer").await.ok()
    })
    .await;
    writer.send(RpcValue::from(1_i64)).expect("send");
    writer.send(RpcValue::from(2_i64)).expect("send");
    writer.finish();

    let (from, mut reader) = timeout(Duration::from_secs(2), consumer.accept_stream())
        .await
        .expect("stream surfaces")
        .expect("bus open");
    assert_eq!(from, "producer");
    assert_eq!(reader.next().await.expect("ok").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(reader.next().await.expect("ok").and_then(|v| v.as_i64()), Some(2));
    assert!(reader.next().await.expect("ok").is_none());
}

#[tokio::test]
async fn topic_streams_reach_every_subscriber() {
    init_tracing();
    let x = bus("x");
    let y = bus("y");
    link_buses(&x, &y).await;

    let publisher = x.join(NodeConfig::new("publisher")).await.expect("join");
    let near = x.join(NodeConfig::new("near")).await.expect("join");
    let far = y.join(NodeConfig::new("far")).await.expect("join");

    near.subscribe("feed", Procedure::new(|_args, _ctx| async move { Ok(RpcValue::from("near")) }))
        .await
        .expect("subscribe");
    far.subscribe("feed", Procedure::new(|_args, _ctx| async move { Ok(RpcValue::from("far")) }))
        .await
        .expect("subscribe");

    // Both subscriptions answer a broadcast once interest has propagated.
    eventually(|| async {
        let results =
            timeout(Duration::from_secs(1), publisher.broadcast_ask("feed", vec![], true)).await.ok()?.ok()?;
        (results.len() == 2).then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let writer = publisher.open_topic_stream("feed").await.expect("open");
    writer.send(RpcValue::from("tick")).expect("send");
    writer.finish();

    for subscriber in [&near, &far] {
        let (from, mut reader) = timeout(Duration::from_secs(2), subscriber.accept_stream())
            .await
            .expect("stream surfaces")
            .expect("bus open");
        assert_eq!(from, "publisher");
        assert_eq!(
            reader.next().await.expect("ok").as_ref().and_then(|v| v.as_str()),
            Some("tick")
        );
        assert!(reader.next().await.expect("ok").is_none());
    }
}

#[tokio::test]
async fn graceful_shutdown_unwinds_everything() {
    init_tracing();
    // P is the parent; X hosts two nodes, five outstanding asks and a stream.
    let p = bus("p");
    let x = bus("x");
    link_buses(&p, &x).await;

    let observer = p.join(NodeConfig::new("observer")).await.expect("join");
    let a = Arc::new(x.join(NodeConfig::new("a").with_router(echo_router())).await.expect("join"));
    let b = x
        .join(NodeConfig::new("b").with_router(Router::new().route(
            "block",
            Procedure::new(|_args, _ctx| async move {
                std::future::pending::<()>().await;
                Ok(RpcValue::null())
            }),
        )))
        .await
        .expect("join");

    // The parent can reach X's nodes before the shutdown.
    let reply = eventually(|| async {
        match timeout(
            Duration::from_millis(300),
            observer.ask("a", "echo.say", vec![RpcValue::from("up")]),
        )
        .await
        {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    })
    .await;
    assert_eq!(reply.as_str(), Some("up"));

    // Five outstanding asks and one open stream.
    let mut pending = Vec::new();
    for _ in 0..5 {
        let a = Arc::clone(&a);
        pending.push(tokio::spawn(async move { a.ask("b", "block", vec![]).await }));
    }
    let writer = a.open_stream("b").await.expect("open stream");
    let (stream_source, mut reader) =
        timeout(Duration::from_secs(1), b.accept_stream()).await.expect("stream").expect("pair");
    assert_eq!(stream_source, "a");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let close = tokio::spawn(async move {
        x.close().await;
        x
    });

    // Every outstanding ask rejects promptly with the closing error.
    for task in pending {
        let err = timeout(Duration::from_millis(200), task)
            .await
            .expect("rejects within 200ms")
            .expect("join")
            .expect_err("rejected");
        assert_eq!(err, WireError::NodeClosing);
    }
    // The stream ends with the same error on both ends.
    let err = reader.next().await.expect_err("inbound end fails");
    assert_eq!(err, WireError::NodeClosing);
    let err = writer.send(RpcValue::from(9_i64)).expect_err("outbound end fails");
    assert_eq!(err, WireError::NodeClosing);

    let _x = close.await.expect("close completes");

    // The parent's table no longer routes to the withdrawn nodes.
    let err = eventually(|| async {
        match timeout(Duration::from_millis(300), observer.ask("a", "echo.say", vec![])).await {
            Ok(Err(WireError::NodeNotFound { node_id })) => Some(WireError::NodeNotFound { node_id }),
            _ => None,
        }
    })
    .await;
    assert_eq!(err, WireError::node_not_found("a"));
}
