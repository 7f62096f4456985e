// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The bus peer actor.
//!
//! One single-reader task owns everything: the local-node registry, both
//! routing tables, the bridges, the session registry and the pending-call
//! table. Handles and bridges talk to it exclusively over the command queue;
//! procedure handlers run on their own tasks and report back as commands.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use meshkit_core::{CloseSignal, Transport, WireError};
use meshkit_erpc::{CallContext, ErpcNode, Procedure, Router, RpcValue};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ask::{AskOutcome, RelayAskSession, RootAskSession};
use crate::bridge::{connect_bridge, BridgeHandle};
use crate::envelope::{
    Announcement, BroadcastEnvelope, BroadcastPayload, Envelope, Exchange, MessageSource, P2pEnvelope,
    P2pPayload, StreamEnvelope, StreamPayload, SubUpdateEntry,
};
use crate::node::NodeHandle;
use crate::routing::{P2pTable, RouteEntry, SubscriptionTable};
use crate::session::{SessionEvent, SessionManager};
use crate::stream::{
    BusStreamReader, BusStreamWriter, InboundStreamSession, OutboundStreamSession, StreamItem,
    StreamTarget,
};
use crate::{BusId, NodeId, Topic};

fn stream_envelope(source: NodeId, target: &StreamTarget, payload: StreamPayload) -> StreamEnvelope {
    match target {
        StreamTarget::Node(destination) => StreamEnvelope {
            source_id: source,
            destination_id: Some(destination.clone()),
            topic: None,
            payload,
        },
        StreamTarget::Topic(topic) => StreamEnvelope {
            source_id: source,
            destination_id: None,
            topic: Some(topic.clone()),
            payload,
        },
    }
}

/// Bus-level configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// This bus's identity; a random v4 uuid when unset.
    pub bus_id: Option<String>,
    /// Deadline for correlated bridge exchanges; a miss is a connection
    /// fault.
    pub request_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { bus_id: None, request_timeout: Duration::from_secs(10) }
    }
}

/// What a joining node brings to the bus.
pub struct NodeConfig {
    pub id: String,
    pub groups: Vec<String>,
    /// Caller groups admitted to this node's procedures; `None` (or empty)
    /// admits everyone.
    pub allowed_caller_groups: Option<Vec<String>>,
    pub router: Option<Router>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), groups: Vec::new(), allowed_caller_groups: None, router: None }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_allowed_caller_groups(mut self, groups: Vec<String>) -> Self {
        self.allowed_caller_groups = Some(groups);
        self
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }
}

type JoinReply = Result<mpsc::UnboundedReceiver<(NodeId, BusStreamReader)>, WireError>;
type StreamOpenReply = Result<BusStreamWriter, WireError>;

pub(crate) enum BusCmd {
    Join { config: NodeConfig, done: oneshot::Sender<JoinReply> },
    Leave { node_id: NodeId, done: oneshot::Sender<()> },
    Subscribe { node_id: NodeId, topic: Topic, handler: Procedure, done: oneshot::Sender<Result<(), WireError>> },
    Unsubscribe { node_id: NodeId, topic: Topic, done: oneshot::Sender<Result<(), WireError>> },
    P2pAsk { source: NodeId, destination: NodeId, path: String, args: Vec<RpcValue>, done: oneshot::Sender<Result<RpcValue, WireError>> },
    P2pTell { source: NodeId, destination: NodeId, path: String, args: Vec<RpcValue> },
    BroadcastAsk { source: NodeId, topic: Topic, args: Vec<RpcValue>, loopback: bool, done: oneshot::Sender<AskOutcome> },
    BroadcastTell { source: NodeId, topic: Topic, args: Vec<RpcValue>, loopback: bool },
    StreamOpen { source: NodeId, destination: NodeId, done: oneshot::Sender<StreamOpenReply> },
    StreamOpenTopic { source: NodeId, topic: Topic, done: oneshot::Sender<StreamOpenReply> },
    StreamSend { source: NodeId, target: StreamTarget, stream_id: Uuid, chunk: RpcValue },
    StreamFinish { source: NodeId, target: StreamTarget, stream_id: Uuid, session_id: Uuid },
    StreamAbortOut { source: NodeId, target: StreamTarget, stream_id: Uuid, session_id: Uuid, reason: WireError },
    RegisterBridge { bridge_id: Uuid, erpc: ErpcNode, remote_bus_id: BusId, is_parent: bool, done: oneshot::Sender<Result<(), WireError>> },
    BridgeClosed { bridge_id: Uuid },
    EnvelopeReceived { bridge_id: Uuid, envelope: Envelope },
    BridgeSubUpdate { bridge_id: Uuid, updates: Vec<SubUpdateEntry> },
    BridgeAnnouncement { bridge_id: Uuid, announcements: Vec<Announcement> },
    DeliverP2pResult { responder: NodeId, destination: NodeId, call_id: Uuid, result: Result<RpcValue, WireError> },
    SessionLocalResult { call_id: Uuid, responder: NodeId, result: Result<RpcValue, WireError> },
    Close { done: oneshot::Sender<()> },
    CloseFinished,
}

struct LocalNode {
    groups: Vec<String>,
    allowed_caller_groups: Option<Vec<String>>,
    router: Option<Arc<Router>>,
    leaving: bool,
    incoming_streams_tx: mpsc::UnboundedSender<(NodeId, BusStreamReader)>,
}

impl LocalNode {
    fn admits(&self, caller_groups: &[String]) -> bool {
        match &self.allowed_caller_groups {
            None => true,
            Some(allowed) if allowed.is_empty() => true,
            Some(allowed) => caller_groups.iter().any(|group| allowed.contains(group)),
        }
    }
}

/// One bus instance: join nodes, attach adjacent buses, close.
pub struct BusPeer {
    bus_id: BusId,
    request_timeout: Duration,
    cmd_tx: mpsc::UnboundedSender<BusCmd>,
    shared: Arc<CloseSignal>,
}

impl BusPeer {
    pub fn new(config: BusConfig) -> Self {
        let bus_id = config.bus_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let request_timeout = config.request_timeout;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CloseSignal::new());
        let actor = BusActor {
            bus_id: bus_id.clone(),
            request_timeout,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            nodes: HashMap::new(),
            p2p: P2pTable::default(),
            subs: SubscriptionTable::default(),
            parent: None,
            children: HashMap::new(),
            bridge_sources: HashMap::new(),
            pending_bridge_events: HashMap::new(),
            pending_p2p: HashMap::new(),
            sessions: SessionManager::default(),
            reported_subs: HashMap::new(),
            reported_nodes: HashMap::new(),
            closing: false,
            close_dones: Vec::new(),
            shared: Arc::clone(&shared),
        };
        tokio::spawn(actor.run());
        Self { bus_id, request_timeout, cmd_tx, shared }
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    /// Joins a local node, announcing it to adjacent buses.
    ///
    /// # Errors
    ///
    /// Rejects duplicate node ids and joins on a closing bus.
    pub async fn join(&self, config: NodeConfig) -> Result<NodeHandle, WireError> {
        let node_id = config.id.clone();
        let (done, rx) = oneshot::channel();
        self.cmd_tx.send(BusCmd::Join { config, done }).map_err(|_| WireError::NodeClosing)?;
        let incoming = rx.await.map_err(|_| WireError::NodeClosing)??;
        Ok(NodeHandle::new(node_id, self.cmd_tx.clone(), incoming))
    }

    /// Attaches the bus on the far side of `transport` as our parent.
    ///
    /// # Errors
    ///
    /// Fails on handshake timeout or when a parent is already attached.
    pub async fn attach_parent(&self, transport: Arc<dyn Transport>) -> Result<BusId, WireError> {
        self.attach(transport, true).await
    }

    /// Attaches the bus on the far side of `transport` as a child.
    ///
    /// # Errors
    ///
    /// Fails on handshake timeout or a duplicate child bus id.
    pub async fn attach_child(&self, transport: Arc<dyn Transport>) -> Result<BusId, WireError> {
        self.attach(transport, false).await
    }

    async fn attach(&self, transport: Arc<dyn Transport>, is_parent: bool) -> Result<BusId, WireError> {
        let bridge_id = Uuid::new_v4();
        let (erpc, remote_bus_id) = connect_bridge(
            transport,
            self.bus_id.clone(),
            bridge_id,
            self.cmd_tx.clone(),
            self.request_timeout,
        )
        .await?;
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCmd::RegisterBridge {
                bridge_id,
                erpc,
                remote_bus_id: remote_bus_id.clone(),
                is_parent,
                done,
            })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)??;
        Ok(remote_bus_id)
    }

    /// Graceful shutdown: rejects outstanding calls, ends sessions,
    /// withdraws announcements, then closes every bridge.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(BusCmd::Close { done }).is_ok() {
            let _ = rx.await;
        }
        self.shared.wait().await;
    }

    pub async fn closed(&self) -> WireError {
        self.shared.wait().await;
        self.shared.reason().unwrap_or(WireError::NodeClosing)
    }
}

struct BusActor {
    bus_id: BusId,
    request_timeout: Duration,
    cmd_tx: mpsc::UnboundedSender<BusCmd>,
    cmd_rx: mpsc::UnboundedReceiver<BusCmd>,
    nodes: HashMap<NodeId, LocalNode>,
    p2p: P2pTable,
    subs: SubscriptionTable,
    parent: Option<BridgeHandle>,
    children: HashMap<BusId, BridgeHandle>,
    bridge_sources: HashMap<Uuid, MessageSource>,
    /// Events from bridges whose registration has not landed yet.
    pending_bridge_events: HashMap<Uuid, Vec<BusCmd>>,
    pending_p2p: HashMap<Uuid, oneshot::Sender<Result<RpcValue, WireError>>>,
    sessions: SessionManager,
    reported_subs: HashMap<Uuid, HashSet<Topic>>,
    reported_nodes: HashMap<Uuid, HashSet<NodeId>>,
    closing: bool,
    close_dones: Vec<oneshot::Sender<()>>,
    shared: Arc<CloseSignal>,
}

impl BusActor {
    async fn run(mut self) {
        info!(bus_id = %self.bus_id, "bus peer started");
        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_cmd(cmd).is_break() {
                break;
            }
        }
        self.shared.finish(WireError::NodeClosing);
        info!(bus_id = %self.bus_id, "bus peer stopped");
    }

    fn handle_cmd(&mut self, cmd: BusCmd) -> ControlFlow<()> {
        if self.closing {
            return self.handle_while_closing(cmd);
        }
        match cmd {
            BusCmd::Join { config, done } => {
                let _ = done.send(self.join(config));
            }
            BusCmd::Leave { node_id, done } => {
                self.leave(&node_id);
                let _ = done.send(());
            }
            BusCmd::Subscribe { node_id, topic, handler, done } => {
                let result = if self.nodes.contains_key(&node_id) {
                    self.subs.subscribe_local(&topic, node_id, handler);
                    self.refresh_edges();
                    Ok(())
                } else {
                    Err(WireError::node_not_found(node_id))
                };
                let _ = done.send(result);
            }
            BusCmd::Unsubscribe { node_id, topic, done } => {
                let result = if self.nodes.contains_key(&node_id) {
                    self.subs.unsubscribe_local(&topic, &node_id);
                    self.refresh_edges();
                    Ok(())
                } else {
                    Err(WireError::node_not_found(node_id))
                };
                let _ = done.send(result);
            }
            BusCmd::P2pAsk { source, destination, path, args, done } => {
                let Some(node) = self.nodes.get(&source) else {
                    let _ = done.send(Err(WireError::node_not_found(source)));
                    return ControlFlow::Continue(());
                };
                let call_id = Uuid::new_v4();
                let groups = node.groups.clone();
                self.pending_p2p.insert(call_id, done);
                let envelope = P2pEnvelope {
                    source_id: source,
                    source_groups: groups,
                    destination_id: destination,
                    payload: P2pPayload::Ask { call_id, path, args },
                };
                self.route_p2p(envelope, &MessageSource::Local);
            }
            BusCmd::P2pTell { source, destination, path, args } => {
                let Some(node) = self.nodes.get(&source) else { return ControlFlow::Continue(()) };
                let envelope = P2pEnvelope {
                    source_id: source,
                    source_groups: node.groups.clone(),
                    destination_id: destination,
                    payload: P2pPayload::Tell { path, args },
                };
                self.route_p2p(envelope, &MessageSource::Local);
            }
            BusCmd::BroadcastAsk { source, topic, args, loopback, done } => {
                let Some(node) = self.nodes.get(&source) else {
                    let _ = done.send(Err(WireError::node_not_found(source)));
                    return ControlFlow::Continue(());
                };
                let envelope = BroadcastEnvelope {
                    source_id: source,
                    source_groups: node.groups.clone(),
                    topic,
                    loopback,
                    payload: BroadcastPayload::Ask { call_id: Uuid::new_v4(), args },
                };
                self.handle_broadcast(envelope, &MessageSource::Local, Some(done));
            }
            BusCmd::BroadcastTell { source, topic, args, loopback } => {
                let Some(node) = self.nodes.get(&source) else { return ControlFlow::Continue(()) };
                let envelope = BroadcastEnvelope {
                    source_id: source,
                    source_groups: node.groups.clone(),
                    topic,
                    loopback,
                    payload: BroadcastPayload::Tell { args },
                };
                self.handle_broadcast(envelope, &MessageSource::Local, None);
            }
            BusCmd::StreamOpen { source, destination, done } => {
                let _ = done.send(self.open_stream(source, destination));
            }
            BusCmd::StreamOpenTopic { source, topic, done } => {
                let _ = done.send(self.open_topic_stream(source, topic));
            }
            BusCmd::StreamSend { source, target, stream_id, chunk } => {
                let envelope = stream_envelope(source, &target, StreamPayload::Data { stream_id, chunk });
                self.handle_stream(envelope, &MessageSource::Local);
            }
            BusCmd::StreamFinish { source, target, stream_id, session_id } => {
                let envelope = stream_envelope(source, &target, StreamPayload::End { stream_id });
                self.handle_stream(envelope, &MessageSource::Local);
                self.sessions.terminate(session_id, None);
            }
            BusCmd::StreamAbortOut { source, target, stream_id, session_id, reason } => {
                let envelope = stream_envelope(source, &target, StreamPayload::Abort { stream_id, reason });
                self.handle_stream(envelope, &MessageSource::Local);
                self.sessions.terminate(session_id, None);
            }
            BusCmd::RegisterBridge { bridge_id, erpc, remote_bus_id, is_parent, done } => {
                let _ = done.send(self.register_bridge(bridge_id, erpc, remote_bus_id, is_parent));
            }
            BusCmd::BridgeClosed { bridge_id } => self.bridge_closed(bridge_id),
            BusCmd::EnvelopeReceived { bridge_id, envelope } => {
                match self.bridge_sources.get(&bridge_id).cloned() {
                    Some(source) => self.handle_envelope(envelope, &source),
                    None => self.buffer_bridge_event(bridge_id, BusCmd::EnvelopeReceived { bridge_id, envelope }),
                }
            }
            BusCmd::BridgeSubUpdate { bridge_id, updates } => {
                match self.bridge_sources.get(&bridge_id).cloned() {
                    Some(source) => {
                        for update in updates {
                            self.subs.set_remote(&update.topic, source.clone(), update.is_subscribed);
                        }
                        self.refresh_edges();
                    }
                    None => self.buffer_bridge_event(bridge_id, BusCmd::BridgeSubUpdate { bridge_id, updates }),
                }
            }
            BusCmd::BridgeAnnouncement { bridge_id, announcements } => {
                match self.bridge_sources.get(&bridge_id).cloned() {
                    Some(source) => {
                        for announcement in announcements {
                            if announcement.is_available {
                                self.p2p.insert(
                                    announcement.node_id,
                                    RouteEntry { source: source.clone(), groups: announcement.groups },
                                );
                            } else {
                                self.p2p.remove_via(&announcement.node_id, &source);
                            }
                        }
                        self.refresh_edges();
                    }
                    None => {
                        self.buffer_bridge_event(bridge_id, BusCmd::BridgeAnnouncement { bridge_id, announcements });
                    }
                }
            }
            BusCmd::DeliverP2pResult { responder, destination, call_id, result } => {
                self.reply_p2p(responder, destination, call_id, result);
            }
            BusCmd::SessionLocalResult { call_id, responder, result } => {
                self.sessions.update(
                    call_id,
                    SessionEvent::LocalResult { responder, result },
                    &MessageSource::Local,
                );
            }
            BusCmd::Close { done } => self.begin_close(done),
            BusCmd::CloseFinished => {
                for done in self.close_dones.drain(..) {
                    let _ = done.send(());
                }
                self.shared.finish(WireError::NodeClosing);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_while_closing(&mut self, cmd: BusCmd) -> ControlFlow<()> {
        match cmd {
            BusCmd::Join { done, .. } => {
                let _ = done.send(Err(WireError::NodeClosing));
            }
            BusCmd::Subscribe { done, .. } | BusCmd::Unsubscribe { done, .. } => {
                let _ = done.send(Err(WireError::NodeClosing));
            }
            BusCmd::P2pAsk { done, .. } => {
                let _ = done.send(Err(WireError::NodeClosing));
            }
            BusCmd::BroadcastAsk { done, .. } => {
                let _ = done.send(Err(WireError::NodeClosing));
            }
            BusCmd::StreamOpen { done, .. } | BusCmd::StreamOpenTopic { done, .. } => {
                let _ = done.send(Err(WireError::NodeClosing));
            }
            BusCmd::RegisterBridge { done, .. } => {
                let _ = done.send(Err(WireError::NodeClosing));
            }
            BusCmd::Leave { done, .. } => {
                let _ = done.send(());
            }
            BusCmd::Close { done } => self.close_dones.push(done),
            BusCmd::CloseFinished => {
                for done in self.close_dones.drain(..) {
                    let _ = done.send(());
                }
                self.shared.finish(WireError::NodeClosing);
                return ControlFlow::Break(());
            }
            _ => debug!("command dropped during shutdown"),
        }
        ControlFlow::Continue(())
    }

    // ---- membership ----

    fn join(&mut self, config: NodeConfig) -> JoinReply {
        if self.nodes.contains_key(&config.id) {
            return Err(WireError::procedure("duplicate-node", format!("{} already joined", config.id)));
        }
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let groups = config.groups.clone();
        self.nodes.insert(
            config.id.clone(),
            LocalNode {
                groups: config.groups,
                allowed_caller_groups: config.allowed_caller_groups,
                router: config.router.map(Arc::new),
                leaving: false,
                incoming_streams_tx: incoming_tx,
            },
        );
        self.p2p.insert(config.id.clone(), RouteEntry { source: MessageSource::Local, groups });
        self.refresh_edges();
        info!(bus_id = %self.bus_id, node_id = %config.id, "node joined");
        Ok(incoming_rx)
    }

    fn leave(&mut self, node_id: &str) {
        if self.nodes.remove(node_id).is_none() {
            return;
        }
        self.p2p.remove_via(node_id, &MessageSource::Local);
        self.subs.remove_local_node(node_id);
        self.refresh_edges();
        info!(bus_id = %self.bus_id, %node_id, "node left");
    }

    // ---- bridges ----

    fn register_bridge(
        &mut self,
        bridge_id: Uuid,
        erpc: ErpcNode,
        remote_bus_id: BusId,
        is_parent: bool,
    ) -> Result<(), WireError> {
        let source = if is_parent { MessageSource::Parent } else { MessageSource::Child(remote_bus_id.clone()) };
        if is_parent && self.parent.is_some() {
            tokio::spawn(async move { erpc.close().await });
            return Err(WireError::procedure("parent-attached", "a parent bus is already attached"));
        }
        if !is_parent && self.children.contains_key(&remote_bus_id) {
            tokio::spawn(async move { erpc.close().await });
            return Err(WireError::procedure(
                "duplicate-child",
                format!("child bus {remote_bus_id} is already attached"),
            ));
        }
        let handle = BridgeHandle::start(
            bridge_id,
            source.clone(),
            remote_bus_id.clone(),
            erpc,
            self.cmd_tx.clone(),
            self.request_timeout,
        );

        // Surface connection loss as a command so the drop fans out to the
        // tables and sessions exactly once.
        let watcher_erpc = handle.erpc.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let _ = watcher_erpc.closed().await;
            let _ = cmd_tx.send(BusCmd::BridgeClosed { bridge_id });
        });

        if is_parent {
            self.parent = Some(handle);
        } else {
            self.children.insert(remote_bus_id.clone(), handle);
        }
        self.bridge_sources.insert(bridge_id, source);
        info!(bus_id = %self.bus_id, %remote_bus_id, parent = is_parent, "bridge attached");

        // State sync: the first refresh against empty reported sets sends
        // the full dumps.
        self.refresh_edges();
        for event in self.pending_bridge_events.remove(&bridge_id).unwrap_or_default() {
            let _ = self.handle_cmd(event);
        }
        Ok(())
    }

    fn buffer_bridge_event(&mut self, bridge_id: Uuid, cmd: BusCmd) {
        debug!(%bridge_id, "buffering event for an unregistered bridge");
        self.pending_bridge_events.entry(bridge_id).or_default().push(cmd);
    }

    fn bridge_closed(&mut self, bridge_id: Uuid) {
        let Some(source) = self.bridge_sources.remove(&bridge_id) else { return };
        match &source {
            MessageSource::Parent => {
                if self.parent.as_ref().is_some_and(|b| b.bridge_id == bridge_id) {
                    self.parent = None;
                }
            }
            MessageSource::Child(bus_id) => {
                self.children.remove(bus_id);
            }
            MessageSource::Local => {}
        }
        self.reported_subs.remove(&bridge_id);
        self.reported_nodes.remove(&bridge_id);

        let lost = self.p2p.remove_source(&source);
        self.subs.remove_source(&source);
        self.sessions.connection_dropped(&source);
        warn!(bus_id = %self.bus_id, %source, lost = lost.len(), "bridge disconnected");
        self.refresh_edges();
    }

    fn edge_handle(&self, source: &MessageSource) -> Option<BridgeHandle> {
        match source {
            MessageSource::Parent => self.parent.clone(),
            MessageSource::Child(bus_id) => self.children.get(bus_id).cloned(),
            MessageSource::Local => None,
        }
    }

    fn send_on(&self, source: &MessageSource, envelope: Envelope) {
        match self.edge_handle(source) {
            Some(bridge) => bridge.send_envelope(envelope),
            None => debug!(%source, "dropping envelope for a missing edge"),
        }
    }

    // ---- state sync ----

    /// Diffs what each edge should know against what it was told, and sends
    /// exactly one increment per change.
    fn refresh_edges(&mut self) {
        let bridges: Vec<BridgeHandle> =
            self.parent.iter().cloned().chain(self.children.values().cloned()).collect();
        let mut outgoing: Vec<(BridgeHandle, Exchange)> = Vec::new();

        for bridge in &bridges {
            let current = self.subs.topics_for(&bridge.source);
            let reported = self.reported_subs.entry(bridge.bridge_id).or_default();
            let mut updates: Vec<SubUpdateEntry> = current
                .difference(reported)
                .map(|topic| SubUpdateEntry { topic: topic.clone(), is_subscribed: true })
                .collect();
            updates.extend(
                reported
                    .difference(&current)
                    .map(|topic| SubUpdateEntry { topic: topic.clone(), is_subscribed: false }),
            );
            if !updates.is_empty() {
                *reported = current;
                outgoing.push((
                    bridge.clone(),
                    Exchange::SubUpdate { correlation_id: Uuid::new_v4(), updates },
                ));
            }

            let routable: HashMap<NodeId, Vec<String>> =
                self.p2p.routable_for(&bridge.source).into_iter().collect();
            let reported = self.reported_nodes.entry(bridge.bridge_id).or_default();
            let mut announcements: Vec<Announcement> = routable
                .iter()
                .filter(|(node_id, _)| !reported.contains(*node_id))
                .map(|(node_id, groups)| Announcement {
                    node_id: node_id.clone(),
                    is_available: true,
                    groups: groups.clone(),
                })
                .collect();
            announcements.extend(
                reported
                    .iter()
                    .filter(|node_id| !routable.contains_key(*node_id))
                    .map(|node_id| Announcement { node_id: node_id.clone(), is_available: false, groups: Vec::new() }),
            );
            if !announcements.is_empty() {
                *reported = routable.into_keys().collect();
                outgoing.push((
                    bridge.clone(),
                    Exchange::NodeAnnouncement { correlation_id: Uuid::new_v4(), announcements },
                ));
            }
        }

        // Queued behind any envelopes already heading to the same bridge,
        // so state updates and traffic stay mutually ordered.
        for (bridge, exchange) in outgoing {
            bridge.queue_exchange(exchange);
        }
    }

    // ---- envelope handling ----

    fn handle_envelope(&mut self, envelope: Envelope, arrival: &MessageSource) {
        match envelope {
            Envelope::P2p(envelope) => self.route_p2p(envelope, arrival),
            Envelope::Broadcast(envelope) => self.handle_broadcast(envelope, arrival, None),
            Envelope::Stream(envelope) => self.handle_stream(envelope, arrival),
        }
    }

    fn route_p2p(&mut self, envelope: P2pEnvelope, arrival: &MessageSource) {
        if self.nodes.contains_key(&envelope.destination_id) {
            self.dispatch_local_p2p(envelope);
            return;
        }
        let route = self.p2p.lookup(&envelope.destination_id).map(|entry| entry.source.clone());
        match route {
            Some(source) if &source != arrival => self.send_on(&source, Envelope::P2p(envelope)),
            _ => {
                debug!(destination = %envelope.destination_id, "no route for p2p envelope");
                let P2pEnvelope { source_id, destination_id, payload, .. } = envelope;
                if let P2pPayload::Ask { call_id, .. } = payload {
                    let error = WireError::node_not_found(destination_id.clone());
                    self.reply_p2p(destination_id, source_id, call_id, Err(error));
                }
            }
        }
    }

    fn dispatch_local_p2p(&mut self, envelope: P2pEnvelope) {
        let P2pEnvelope { source_id, source_groups, destination_id, payload } = envelope;
        match payload {
            P2pPayload::AckResult { call_id, result } => match self.pending_p2p.remove(&call_id) {
                Some(resolver) => {
                    let _ = resolver.send(result);
                }
                None => debug!(%call_id, "ack-result for an unknown p2p call"),
            },
            P2pPayload::Ask { call_id, path, args } => {
                match self.local_procedure(&destination_id, &path, &source_groups) {
                    Ok(procedure) => {
                        let ctx = CallContext { caller: Some(source_id.clone()), meta: None };
                        let cmd_tx = self.cmd_tx.clone();
                        tokio::spawn(async move {
                            let result = procedure.call(args, ctx).await;
                            let _ = cmd_tx.send(BusCmd::DeliverP2pResult {
                                responder: destination_id,
                                destination: source_id,
                                call_id,
                                result,
                            });
                        });
                    }
                    Err(error) => self.reply_p2p(destination_id, source_id, call_id, Err(error)),
                }
            }
            P2pPayload::Tell { path, args } => {
                match self.local_procedure(&destination_id, &path, &source_groups) {
                    Ok(procedure) => {
                        let ctx = CallContext { caller: Some(source_id), meta: None };
                        tokio::spawn(async move {
                            if let Err(error) = procedure.call(args, ctx).await {
                                debug!(%error, "p2p tell handler failed");
                            }
                        });
                    }
                    Err(error) => debug!(%error, destination = %destination_id, "p2p tell dropped"),
                }
            }
        }
    }

    fn reply_p2p(
        &mut self,
        responder: NodeId,
        destination: NodeId,
        call_id: Uuid,
        result: Result<RpcValue, WireError>,
    ) {
        let groups = self.nodes.get(&responder).map(|node| node.groups.clone()).unwrap_or_default();
        let envelope = P2pEnvelope {
            source_id: responder,
            source_groups: groups,
            destination_id: destination,
            payload: P2pPayload::AckResult { call_id, result },
        };
        self.route_p2p(envelope, &MessageSource::Local);
    }

    fn local_procedure(
        &self,
        node_id: &str,
        path: &str,
        caller_groups: &[String],
    ) -> Result<Procedure, WireError> {
        let node = self.nodes.get(node_id).ok_or_else(|| WireError::node_not_found(node_id))?;
        if node.leaving {
            return Err(WireError::ProcedureNotReady { node_id: node_id.to_string() });
        }
        let Some(router) = node.router.as_ref() else {
            return Err(WireError::ProcedureNotReady { node_id: node_id.to_string() });
        };
        if !node.admits(caller_groups) {
            return Err(WireError::GroupPermissionDenied { node_id: node_id.to_string() });
        }
        router
            .lookup(path)
            .cloned()
            .ok_or_else(|| WireError::procedure("procedure-not-found", format!("no procedure at {path}")))
    }

    // ---- broadcast ----

    fn handle_broadcast(
        &mut self,
        envelope: BroadcastEnvelope,
        arrival: &MessageSource,
        root_done: Option<oneshot::Sender<AskOutcome>>,
    ) {
        match &envelope.payload {
            BroadcastPayload::Ask { .. } | BroadcastPayload::Tell { .. } => {
                self.fan_out_broadcast(envelope, arrival, root_done);
            }
            BroadcastPayload::AckResult { call_id, result_seq, result } => {
                self.sessions.update(
                    *call_id,
                    SessionEvent::BroadcastResult {
                        responder: envelope.source_id.clone(),
                        seq: *result_seq,
                        result: result.clone(),
                    },
                    arrival,
                );
            }
            BroadcastPayload::AckFin { call_id, total_results } => {
                self.sessions.update(*call_id, SessionEvent::BroadcastFin { total: *total_results }, arrival);
            }
        }
    }

    fn fan_out_broadcast(
        &mut self,
        envelope: BroadcastEnvelope,
        arrival: &MessageSource,
        root_done: Option<oneshot::Sender<AskOutcome>>,
    ) {
        let edges = self.subs.interested_edges(&envelope.topic, arrival);
        let subscribers = self.deliverable_subscribers(&envelope, arrival);

        // Local deliveries first, in registration order, then the remote
        // fan-out.
        let (ask_call_id, args) = match &envelope.payload {
            BroadcastPayload::Ask { call_id, args } => (Some(*call_id), args.clone()),
            BroadcastPayload::Tell { args } => (None, args.clone()),
            _ => return,
        };
        for (node_id, handler) in &subscribers {
            let ctx = CallContext { caller: Some(envelope.source_id.clone()), meta: None };
            let args = args.clone();
            let handler = handler.clone();
            let node_id = node_id.clone();
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let result = handler.call(args, ctx).await;
                match ask_call_id {
                    Some(call_id) => {
                        let _ = cmd_tx.send(BusCmd::SessionLocalResult { call_id, responder: node_id, result });
                    }
                    None => {
                        if let Err(error) = result {
                            debug!(%error, "broadcast handler failed");
                        }
                    }
                }
            });
        }
        for edge in &edges {
            self.send_on(edge, Envelope::Broadcast(envelope.clone()));
        }

        let Some(call_id) = ask_call_id else { return };
        if arrival == &MessageSource::Local {
            let Some(done) = root_done else { return };
            if edges.is_empty() && subscribers.is_empty() {
                let _ = done.send(Ok(Vec::new()));
                return;
            }
            self.sessions
                .register(call_id, Box::new(RootAskSession::new(edges, subscribers.len(), done)));
        } else {
            let Some(upstream) = self.edge_handle(arrival) else { return };
            if edges.is_empty() && subscribers.is_empty() {
                upstream.send_envelope(Envelope::Broadcast(BroadcastEnvelope {
                    source_id: self.bus_id.clone(),
                    source_groups: Vec::new(),
                    topic: envelope.topic,
                    loopback: false,
                    payload: BroadcastPayload::AckFin { call_id, total_results: 0 },
                }));
                return;
            }
            self.sessions.register(
                call_id,
                Box::new(RelayAskSession::new(
                    call_id,
                    envelope.topic,
                    self.bus_id.clone(),
                    upstream,
                    edges,
                    subscribers.len(),
                )),
            );
        }
    }

    fn deliverable_subscribers(
        &self,
        envelope: &BroadcastEnvelope,
        arrival: &MessageSource,
    ) -> Vec<(NodeId, Procedure)> {
        if arrival == &MessageSource::Local && !envelope.loopback {
            return Vec::new();
        }
        self.subs
            .local_subscribers(&envelope.topic)
            .into_iter()
            .filter(|(node_id, _)| {
                self.nodes
                    .get(node_id)
                    .is_some_and(|node| !node.leaving && node.admits(&envelope.source_groups))
            })
            .collect()
    }

    // ---- streams ----

    fn open_stream(&mut self, source: NodeId, destination: NodeId) -> StreamOpenReply {
        if !self.nodes.contains_key(&source) {
            return Err(WireError::node_not_found(source));
        }
        let edge = if self.nodes.contains_key(&destination) {
            MessageSource::Local
        } else {
            match self.p2p.lookup(&destination) {
                Some(entry) => entry.source.clone(),
                None => return Err(WireError::node_not_found(destination)),
            }
        };
        self.start_stream(source, StreamTarget::Node(destination), edge)
    }

    fn open_topic_stream(&mut self, source: NodeId, topic: Topic) -> StreamOpenReply {
        if !self.nodes.contains_key(&source) {
            return Err(WireError::node_not_found(source));
        }
        // A topic stream fans out over many edges; no single route can fail
        // it, so the writer only dies with the bus.
        self.start_stream(source, StreamTarget::Topic(topic), MessageSource::Local)
    }

    fn start_stream(&mut self, source: NodeId, target: StreamTarget, edge: MessageSource) -> StreamOpenReply {
        let stream_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let failed = Arc::new(OnceLock::new());
        self.sessions
            .register(session_id, Box::new(OutboundStreamSession::new(edge, Arc::clone(&failed))));

        let envelope = stream_envelope(source.clone(), &target, StreamPayload::Open { stream_id });
        self.handle_stream(envelope, &MessageSource::Local);

        Ok(BusStreamWriter { stream_id, session_id, source, target, cmd_tx: self.cmd_tx.clone(), failed })
    }

    fn handle_stream(&mut self, envelope: StreamEnvelope, arrival: &MessageSource) {
        if let Some(destination) = envelope.destination_id.clone() {
            if self.nodes.contains_key(&destination) {
                self.deliver_stream(envelope, arrival, &[destination]);
                return;
            }
            let route = self.p2p.lookup(&destination).map(|entry| entry.source.clone());
            match route {
                Some(source) if &source != arrival => self.send_on(&source, Envelope::Stream(envelope)),
                _ => debug!(%destination, "no route for stream envelope"),
            }
        } else if let Some(topic) = envelope.topic.clone() {
            let subscribers: Vec<NodeId> = self
                .subs
                .local_subscribers(&topic)
                .into_iter()
                .map(|(node_id, _)| node_id)
                .collect();
            if !subscribers.is_empty() {
                self.deliver_stream(envelope.clone(), arrival, &subscribers);
            }
            for edge in self.subs.interested_edges(&topic, arrival) {
                self.send_on(&edge, Envelope::Stream(envelope.clone()));
            }
        } else {
            debug!("stream envelope without destination or topic");
        }
    }

    fn deliver_stream(&mut self, envelope: StreamEnvelope, arrival: &MessageSource, targets: &[NodeId]) {
        match envelope.payload {
            StreamPayload::Open { stream_id } => {
                let mut outputs = Vec::new();
                for node_id in targets {
                    if let Some(node) = self.nodes.get(node_id) {
                        let (tx, rx) = mpsc::unbounded_channel::<StreamItem>();
                        if node
                            .incoming_streams_tx
                            .send((envelope.source_id.clone(), BusStreamReader { rx }))
                            .is_ok()
                        {
                            outputs.push(tx);
                        }
                    }
                }
                if !outputs.is_empty() {
                    self.sessions
                        .register(stream_id, Box::new(InboundStreamSession::new(arrival.clone(), outputs)));
                }
            }
            StreamPayload::Data { stream_id, chunk } => {
                self.sessions.update(stream_id, SessionEvent::StreamData { chunk }, arrival);
            }
            StreamPayload::End { stream_id } => {
                self.sessions.update(stream_id, SessionEvent::StreamEnd, arrival);
            }
            StreamPayload::Abort { stream_id, reason } => {
                self.sessions.update(stream_id, SessionEvent::StreamAbort { reason }, arrival);
            }
        }
    }

    // ---- shutdown ----

    fn begin_close(&mut self, done: oneshot::Sender<()>) {
        self.closing = true;
        self.close_dones.push(done);
        info!(bus_id = %self.bus_id, "bus closing");

        for node in self.nodes.values_mut() {
            node.leaving = true;
        }
        let reason = WireError::NodeClosing;
        for (_, resolver) in self.pending_p2p.drain() {
            let _ = resolver.send(Err(reason.clone()));
        }
        self.sessions.close_all(&reason);

        // Withdraw everything each neighbour was told about, wait for the
        // answers, then close the bridges.
        let bridges: Vec<(BridgeHandle, Vec<NodeId>, Vec<Topic>)> = self
            .parent
            .iter()
            .cloned()
            .chain(self.children.values().cloned())
            .map(|bridge| {
                let nodes = self
                    .reported_nodes
                    .get(&bridge.bridge_id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                let topics = self
                    .reported_subs
                    .get(&bridge.bridge_id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                (bridge, nodes, topics)
            })
            .collect();
        let cmd_tx = self.cmd_tx.clone();
        let deadline = self.request_timeout;
        tokio::spawn(async move {
            for (bridge, nodes, topics) in bridges {
                if !nodes.is_empty() {
                    let announcements = nodes
                        .into_iter()
                        .map(|node_id| Announcement { node_id, is_available: false, groups: Vec::new() })
                        .collect();
                    let _ = bridge
                        .exchange(
                            Exchange::NodeAnnouncement { correlation_id: Uuid::new_v4(), announcements },
                            deadline,
                        )
                        .await;
                }
                if !topics.is_empty() {
                    let updates = topics
                        .into_iter()
                        .map(|topic| SubUpdateEntry { topic, is_subscribed: false })
                        .collect();
                    let _ = bridge
                        .exchange(Exchange::SubUpdate { correlation_id: Uuid::new_v4(), updates }, deadline)
                        .await;
                }
                bridge.close().await;
            }
            let _ = cmd_tx.send(BusCmd::CloseFinished);
        });
    }
}
