// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The per-connection RPC node.
//!
//! One node owns one transport: it dispatches incoming calls into its
//! router, tracks outgoing asks in a pending table, and hosts the pin,
//! stream and tunnel managers.
//!
//! Subsystems never reference each other directly. Construction assembles an
//! immutable capability record ([`Caps`]) in one fixed order and every
//! subsystem holds that record; teardown runs in the reverse order.

use std::collections::HashMap;
use std::sync::Arc;

use meshkit_core::{Channel, CloseSignal, JsonValue, Transport, WireError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pin::PinManager;
use crate::proto::{CallOutcome, CallTarget, ControlMessage, StreamHello};
use crate::router::{CallContext, Procedure, Router};
use crate::serializer::{decode_args, decode_value, encode_args, encode_value};
use crate::stream::StreamManager;
use crate::tunnel::TunnelManager;
use crate::value::RpcValue;

/// Queue of control messages awaiting the control-channel pump.
pub(crate) type Outbound = mpsc::UnboundedSender<ControlMessage>;

#[derive(Debug, Clone)]
pub struct ErpcConfig {
    /// Maximum nesting depth the serializer will walk.
    pub depth_limit: usize,
    /// Ring capacity of stream buffers created for incoming streams.
    pub stream_capacity: usize,
}

impl Default for ErpcConfig {
    fn default() -> Self {
        Self { depth_limit: 64, stream_capacity: 16 }
    }
}

/// The immutable capability record shared by every subsystem of one node.
pub(crate) struct Caps {
    pub config: ErpcConfig,
    pub outbound: Outbound,
    pub calls: CallHandle,
    pub pins: PinManager,
    pub streams: StreamManager,
    pub tunnels: TunnelManager,
}

pub(crate) enum NodeCmd {
    Ask {
        target: CallTarget,
        args: Vec<RpcValue>,
        meta: Option<JsonValue>,
        done: oneshot::Sender<Result<RpcValue, WireError>>,
    },
    Tell {
        target: CallTarget,
        args: Vec<RpcValue>,
        meta: Option<JsonValue>,
    },
    FreePin {
        pin_id: Uuid,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// How proxies (and the public handle) issue calls into the node actor.
#[derive(Clone)]
pub(crate) struct CallHandle {
    cmd_tx: mpsc::UnboundedSender<NodeCmd>,
}

impl CallHandle {
    pub async fn ask(&self, target: CallTarget, args: Vec<RpcValue>) -> Result<RpcValue, WireError> {
        self.ask_with_meta(target, args, None).await
    }

    pub async fn ask_with_meta(
        &self,
        target: CallTarget,
        args: Vec<RpcValue>,
        meta: Option<JsonValue>,
    ) -> Result<RpcValue, WireError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCmd::Ask { target, args, meta, done })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)?
    }

    /// Fire-and-forget; failures are logged, never surfaced.
    pub async fn tell(&self, target: CallTarget, args: Vec<RpcValue>) {
        if self.cmd_tx.send(NodeCmd::Tell { target, args, meta: None }).is_err() {
            debug!("tell dropped, node is closing");
        }
    }

    pub fn free_pin(&self, pin_id: Uuid) {
        let _ = self.cmd_tx.send(NodeCmd::FreePin { pin_id });
    }
}

/// The public handle of one RPC node. Cheap to clone.
#[derive(Clone)]
pub struct ErpcNode {
    calls: CallHandle,
    shared: Arc<CloseSignal>,
}

impl ErpcNode {
    /// Wires a node over `transport` and starts its actor.
    pub fn new(transport: Arc<dyn Transport>, router: Router, config: ErpcConfig) -> Self {
        let control = transport.control_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let calls = CallHandle { cmd_tx };

        // Capability wiring order: outgoing queue, call handle, then the
        // managers. Teardown runs the same list backwards.
        let caps = Arc::new(Caps {
            config: config.clone(),
            outbound: outbound_tx.clone(),
            calls: calls.clone(),
            pins: PinManager::new(),
            streams: StreamManager::new(outbound_tx.clone(), config.stream_capacity),
            tunnels: TunnelManager::new(Arc::clone(&transport), outbound_tx),
        });

        let shared = Arc::new(CloseSignal::new());
        tokio::spawn(run_outbound_pump(Arc::clone(&control), outbound_rx));
        tokio::spawn(run_stream_acceptor(Arc::clone(&transport), Arc::clone(&caps)));
        tokio::spawn(
            NodeActor {
                transport,
                control,
                caps,
                router: Arc::new(router),
                cmd_rx,
                pending: HashMap::new(),
                shared: Arc::clone(&shared),
            }
            .run(),
        );

        Self { calls, shared }
    }

    /// Calls `path` on the peer's router and awaits the result.
    ///
    /// # Errors
    ///
    /// Surfaces the remote procedure's error or the connection failure.
    pub async fn ask(&self, path: impl Into<String>, args: Vec<RpcValue>) -> Result<RpcValue, WireError> {
        self.calls.ask(CallTarget::Path(path.into()), args).await
    }

    /// As [`ask`](Self::ask), with opaque metadata the remote procedure sees
    /// in its [`CallContext`].
    pub async fn ask_with_meta(
        &self,
        path: impl Into<String>,
        args: Vec<RpcValue>,
        meta: Option<JsonValue>,
    ) -> Result<RpcValue, WireError> {
        self.calls.ask_with_meta(CallTarget::Path(path.into()), args, meta).await
    }

    /// Fire-and-forget call; never errors at the call site.
    pub async fn tell(&self, path: impl Into<String>, args: Vec<RpcValue>) {
        self.calls.tell(CallTarget::Path(path.into()), args).await;
    }

    /// A structural proxy rooted at the peer's router.
    pub fn client(&self) -> crate::client::Client {
        crate::client::Client::new(self.calls.clone())
    }

    /// Graceful shutdown: rejects every outstanding ask with `NodeClosing`
    /// and closes the transport underneath.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.calls.cmd_tx.send(NodeCmd::Close { done }).is_ok() {
            let _ = rx.await;
        }
        self.shared.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves when the node is fully closed, with the reason.
    pub async fn closed(&self) -> WireError {
        self.shared.wait().await;
        self.shared.reason().unwrap_or(WireError::NodeClosing)
    }
}

async fn run_outbound_pump(control: Arc<Channel>, mut outbound_rx: mpsc::UnboundedReceiver<ControlMessage>) {
    while let Some(message) = outbound_rx.recv().await {
        let value = match message.to_value() {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "dropping unencodable control message");
                continue;
            }
        };
        if control.send(value).await.is_err() {
            break;
        }
    }
}

async fn run_stream_acceptor(transport: Arc<dyn Transport>, caps: Arc<Caps>) {
    while let Some(channel) = transport.accept_stream_channel().await {
        let caps = Arc::clone(&caps);
        tokio::spawn(async move {
            // The first payload on every host stream channel names the
            // tunnel end it targets.
            let Some(first) = channel.recv().await else { return };
            match StreamHello::from_value(first) {
                Ok(hello) => caps.tunnels.handle_incoming_stream(hello, channel).await,
                Err(error) => {
                    warn!(%error, "stream channel without a valid handshake");
                    channel.close().await;
                }
            }
        });
    }
}

struct NodeActor {
    transport: Arc<dyn Transport>,
    control: Arc<Channel>,
    caps: Arc<Caps>,
    router: Arc<Router>,
    cmd_rx: mpsc::UnboundedReceiver<NodeCmd>,
    pending: HashMap<Uuid, oneshot::Sender<Result<RpcValue, WireError>>>,
    shared: Arc<CloseSignal>,
}

impl NodeActor {
    async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    if let Some(reason) = self.handle_cmd(cmd).await {
                        break reason;
                    }
                }
                message = self.control.recv() => match message {
                    Some(value) => self.handle_control(value).await,
                    None => break self
                        .control
                        .close_reason()
                        .unwrap_or_else(|| WireError::link_closed("transport closed")),
                },
            }
        };
        self.finish(reason);
    }

    async fn handle_cmd(&mut self, cmd: NodeCmd) -> Option<WireError> {
        match cmd {
            NodeCmd::Ask { target, args, meta, done } => {
                let call_id = Uuid::new_v4();
                match encode_args(args, &self.caps) {
                    Ok(args) => {
                        self.pending.insert(call_id, done);
                        let _ = self
                            .caps
                            .outbound
                            .send(ControlMessage::Ask { call_id, target, args, meta });
                    }
                    Err(error) => {
                        let _ = done.send(Err(error));
                    }
                }
                None
            }
            NodeCmd::Tell { target, args, meta } => {
                match encode_args(args, &self.caps) {
                    Ok(args) => {
                        let _ = self.caps.outbound.send(ControlMessage::Tell { target, args, meta });
                    }
                    Err(error) => debug!(%error, "tell arguments failed to serialize"),
                }
                None
            }
            NodeCmd::FreePin { pin_id } => {
                let _ = self.caps.outbound.send(ControlMessage::PinFree { pin_id, count: 1 });
                None
            }
            NodeCmd::Close { done } => {
                let reason = WireError::NodeClosing;
                for (_, resolver) in self.pending.drain() {
                    let _ = resolver.send(Err(reason.clone()));
                }
                self.caps.tunnels.shutdown(&reason);
                self.caps.streams.close_all(&reason);
                self.caps.pins.clear();
                self.transport.close().await;
                let _ = done.send(());
                Some(reason)
            }
        }
    }

    async fn handle_control(&mut self, value: JsonValue) {
        let message = match ControlMessage::from_value(value) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping malformed control message");
                return;
            }
        };
        match message {
            ControlMessage::Ask { call_id, target, args, meta } => {
                self.dispatch_ask(call_id, target, args, meta);
            }
            ControlMessage::Tell { target, args, meta } => {
                // Tells run inline: per-connection events stay serialized in
                // arrival order, end to end.
                self.dispatch_tell(target, args, meta).await;
            }
            ControlMessage::AskResult { call_id, result } => {
                let Some(resolver) = self.pending.remove(&call_id) else {
                    debug!(%call_id, "ask-result for unknown call, dropping");
                    return;
                };
                let outcome = match result {
                    CallOutcome::Ok(value) => decode_value(value, &self.caps, 1),
                    CallOutcome::Err(error) => Err(error),
                };
                let _ = resolver.send(outcome);
            }
            ControlMessage::PinFree { pin_id, count } => self.caps.pins.free(pin_id, count),
            ControlMessage::StreamData { stream_id, chunk } => {
                // Suspends while the destination buffer is full; that pause
                // is the stream's backpressure onto this connection.
                self.caps.streams.deliver(stream_id, chunk).await;
            }
            ControlMessage::StreamEnd { stream_id } => self.caps.streams.end(stream_id),
            ControlMessage::StreamAbort { stream_id, reason } => {
                self.caps.streams.abort(stream_id, reason);
            }
            ControlMessage::Tunnel { tunnel_id, payload } => self.caps.tunnels.route(tunnel_id, payload),
        }
    }

    /// Dispatches one incoming ask on its own task; the handler may run as
    /// long as it likes without stalling the connection.
    fn dispatch_ask(&self, call_id: Uuid, target: CallTarget, args: JsonValue, meta: Option<JsonValue>) {
        let caps = Arc::clone(&self.caps);
        let procedure = self.resolve(&target);
        let ctx = CallContext { caller: None, meta };
        tokio::spawn(async move {
            let outcome = match (procedure, decode_args(args, &caps)) {
                (Some(procedure), Ok(args)) => match procedure.call(args, ctx).await {
                    Ok(value) => match encode_value(value, &caps, 1) {
                        Ok(encoded) => CallOutcome::Ok(encoded),
                        Err(error) => CallOutcome::Err(error),
                    },
                    Err(error) => CallOutcome::Err(error),
                },
                (None, _) => CallOutcome::Err(WireError::procedure(
                    "procedure-not-found",
                    format!("no procedure at {target:?}"),
                )),
                (_, Err(error)) => CallOutcome::Err(error),
            };
            let _ = caps.outbound.send(ControlMessage::AskResult { call_id, result: outcome });
        });
    }

    /// Runs one incoming tell to completion before the next control message
    /// is processed.
    async fn dispatch_tell(&self, target: CallTarget, args: JsonValue, meta: Option<JsonValue>) {
        let Some(procedure) = self.resolve(&target) else {
            debug!(?target, "tell for an unknown procedure, dropping");
            return;
        };
        let args = match decode_args(args, &self.caps) {
            Ok(args) => args,
            Err(error) => {
                debug!(%error, "tell arguments failed to decode");
                return;
            }
        };
        let ctx = CallContext { caller: None, meta };
        if let Err(error) = procedure.call(args, ctx).await {
            debug!(%error, "tell handler failed");
        }
    }

    fn resolve(&self, target: &CallTarget) -> Option<Procedure> {
        match target {
            CallTarget::Path(path) => self.router.lookup(path).cloned(),
            CallTarget::Pin(pin_id) => self.caps.pins.get(*pin_id),
        }
    }

    fn finish(mut self, reason: WireError) {
        for (_, resolver) in self.pending.drain() {
            let _ = resolver.send(Err(reason.clone()));
        }
        self.caps.tunnels.shutdown(&reason);
        self.caps.streams.close_all(&reason);
        self.caps.pins.clear();
        self.shared.finish(reason);
    }
}
