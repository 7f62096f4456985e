// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The public handle of a joined node.
//!
//! A handle never owns the bus: it carries the node's id plus the bus's
//! command sender, so dropping a handle leaks nothing and the bus outlives
//! its nodes by construction.

use meshkit_core::WireError;
use meshkit_erpc::{Procedure, RpcValue};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::peer::BusCmd;
use crate::stream::{BusStreamReader, BusStreamWriter};
use crate::NodeId;

pub struct NodeHandle {
    node_id: NodeId,
    cmd_tx: mpsc::UnboundedSender<BusCmd>,
    incoming_streams: Mutex<mpsc::UnboundedReceiver<(NodeId, BusStreamReader)>>,
}

impl NodeHandle {
    pub(crate) fn new(
        node_id: NodeId,
        cmd_tx: mpsc::UnboundedSender<BusCmd>,
        incoming_streams: mpsc::UnboundedReceiver<(NodeId, BusStreamReader)>,
    ) -> Self {
        Self { node_id, cmd_tx, incoming_streams: Mutex::new(incoming_streams) }
    }

    pub fn id(&self) -> &str {
        &self.node_id
    }

    /// Point-to-point call: invokes `path` on `destination`'s router.
    ///
    /// # Errors
    ///
    /// `NodeNotFound` for unroutable destinations, `ProcedureNotReady` /
    /// `GroupPermissionDenied` from the destination bus, the procedure's own
    /// error, or `NodeClosing` during shutdown.
    pub async fn ask(
        &self,
        destination: impl Into<String>,
        path: impl Into<String>,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue, WireError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCmd::P2pAsk {
                source: self.node_id.clone(),
                destination: destination.into(),
                path: path.into(),
                args,
                done,
            })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)?
    }

    /// Point-to-point fire-and-forget; never errors at the call site.
    pub fn tell(&self, destination: impl Into<String>, path: impl Into<String>, args: Vec<RpcValue>) {
        let _ = self.cmd_tx.send(BusCmd::P2pTell {
            source: self.node_id.clone(),
            destination: destination.into(),
            path: path.into(),
            args,
        });
    }

    /// Subscribes this node to `topic`. The handler produces one result per
    /// broadcast ask and is also invoked (result discarded) for tells.
    ///
    /// # Errors
    ///
    /// Fails when the bus is closing.
    pub async fn subscribe(&self, topic: impl Into<String>, handler: Procedure) -> Result<(), WireError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCmd::Subscribe {
                node_id: self.node_id.clone(),
                topic: topic.into(),
                handler,
                done,
            })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)?
    }

    /// Drops this node's subscription to `topic`.
    ///
    /// # Errors
    ///
    /// Fails when the bus is closing.
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), WireError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCmd::Unsubscribe { node_id: self.node_id.clone(), topic: topic.into(), done })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)?
    }

    /// Broadcast ask: fans out to every subscriber of `topic` in the bus
    /// tree and resolves with the collected results once every branch
    /// finished or disconnected (disconnected branches truncate silently).
    ///
    /// # Errors
    ///
    /// Fails only on shutdown; individual subscriber failures arrive as
    /// `Err` entries in the collection.
    pub async fn broadcast_ask(
        &self,
        topic: impl Into<String>,
        args: Vec<RpcValue>,
        loopback: bool,
    ) -> Result<Vec<Result<RpcValue, WireError>>, WireError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCmd::BroadcastAsk {
                source: self.node_id.clone(),
                topic: topic.into(),
                args,
                loopback,
                done,
            })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)?
    }

    /// Broadcast fire-and-forget.
    pub fn broadcast_tell(&self, topic: impl Into<String>, args: Vec<RpcValue>, loopback: bool) {
        let _ = self.cmd_tx.send(BusCmd::BroadcastTell {
            source: self.node_id.clone(),
            topic: topic.into(),
            args,
            loopback,
        });
    }

    /// Opens a stream toward `destination`.
    ///
    /// # Errors
    ///
    /// `NodeNotFound` for unroutable destinations, `NodeClosing` on
    /// shutdown.
    pub async fn open_stream(&self, destination: impl Into<String>) -> Result<BusStreamWriter, WireError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCmd::StreamOpen {
                source: self.node_id.clone(),
                destination: destination.into(),
                done,
            })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)?
    }

    /// Opens a stream toward every current subscriber of `topic`, across
    /// the whole bus tree.
    ///
    /// # Errors
    ///
    /// Fails only during shutdown; a topic with no subscribers is a valid
    /// (silent) target.
    pub async fn open_topic_stream(&self, topic: impl Into<String>) -> Result<BusStreamWriter, WireError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCmd::StreamOpenTopic { source: self.node_id.clone(), topic: topic.into(), done })
            .map_err(|_| WireError::NodeClosing)?;
        rx.await.map_err(|_| WireError::NodeClosing)?
    }

    /// Next stream another node opened toward this one; `None` once the bus
    /// shut down.
    pub async fn accept_stream(&self) -> Option<(NodeId, BusStreamReader)> {
        let mut incoming = self.incoming_streams.lock().await;
        incoming.recv().await
    }

    /// Leaves the bus, withdrawing this node's announcements.
    pub async fn leave(self) {
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(BusCmd::Leave { node_id: self.node_id, done }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("node_id", &self.node_id).finish_non_exhaustive()
    }
}
