// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bus-level streams: node-to-node (or topic-wide) chunk pipes routed hop by
//! hop like any other envelope.
//!
//! Both stream ends are tracked as sessions so a dropped connection fails
//! them through the regular disconnect fan-out. Delivery into a reader is an
//! unbounded queue: bus streams are not flow-controlled end to end, only by
//! each hop's connection.

use std::sync::{Arc, OnceLock};

use meshkit_core::WireError;
use meshkit_erpc::RpcValue;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::MessageSource;
use crate::peer::BusCmd;
use crate::session::{Session, SessionEvent, SessionFlow};
use crate::{NodeId, Topic};

/// Where a stream's payloads are headed: one node or a whole topic.
#[derive(Debug, Clone)]
pub(crate) enum StreamTarget {
    Node(NodeId),
    Topic(Topic),
}

pub(crate) enum StreamItem {
    Chunk(RpcValue),
    End,
    Abort(WireError),
}

/// The receiving end of a bus stream.
pub struct BusStreamReader {
    pub(crate) rx: mpsc::UnboundedReceiver<StreamItem>,
}

impl BusStreamReader {
    /// Next chunk; `Ok(None)` at a graceful end.
    ///
    /// # Errors
    ///
    /// Fails with the abort reason, including connection loss anywhere on
    /// the path.
    pub async fn next(&mut self) -> Result<Option<RpcValue>, WireError> {
        match self.rx.recv().await {
            Some(StreamItem::Chunk(chunk)) => Ok(Some(chunk)),
            Some(StreamItem::End) | None => Ok(None),
            Some(StreamItem::Abort(reason)) => Err(reason),
        }
    }
}

impl std::fmt::Debug for BusStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BusStreamReader")
    }
}

/// The sending end of a bus stream, held by the originating node.
pub struct BusStreamWriter {
    pub(crate) stream_id: Uuid,
    pub(crate) session_id: Uuid,
    pub(crate) source: NodeId,
    pub(crate) target: StreamTarget,
    pub(crate) cmd_tx: mpsc::UnboundedSender<BusCmd>,
    pub(crate) failed: Arc<OnceLock<WireError>>,
}

impl BusStreamWriter {
    /// Sends one chunk toward the target.
    ///
    /// # Errors
    ///
    /// Fails once the route is broken or the bus is closing.
    pub fn send(&self, chunk: RpcValue) -> Result<(), WireError> {
        if let Some(error) = self.failed.get() {
            return Err(error.clone());
        }
        self.cmd_tx
            .send(BusCmd::StreamSend {
                source: self.source.clone(),
                target: self.target.clone(),
                stream_id: self.stream_id,
                chunk,
            })
            .map_err(|_| WireError::NodeClosing)
    }

    /// Gracefully ends the stream.
    pub fn finish(self) {
        let _ = self.cmd_tx.send(BusCmd::StreamFinish {
            source: self.source.clone(),
            target: self.target.clone(),
            stream_id: self.stream_id,
            session_id: self.session_id,
        });
    }

    /// Ends the stream with a failure the receiver observes.
    pub fn abort(self, reason: WireError) {
        let _ = self.cmd_tx.send(BusCmd::StreamAbortOut {
            source: self.source.clone(),
            target: self.target.clone(),
            stream_id: self.stream_id,
            session_id: self.session_id,
            reason,
        });
    }
}

impl std::fmt::Debug for BusStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusStreamWriter")
            .field("stream_id", &self.stream_id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Destination-side session: fans incoming payloads into reader queues.
pub(crate) struct InboundStreamSession {
    from: MessageSource,
    outputs: Vec<mpsc::UnboundedSender<StreamItem>>,
}

impl InboundStreamSession {
    pub fn new(from: MessageSource, outputs: Vec<mpsc::UnboundedSender<StreamItem>>) -> Self {
        Self { from, outputs }
    }

    fn fan_out(&self, make: impl Fn() -> StreamItem) {
        for output in &self.outputs {
            let _ = output.send(make());
        }
    }
}

impl Session for InboundStreamSession {
    fn update(&mut self, event: SessionEvent, _source: &MessageSource) -> SessionFlow {
        match event {
            SessionEvent::StreamData { chunk } => {
                self.fan_out(|| StreamItem::Chunk(chunk.clone()));
                SessionFlow::Continue
            }
            SessionEvent::StreamEnd => {
                self.fan_out(|| StreamItem::End);
                SessionFlow::Finished
            }
            SessionEvent::StreamAbort { reason } => {
                self.fan_out(|| StreamItem::Abort(reason.clone()));
                SessionFlow::Finished
            }
            _ => {
                debug!("unexpected event for a stream session");
                SessionFlow::Continue
            }
        }
    }

    fn handle_downstream_disconnect(&mut self, source: &MessageSource) -> Result<SessionFlow, WireError> {
        if source == &self.from {
            self.fan_out(|| StreamItem::Abort(WireError::link_closed("stream source disconnected")));
            return Ok(SessionFlow::Finished);
        }
        Ok(SessionFlow::Continue)
    }

    fn terminate(&mut self, reason: Option<WireError>) {
        if let Some(reason) = reason {
            self.fan_out(|| StreamItem::Abort(reason.clone()));
        }
    }
}

/// Origin-side session: only exists so a broken route fails the writer.
pub(crate) struct OutboundStreamSession {
    edge: MessageSource,
    failed: Arc<OnceLock<WireError>>,
}

impl OutboundStreamSession {
    pub fn new(edge: MessageSource, failed: Arc<OnceLock<WireError>>) -> Self {
        Self { edge, failed }
    }
}

impl Session for OutboundStreamSession {
    fn update(&mut self, _event: SessionEvent, _source: &MessageSource) -> SessionFlow {
        debug!("unexpected event for an outbound stream session");
        SessionFlow::Continue
    }

    fn handle_downstream_disconnect(&mut self, source: &MessageSource) -> Result<SessionFlow, WireError> {
        if source == &self.edge {
            let _ = self.failed.set(WireError::link_closed("stream route disconnected"));
            return Ok(SessionFlow::Finished);
        }
        Ok(SessionFlow::Continue)
    }

    fn terminate(&mut self, reason: Option<WireError>) {
        if let Some(reason) = reason {
            let _ = self.failed.set(reason);
        }
    }
}
