// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-channel bookkeeping owned by the mux actor, plus the windowed sink
//! behind every channel handle.
//!
//! Send side: a FIFO semaphore with one permit per window slot. `send`
//! acquires a permit (suspending in submission order when the window is
//! full), the actor releases it when the matching individual ack arrives,
//! and closing the semaphore fails every suspended sender.
//!
//! Receive side: a reorder map keyed by sequence number. Payloads are
//! delivered to the handle strictly in order; each delivered sequence is
//! acknowledged right after delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use meshkit_core::channel::ChannelFeeder;
use meshkit_core::{async_trait, Channel, JsonValue, PayloadSink, WireError};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};

use crate::actor::MuxCmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelRole {
    Control,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelStatus {
    /// Stream channel waiting for the peer's `open-stream-ack`.
    PreHandshake,
    Established,
}

pub(crate) struct ChannelState {
    pub role: ChannelRole,
    pub status: ChannelStatus,
    pub feeder: ChannelFeeder,
    /// The handle to resolve once the open handshake completes; taken when
    /// handed out.
    pub handle: Option<Arc<Channel>>,
    pub pending_open: Option<oneshot::Sender<Result<Arc<Channel>, WireError>>>,
    pub window: Arc<Semaphore>,
    pub next_send_seq: u64,
    /// Sent-but-unacked sequence numbers; the retained window.
    pub outstanding: BTreeSet<u64>,
    pub next_recv_seq: u64,
    pub reorder: BTreeMap<u64, JsonValue>,
}

impl ChannelState {
    pub fn new(role: ChannelRole, status: ChannelStatus, feeder: ChannelFeeder, window: Arc<Semaphore>) -> Self {
        Self {
            role,
            status,
            feeder,
            handle: None,
            pending_open: None,
            window,
            next_send_seq: 0,
            outstanding: BTreeSet::new(),
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
        }
    }

    /// Fails every dependent of this channel: suspended senders, the pending
    /// open, and the handle's readers.
    pub fn destroy(&mut self, reason: WireError) {
        self.window.close();
        if let Some(done) = self.pending_open.take() {
            let _ = done.send(Err(reason.clone()));
        }
        self.handle = None;
        self.feeder.close(reason);
    }
}

/// The [`PayloadSink`] behind every mux channel handle.
pub(crate) struct WindowSink {
    channel_id: u32,
    window: Arc<Semaphore>,
    /// Serializes permit acquisition with enqueueing, so payloads reach the
    /// actor in the exact order `send` was called.
    order: Mutex<()>,
    cmd_tx: mpsc::UnboundedSender<MuxCmd>,
}

impl WindowSink {
    pub fn new(channel_id: u32, window: Arc<Semaphore>, cmd_tx: mpsc::UnboundedSender<MuxCmd>) -> Self {
        Self { channel_id, window, order: Mutex::new(()), cmd_tx }
    }
}

#[async_trait]
impl PayloadSink for WindowSink {
    async fn send(&self, payload: JsonValue) -> Result<(), WireError> {
        let _order = self.order.lock().await;
        let permit = Arc::clone(&self.window)
            .acquire_owned()
            .await
            .map_err(|_| WireError::channel_closed("channel closed"))?;
        // The actor releases the slot when the ack for this frame arrives.
        permit.forget();
        self.cmd_tx
            .send(MuxCmd::SendData { channel_id: self.channel_id, payload })
            .map_err(|_| WireError::link_closed("multiplexer is gone"))
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(MuxCmd::CloseChannel { channel_id: self.channel_id });
    }
}
