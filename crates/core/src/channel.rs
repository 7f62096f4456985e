// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel handles: the user-facing end of a multiplexed virtual channel.
//!
//! A [`Channel`] pairs an outbound [`PayloadSink`] (how payloads leave this
//! process) with an inbound queue fed by whoever produced the channel. The
//! producer keeps the matching [`ChannelFeeder`] and uses it to deliver
//! in-order payloads and to close the channel with a reason.
//!
//! Decoupling the handle from its producer through the sink trait is what
//! lets both a multiplexer actor and a tunneled proxy transport hand out the
//! same channel type.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::WireError;
use crate::JsonValue;

/// Where a channel's outbound payloads go.
///
/// `send` resolves once the payload has been accepted for delivery; it
/// suspends while the channel's flow-control window is exhausted.
#[async_trait]
pub trait PayloadSink: Send + Sync + 'static {
    async fn send(&self, payload: JsonValue) -> Result<(), WireError>;

    /// Requests a graceful close of the channel.
    async fn close(&self);
}

struct ChannelShared {
    closed: CancellationToken,
    reason: OnceLock<WireError>,
}

/// A bidirectional, ordered, reliable virtual channel.
///
/// The control channel and stream channels share this type; the distinction
/// is purely which role the owning transport assigned to the id.
pub struct Channel {
    id: u32,
    sink: Box<dyn PayloadSink>,
    inbound: Mutex<mpsc::UnboundedReceiver<JsonValue>>,
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sends a payload, suspending under backpressure.
    ///
    /// # Errors
    ///
    /// Fails with the channel's close reason once it is closed.
    pub async fn send(&self, payload: JsonValue) -> Result<(), WireError> {
        if self.shared.closed.is_cancelled() {
            return Err(self.close_reason_or_default());
        }
        self.sink.send(payload).await
    }

    /// Next inbound payload, in the exact order the peer submitted them.
    ///
    /// Returns `None` once the channel is closed and every queued payload has
    /// been drained.
    pub async fn recv(&self) -> Option<JsonValue> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await
    }

    /// Requests a graceful close.
    pub async fn close(&self) {
        self.sink.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// The close reason, if the channel already closed.
    pub fn close_reason(&self) -> Option<WireError> {
        self.shared.reason.get().cloned()
    }

    /// Resolves when the channel closes, with the reason.
    pub async fn closed(&self) -> WireError {
        self.shared.closed.cancelled().await;
        self.close_reason_or_default()
    }

    fn close_reason_or_default(&self) -> WireError {
        self.shared
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| WireError::channel_closed("channel closed"))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The producer's end of a channel: delivers inbound payloads and closes.
pub struct ChannelFeeder {
    tx: Option<mpsc::UnboundedSender<JsonValue>>,
    shared: Arc<ChannelShared>,
}

impl ChannelFeeder {
    /// Delivers one payload to the handle's inbound queue.
    ///
    /// Returns `false` when the handle was dropped and nobody will read it.
    pub fn deliver(&self, payload: JsonValue) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(payload).is_ok())
    }

    /// Closes the channel with `reason`. Payloads already queued remain
    /// readable; `recv` returns `None` after they drain.
    pub fn close(&mut self, reason: WireError) {
        let _ = self.shared.reason.set(reason);
        self.shared.closed.cancel();
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl Drop for ChannelFeeder {
    fn drop(&mut self) {
        if !self.shared.closed.is_cancelled() {
            self.close(WireError::channel_closed("channel owner dropped"));
        }
    }
}

/// Builds a channel handle plus the feeder that drives it.
pub fn channel(id: u32, sink: Box<dyn PayloadSink>) -> (Arc<Channel>, ChannelFeeder) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(ChannelShared { closed: CancellationToken::new(), reason: OnceLock::new() });
    let handle = Arc::new(Channel { id, sink, inbound: Mutex::new(rx), shared: Arc::clone(&shared) });
    let feeder = ChannelFeeder { tx: Some(tx), shared };
    (handle, feeder)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait]
    impl PayloadSink for NullSink {
        async fn send(&self, _payload: JsonValue) -> Result<(), WireError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn queued_payloads_drain_after_close() {
        let (ch, mut feeder) = channel(7, Box::new(NullSink));
        assert!(feeder.deliver(serde_json::json!(1)));
        assert!(feeder.deliver(serde_json::json!(2)));
        feeder.close(WireError::channel_closed("done"));

        assert_eq!(ch.recv().await, Some(serde_json::json!(1)));
        assert_eq!(ch.recv().await, Some(serde_json::json!(2)));
        assert_eq!(ch.recv().await, None);
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn send_fails_with_close_reason() {
        let (ch, mut feeder) = channel(3, Box::new(NullSink));
        feeder.close(WireError::heartbeat_timeout("peer gone"));

        let err = ch.send(serde_json::json!("x")).await.expect_err("closed");
        assert_eq!(err, WireError::heartbeat_timeout("peer gone"));
        assert_eq!(ch.closed().await, WireError::heartbeat_timeout("peer gone"));
    }
}
