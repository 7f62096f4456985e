// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The Link contract: the raw duplex carrier underneath a multiplexer.
//!
//! A link transfers opaque JSON values between exactly two peers. It must
//! preserve message boundaries and ordering, and deliver each accepted
//! message at most once. Reliability beyond that (windows, acknowledgements,
//! heartbeats) is the multiplexer's job, not the link's.
//!
//! The contract is split into owned sender/receiver halves so the owner can
//! hand the write half to a dedicated writer task while a single reader
//! drains the receive half.

use async_trait::async_trait;

use crate::error::WireError;
use crate::JsonValue;

/// The sending half of a link.
#[async_trait]
pub trait LinkSender: Send + 'static {
    /// Accepts `message` for delivery. Resolution means the link has taken
    /// ownership of the value, not that the remote peer received it.
    async fn send(&mut self, message: JsonValue) -> Result<(), WireError>;

    /// Graceful close: previously accepted messages are still flushed, then
    /// the peer observes end-of-link.
    async fn close(&mut self);

    /// Immediate teardown. The error is surfaced to the peer when the
    /// implementation is able to do so.
    async fn abort(&mut self, error: WireError);
}

/// The receiving half of a link.
#[async_trait]
pub trait LinkReceiver: Send + 'static {
    /// Next inbound message. `Ok(None)` is a clean end-of-link; `Err` is a
    /// link fault carried from the peer or the carrier itself.
    async fn recv(&mut self) -> Result<Option<JsonValue>, WireError>;
}

/// A duplex, ordered, message-preserving carrier of JSON values.
pub trait Link: Send + 'static {
    /// Splits the link into its two independently owned halves.
    fn into_split(self) -> (Box<dyn LinkSender>, Box<dyn LinkReceiver>);
}
