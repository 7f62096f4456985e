// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The Transport contract: what a multiplexer produces and the RPC layer
//! consumes.
//!
//! A transport carries one always-established control channel plus any number
//! of dynamically opened stream channels. Tunneled proxy transports implement
//! the same trait, which is what makes a nested transport indistinguishable
//! from a directly connected one to the layers above.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::error::WireError;

/// One-shot close latch shared between an owner and its handles.
///
/// The first `finish` wins; later calls keep the original reason.
#[derive(Default)]
pub struct CloseSignal {
    token: CancellationToken,
    reason: OnceLock<WireError>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches `reason` and wakes every waiter. Returns whether this call
    /// was the one that closed the signal.
    pub fn finish(&self, reason: WireError) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<WireError> {
        self.reason.get().cloned()
    }

    /// Resolves once the signal is closed.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The control channel. Always established; lives as long as the
    /// transport itself.
    fn control_channel(&self) -> Arc<Channel>;

    /// Opens a new outgoing stream channel, resolving once the peer has
    /// acknowledged it.
    async fn open_stream_channel(&self) -> Result<Arc<Channel>, WireError>;

    /// Next stream channel opened by the peer. `None` once the transport is
    /// closed.
    async fn accept_stream_channel(&self) -> Option<Arc<Channel>>;

    /// Graceful close: flushes pending close notifications, then tears down
    /// every channel.
    async fn close(&self);

    /// Immediate teardown with `error` as every channel's close reason.
    async fn abort(&self, error: WireError);

    /// Resolves when the transport is fully closed, with the reason.
    async fn closed(&self) -> WireError;
}
