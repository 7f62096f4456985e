// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The shared, wire-portable error taxonomy.
//!
//! Every layer of the substrate (link, multiplexer, RPC runtime, bus) reports
//! failures through [`WireError`]. The enum serializes as a tagged JSON object
//! so an error raised on one peer can be carried across the wire and rethrown
//! on another without losing its classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified errors carried across process boundaries.
///
/// Locally an error may carry a `cause` chain; on the wire the chain is
/// preserved as nested objects. Variants map one-to-one onto the protocol's
/// error classes, so matching on a variant is meaningful on both sides of a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum WireError {
    /// The underlying link terminated.
    #[error("link closed: {message}")]
    LinkClosed { message: String },

    /// A multiplexed channel terminated.
    #[error("channel closed: {message}")]
    ChannelClosed { message: String },

    /// A stream buffer was finished or destroyed.
    #[error("buffer closed: {message}")]
    BufferClosed { message: String },

    /// The peer stopped answering heartbeats; fatal to the link.
    #[error("heartbeat timeout: {message}")]
    HeartbeatTimeout { message: String },

    /// No route exists to the addressed node.
    #[error("node not found: {node_id}")]
    #[serde(rename_all = "camelCase")]
    NodeNotFound { node_id: String },

    /// The addressed node exists but cannot take calls yet (or anymore).
    #[error("procedure not ready on node: {node_id}")]
    #[serde(rename_all = "camelCase")]
    ProcedureNotReady { node_id: String },

    /// The caller's groups do not satisfy the target node's allow-list.
    #[error("group permission denied for node: {node_id}")]
    #[serde(rename_all = "camelCase")]
    GroupPermissionDenied { node_id: String },

    /// A value could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// A placeholder tag arrived that no type handler recognizes.
    #[error("unknown placeholder tag: {tag}")]
    UnknownPlaceholder { tag: String },

    /// An invoked procedure failed; `tag` is the application classification.
    #[error("procedure error [{tag}]: {message}")]
    Procedure {
        tag: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<Box<WireError>>,
    },

    /// Graceful shutdown is in progress; new and outstanding calls reject.
    #[error("node closing")]
    NodeClosing,
}

impl WireError {
    pub fn link_closed(message: impl Into<String>) -> Self {
        Self::LinkClosed { message: message.into() }
    }

    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed { message: message.into() }
    }

    pub fn buffer_closed(message: impl Into<String>) -> Self {
        Self::BufferClosed { message: message.into() }
    }

    pub fn heartbeat_timeout(message: impl Into<String>) -> Self {
        Self::HeartbeatTimeout { message: message.into() }
    }

    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::NodeNotFound { node_id: node_id.into() }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    pub fn procedure(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Procedure { tag: tag.into(), message: message.into(), cause: None }
    }

    /// Whether the error marks infrastructure teardown rather than an
    /// application-level failure.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LinkClosed { .. }
                | Self::ChannelClosed { .. }
                | Self::HeartbeatTimeout { .. }
                | Self::NodeClosing
        )
    }
}
