// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MeshKit Core - Shared contracts for the MeshKit communication substrate.
//!
//! This crate defines what the layers above agree on:
//!
//! ## Core Modules
//!
//! - [`link`]: the raw duplex carrier contract underneath a multiplexer
//! - [`channel`]: virtual-channel handles and the feeder that drives them
//! - [`transport`]: the multiplexed transport contract consumed by the RPC layer
//! - [`error`]: the wire-portable error taxonomy shared by every layer
//! - [`memory`]: in-memory link pair for tests and local wiring

// Re-export async_trait for use in link and transport implementations
pub use async_trait::async_trait;

// Module declarations
pub mod channel;
pub mod error;
pub mod link;
pub mod memory;
pub mod transport;

/// The JSON-shaped value every wire structure is made of.
pub type JsonValue = serde_json::Value;

// Convenience re-exports for commonly used types
pub use channel::{channel, Channel, ChannelFeeder, PayloadSink};
pub use error::WireError;
pub use link::{Link, LinkReceiver, LinkSender};
pub use transport::{CloseSignal, Transport};
