// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MeshKit Mux - a reliable, flow-controlled multiplexer over a single link.
//!
//! One message-oriented [`Link`](meshkit_core::Link) carries many virtual
//! channels: the always-established control channel (id 0) plus any number of
//! stream channels opened with a 1-RTT handshake. Every channel is reliable
//! (per-frame acknowledgements), flow-controlled (bounded send window), and
//! strictly ordered. A heartbeat detects dead peers and fails every channel.
//!
//! ## Modules
//!
//! - [`packet`]: the wire packet union
//! - [`config`]: tuning knobs and connection sides
//! - [`transport`]: the public [`MuxTransport`] handle
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshkit_core::memory;
//! use meshkit_mux::{MuxConfig, MuxTransport, Side};
//!
//! let (a, b) = memory::link_pair(64);
//! let initiator = MuxTransport::connect(a, Side::Initiator, MuxConfig::default());
//! let acceptor = MuxTransport::connect(b, Side::Acceptor, MuxConfig::default());
//! ```

mod actor;
mod channel;
pub mod config;
pub mod packet;
pub mod transport;

pub use actor::CONTROL_CHANNEL_ID;
pub use config::{MuxConfig, Side};
pub use packet::Packet;
pub use transport::MuxTransport;
