// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MeshKit eRPC - an RPC runtime with structural resource tunneling.
//!
//! One [`ErpcNode`] rides one [`Transport`](meshkit_core::Transport). Calls
//! address a [`Router`] of procedures; arguments and results are structural
//! [`RpcValue`] trees whose resource leaves (procedures, stream ends, whole
//! transports) are serialized as placeholders and reconstructed as live
//! proxies on the other side.
//!
//! ## Modules
//!
//! - [`value`]: the structural value tree
//! - [`router`]: procedures, call contexts and path routing
//! - [`client`]: structural call proxies over dot-paths
//! - [`proto`]: control-channel wire messages
//! - [`pin`]: remote-callable procedure references
//! - [`stream`]: bounded stream buffers and their manager
//! - [`node`]: the per-connection node actor
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshkit_erpc::{ErpcConfig, ErpcNode, Procedure, Router, RpcValue};
//!
//! let router = Router::new().route("echo", Procedure::new(|mut args, _ctx| async move {
//!     Ok(args.pop().unwrap_or_else(RpcValue::null))
//! }));
//! let node = ErpcNode::new(transport, router, ErpcConfig::default());
//! let reply = node.ask("echo", vec![RpcValue::from("hi")]).await?;
//! ```

pub mod client;
mod node;
pub mod pin;
pub mod proto;
pub mod router;
mod serializer;
pub mod stream;
mod tunnel;
pub mod value;

// Convenience re-exports for the common surface
pub use client::Client;
pub use node::{ErpcConfig, ErpcNode};
pub use pin::PinProxy;
pub use proto::{CallOutcome, CallTarget, ControlMessage};
pub use router::{CallContext, Procedure, ProcedureResult, Router};
pub use stream::{pipe, StreamReader, StreamWriter};
pub use value::RpcValue;
