// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MeshKit eBUS - a hierarchical routing bus over the RPC runtime.
//!
//! A [`BusPeer`] federates local nodes and adjacent buses (one optional
//! parent, any number of children) into a tree. It routes point-to-point
//! calls by node id, fans Pub/Sub broadcasts out along aggregated topic
//! interest, collects multi-party broadcast-ask results through recursive
//! sessions, and carries node-to-node streams.
//!
//! ## Modules
//!
//! - [`peer`]: the bus actor, its configuration and the public [`BusPeer`]
//! - [`node`]: handles for joined nodes
//! - [`stream`]: bus-level stream ends
//! - [`envelope`]: the bus wire envelopes
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshkit_ebus::{BusConfig, BusPeer, NodeConfig, Procedure, Router, RpcValue};
//!
//! let bus = BusPeer::new(BusConfig::default());
//! let echo = Router::new().route("echo", Procedure::new(|mut args, _ctx| async move {
//!     Ok(args.pop().unwrap_or_else(RpcValue::null))
//! }));
//! let node = bus.join(NodeConfig::new("plugin://echo").with_router(echo)).await?;
//! let reply = node.ask("plugin://other", "some.path", vec![RpcValue::from(1_i64)]).await?;
//! ```

mod ask;
mod bridge;
pub mod envelope;
pub mod node;
pub mod peer;
mod routing;
mod session;
pub mod stream;

/// Opaque node identity (`plugin://…` URIs live here unparsed).
pub type NodeId = String;
/// Bus identity within the tree.
pub type BusId = String;
/// Pub/Sub topic name.
pub type Topic = String;

// Convenience re-exports for the common surface
pub use envelope::MessageSource;
pub use node::NodeHandle;
pub use peer::{BusConfig, BusPeer, NodeConfig};
pub use stream::{BusStreamReader, BusStreamWriter};

// The value and procedure types the bus API speaks
pub use meshkit_erpc::{CallContext, Procedure, ProcedureResult, Router, RpcValue};
