// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structural call proxies.
//!
//! A [`Client`] builds a dot-path segment by segment, so
//! `node.client().path("math").path("add").ask(args)` dispatches to exactly
//! the procedure registered under `"math.add"`.

use meshkit_core::WireError;

use crate::node::CallHandle;
use crate::proto::CallTarget;
use crate::value::RpcValue;

#[derive(Clone)]
pub struct Client {
    calls: CallHandle,
    path: String,
}

impl Client {
    pub(crate) fn new(calls: CallHandle) -> Self {
        Self { calls, path: String::new() }
    }

    /// Extends the path by one segment.
    #[must_use]
    pub fn path(&self, segment: &str) -> Self {
        let path = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{segment}", self.path)
        };
        Self { calls: self.calls.clone(), path }
    }

    /// Invokes the procedure at the accumulated path.
    ///
    /// # Errors
    ///
    /// Surfaces the remote procedure's error or the connection failure.
    pub async fn ask(&self, args: Vec<RpcValue>) -> Result<RpcValue, WireError> {
        self.calls.ask(CallTarget::Path(self.path.clone()), args).await
    }

    /// Fire-and-forget invocation of the accumulated path.
    pub async fn tell(&self, args: Vec<RpcValue>) {
        self.calls.tell(CallTarget::Path(self.path.clone()), args).await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("path", &self.path).finish_non_exhaustive()
    }
}
