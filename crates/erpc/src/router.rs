// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Procedure routing.
//!
//! A [`Router`] is a flat registry from dot-separated paths to procedures.
//! `ask("a.b.c", args)` dispatches to exactly the handler registered under
//! `"a.b.c"`; there is no partial-prefix matching.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use meshkit_core::{JsonValue, WireError};

use crate::value::RpcValue;

/// Ambient information handed to every invoked procedure.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// The originating identity, when the hosting layer knows one (the bus
    /// layer fills in the source node id).
    pub caller: Option<String>,
    /// Opaque metadata forwarded from the call envelope.
    pub meta: Option<JsonValue>,
}

pub type ProcedureResult = Result<RpcValue, WireError>;

type ProcedureFn = dyn Fn(Vec<RpcValue>, CallContext) -> BoxFuture<'static, ProcedureResult> + Send + Sync;

/// A callable unit: either registered under a router path or passed around
/// as a first-class value (a pin).
#[derive(Clone)]
pub struct Procedure {
    inner: Arc<ProcedureFn>,
}

impl Procedure {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<RpcValue>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcedureResult> + Send + 'static,
    {
        Self { inner: Arc::new(move |args, ctx| Box::pin(f(args, ctx))) }
    }

    pub fn call(&self, args: Vec<RpcValue>, ctx: CallContext) -> BoxFuture<'static, ProcedureResult> {
        (self.inner)(args, ctx)
    }

    /// Stable identity of the underlying closure, used to deduplicate pin
    /// registrations of the same procedure.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner).cast::<()>() as usize
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure").field("identity", &self.identity()).finish()
    }
}

/// A flat path registry of procedures.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Procedure>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `procedure` under `path` (builder style).
    pub fn route(mut self, path: impl Into<String>, procedure: Procedure) -> Self {
        self.insert(path, procedure);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, procedure: Procedure) {
        self.routes.insert(path.into(), procedure);
    }

    pub fn lookup(&self, path: &str) -> Option<&Procedure> {
        self.routes.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        f.debug_struct("Router").field("paths", &paths).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_is_exact_path_match() {
        let router = Router::new()
            .route("math.add", Procedure::new(|args, _ctx| async move {
                let mut sum = 0_i64;
                for arg in args {
                    sum += arg.as_i64().unwrap_or(0);
                }
                Ok(RpcValue::from(sum))
            }))
            .route("math", Procedure::new(|_args, _ctx| async move { Ok(RpcValue::null()) }));

        assert!(router.lookup("math.add").is_some());
        assert!(router.lookup("math").is_some());
        assert!(router.lookup("math.add.extra").is_none());
        assert!(router.lookup("").is_none());

        let procedure = router.lookup("math.add").cloned().unwrap_or_else(|| unreachable!());
        let result = procedure
            .call(vec![RpcValue::from(2_i64), RpcValue::from(3_i64)], CallContext::default())
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(result.as_i64(), Some(5));
    }
}
