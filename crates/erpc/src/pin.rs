// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pins: procedures exposed across the connection by reference.
//!
//! Serializing a [`Procedure`](crate::router::Procedure) registers it here
//! and puts only the pin id on the wire. The peer deserializes a
//! [`PinProxy`] whose calls are dispatched back to the owning node. Entries
//! are reference counted: serializing the same procedure again bumps the
//! count, and every dropped proxy sends one `pin-free` back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::node::CallHandle;
use crate::proto::CallTarget;
use crate::router::Procedure;
use crate::value::RpcValue;
use meshkit_core::WireError;

struct PinEntry {
    procedure: Procedure,
    ref_count: u32,
}

#[derive(Default)]
struct PinState {
    by_identity: HashMap<usize, Uuid>,
    entries: HashMap<Uuid, PinEntry>,
}

/// Registry of locally owned pinned procedures.
pub(crate) struct PinManager {
    inner: Mutex<PinState>,
}

impl PinManager {
    pub fn new() -> Self {
        Self { inner: Mutex::new(PinState::default()) }
    }

    /// Registers `procedure`, reusing the existing pin id (and bumping its
    /// reference count) when the same closure was pinned before.
    pub fn register(&self, procedure: &Procedure) -> Uuid {
        let mut state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let identity = procedure.identity();
        if let Some(&pin_id) = state.by_identity.get(&identity) {
            if let Some(entry) = state.entries.get_mut(&pin_id) {
                entry.ref_count += 1;
                return pin_id;
            }
        }
        let pin_id = Uuid::new_v4();
        state.by_identity.insert(identity, pin_id);
        state.entries.insert(pin_id, PinEntry { procedure: procedure.clone(), ref_count: 1 });
        pin_id
    }

    /// Drops `count` references; the entry is released at zero. Frees for
    /// unknown ids race with release and are dropped silently.
    pub fn free(&self, pin_id: Uuid, count: u32) {
        let mut state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = state.entries.get_mut(&pin_id) else {
            debug!(%pin_id, "pin-free for unknown pin");
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(count);
        if entry.ref_count == 0 {
            let identity = entry.procedure.identity();
            state.entries.remove(&pin_id);
            state.by_identity.remove(&identity);
        }
    }

    pub fn get(&self, pin_id: Uuid) -> Option<Procedure> {
        let state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.entries.get(&pin_id).map(|entry| entry.procedure.clone())
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.by_identity.clear();
        state.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .len()
    }
}

struct PinProxyInner {
    pin_id: Uuid,
    calls: CallHandle,
}

impl Drop for PinProxyInner {
    fn drop(&mut self) {
        // Owner death is the other release path; a failed send means the
        // connection is gone and the remote registry died with it.
        self.calls.free_pin(self.pin_id);
    }
}

/// A callable reference to a procedure owned by a remote peer.
#[derive(Clone)]
pub struct PinProxy {
    inner: Arc<PinProxyInner>,
}

impl PinProxy {
    pub(crate) fn new(pin_id: Uuid, calls: CallHandle) -> Self {
        Self { inner: Arc::new(PinProxyInner { pin_id, calls }) }
    }

    pub fn pin_id(&self) -> Uuid {
        self.inner.pin_id
    }

    /// Invokes the pinned procedure and awaits its result.
    ///
    /// # Errors
    ///
    /// Surfaces the remote procedure's error or the connection failure.
    pub async fn ask(&self, args: Vec<RpcValue>) -> Result<RpcValue, WireError> {
        self.inner.calls.ask(CallTarget::Pin(self.inner.pin_id), args).await
    }

    /// Fire-and-forget invocation.
    pub async fn tell(&self, args: Vec<RpcValue>) {
        self.inner.calls.tell(CallTarget::Pin(self.inner.pin_id), args).await;
    }

    /// Wraps the proxy as a [`Procedure`], which is how a pin received from
    /// one peer can be re-pinned and forwarded to another.
    pub fn as_procedure(&self) -> Procedure {
        let proxy = self.clone();
        Procedure::new(move |args, _ctx| {
            let proxy = proxy.clone();
            async move { proxy.ask(args).await }
        })
    }
}

impl std::fmt::Debug for PinProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinProxy").field("pin_id", &self.inner.pin_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Procedure {
        Procedure::new(|_args, _ctx| async move { Ok(RpcValue::null()) })
    }

    #[test]
    fn same_procedure_reuses_the_pin() {
        let pins = PinManager::new();
        let procedure = noop();
        let first = pins.register(&procedure);
        let second = pins.register(&procedure);
        assert_eq!(first, second);
        assert_eq!(pins.len(), 1);

        // Two references: the first free keeps it alive, the second releases.
        pins.free(first, 1);
        assert!(pins.get(first).is_some());
        pins.free(first, 1);
        assert!(pins.get(first).is_none());
        assert_eq!(pins.len(), 0);
    }

    #[test]
    fn distinct_procedures_get_distinct_pins() {
        let pins = PinManager::new();
        let first = pins.register(&noop());
        let second = pins.register(&noop());
        assert_ne!(first, second);
        assert_eq!(pins.len(), 2);
    }
}
