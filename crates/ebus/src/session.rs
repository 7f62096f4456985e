// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The per-bus session registry.
//!
//! A session is any stateful multi-message operation: broadcast-ask
//! collectors, stream ends. The manager treats them uniformly through three
//! operations and never inspects their internals. Removal is atomic with
//! termination: sessions leave the map through the manager, nothing else.

use std::collections::HashMap;

use meshkit_core::WireError;
use meshkit_erpc::RpcValue;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::MessageSource;
use crate::NodeId;

pub(crate) enum SessionEvent {
    /// A downstream branch produced one broadcast-ask result.
    BroadcastResult { responder: NodeId, seq: u64, result: Result<RpcValue, WireError> },
    /// A downstream branch finished, naming how many results it produced.
    BroadcastFin { total: u64 },
    /// A local subscriber's handler completed.
    LocalResult { responder: NodeId, result: Result<RpcValue, WireError> },
    StreamData { chunk: RpcValue },
    StreamEnd,
    StreamAbort { reason: WireError },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionFlow {
    Continue,
    Finished,
}

pub(crate) trait Session: Send {
    fn update(&mut self, event: SessionEvent, source: &MessageSource) -> SessionFlow;

    /// One adjacent connection dropped. An `Err` terminates the session with
    /// that error; the fan-out itself never blocks on a session.
    fn handle_downstream_disconnect(&mut self, source: &MessageSource) -> Result<SessionFlow, WireError>;

    fn terminate(&mut self, reason: Option<WireError>);
}

#[derive(Default)]
pub(crate) struct SessionManager {
    sessions: HashMap<Uuid, Box<dyn Session>>,
}

impl SessionManager {
    pub fn register(&mut self, session_id: Uuid, session: Box<dyn Session>) {
        if self.sessions.insert(session_id, session).is_some() {
            debug!(%session_id, "session id reused; previous session dropped");
        }
    }

    pub fn update(&mut self, session_id: Uuid, event: SessionEvent, source: &MessageSource) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!(%session_id, "event for unknown session, dropping");
            return;
        };
        if session.update(event, source) == SessionFlow::Finished {
            self.terminate(session_id, None);
        }
    }

    /// Atomic `remove + terminate`; the only way a session leaves the map.
    pub fn terminate(&mut self, session_id: Uuid, reason: Option<WireError>) {
        if let Some(mut session) = self.sessions.remove(&session_id) {
            session.terminate(reason);
        }
    }

    /// Fans one connection drop out to every session.
    pub fn connection_dropped(&mut self, source: &MessageSource) {
        let ids: Vec<Uuid> = self.sessions.keys().copied().collect();
        for session_id in ids {
            let Some(session) = self.sessions.get_mut(&session_id) else { continue };
            match session.handle_downstream_disconnect(source) {
                Ok(SessionFlow::Continue) => {}
                Ok(SessionFlow::Finished) => self.terminate(session_id, None),
                Err(error) => self.terminate(session_id, Some(error)),
            }
        }
    }

    pub fn close_all(&mut self, reason: &WireError) {
        for (_, mut session) in self.sessions.drain() {
            session.terminate(Some(reason.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        finish_on_update: bool,
        fail_on_disconnect: bool,
        terminated_with: std::sync::Arc<std::sync::Mutex<Option<Option<WireError>>>>,
    }

    impl Session for Probe {
        fn update(&mut self, _event: SessionEvent, _source: &MessageSource) -> SessionFlow {
            if self.finish_on_update {
                SessionFlow::Finished
            } else {
                SessionFlow::Continue
            }
        }

        fn handle_downstream_disconnect(
            &mut self,
            _source: &MessageSource,
        ) -> Result<SessionFlow, WireError> {
            if self.fail_on_disconnect {
                Err(WireError::link_closed("probe exploded"))
            } else {
                Ok(SessionFlow::Continue)
            }
        }

        fn terminate(&mut self, reason: Option<WireError>) {
            *self.terminated_with.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reason);
        }
    }

    fn probe(
        finish_on_update: bool,
        fail_on_disconnect: bool,
    ) -> (Probe, std::sync::Arc<std::sync::Mutex<Option<Option<WireError>>>>) {
        let terminated_with = std::sync::Arc::new(std::sync::Mutex::new(None));
        (
            Probe { finish_on_update, fail_on_disconnect, terminated_with: terminated_with.clone() },
            terminated_with,
        )
    }

    #[test]
    fn finished_sessions_are_removed_and_terminated() {
        let mut manager = SessionManager::default();
        let (session, terminated) = probe(true, false);
        let id = Uuid::new_v4();
        manager.register(id, Box::new(session));

        manager.update(id, SessionEvent::StreamEnd, &MessageSource::Local);
        assert_eq!(manager.len(), 0);
        assert_eq!(*terminated.lock().unwrap_or_else(std::sync::PoisonError::into_inner), Some(None));
    }

    #[test]
    fn failing_disconnect_terminates_with_the_error() {
        let mut manager = SessionManager::default();
        let (bad, bad_terminated) = probe(false, true);
        let (good, good_terminated) = probe(false, false);
        let bad_id = Uuid::new_v4();
        let good_id = Uuid::new_v4();
        manager.register(bad_id, Box::new(bad));
        manager.register(good_id, Box::new(good));

        manager.connection_dropped(&MessageSource::Parent);
        // The failing session is terminated with its own error; the healthy
        // one stays registered.
        assert_eq!(manager.len(), 1);
        assert_eq!(
            *bad_terminated.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            Some(Some(WireError::link_closed("probe exploded")))
        );
        assert_eq!(*good_terminated.lock().unwrap_or_else(std::sync::PoisonError::into_inner), None);
    }

    #[test]
    fn close_all_passes_the_shutdown_reason() {
        let mut manager = SessionManager::default();
        let (session, terminated) = probe(false, false);
        manager.register(Uuid::new_v4(), Box::new(session));

        manager.close_all(&WireError::NodeClosing);
        assert_eq!(manager.len(), 0);
        assert_eq!(
            *terminated.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            Some(Some(WireError::NodeClosing))
        );
    }
}
