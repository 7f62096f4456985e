// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Broadcast-ask sessions.
//!
//! The originating bus runs a root session collecting results in arrival
//! order until every branch reported `ack-fin` (or disconnected). Every
//! intermediate bus runs a relay session that forwards results upstream as
//! they arrive, re-stamped with its own sequence, and reports the total it
//! observed once its own branches are done.

use std::collections::HashMap;

use meshkit_core::WireError;
use meshkit_erpc::RpcValue;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::BridgeHandle;
use crate::envelope::{BroadcastEnvelope, BroadcastPayload, Envelope, MessageSource};
use crate::session::{Session, SessionEvent, SessionFlow};
use crate::{BusId, NodeId, Topic};

pub(crate) type AskOutcome = Result<Vec<Result<RpcValue, WireError>>, WireError>;

#[derive(Default)]
struct Branch {
    received: u64,
}

impl Branch {
    /// Tracks one result; sequence gaps mark permanently lost results.
    fn note(&mut self, seq: u64, source: &MessageSource) {
        if seq != self.received {
            warn!(%source, expected = self.received, got = seq, "broadcast-ask results lost in transit");
        }
        self.received = seq + 1;
    }
}

/// The collector at the bus the ask originated on.
pub(crate) struct RootAskSession {
    branches: HashMap<MessageSource, Branch>,
    pending_local: usize,
    collected: Vec<Result<RpcValue, WireError>>,
    done: Option<oneshot::Sender<AskOutcome>>,
}

impl RootAskSession {
    pub fn new(
        branches: Vec<MessageSource>,
        pending_local: usize,
        done: oneshot::Sender<AskOutcome>,
    ) -> Self {
        Self {
            branches: branches.into_iter().map(|source| (source, Branch::default())).collect(),
            pending_local,
            collected: Vec::new(),
            done: Some(done),
        }
    }

    fn check_terminal(&mut self) -> SessionFlow {
        if self.branches.is_empty() && self.pending_local == 0 {
            if let Some(done) = self.done.take() {
                let _ = done.send(Ok(std::mem::take(&mut self.collected)));
            }
            return SessionFlow::Finished;
        }
        SessionFlow::Continue
    }
}

impl Session for RootAskSession {
    fn update(&mut self, event: SessionEvent, source: &MessageSource) -> SessionFlow {
        match event {
            SessionEvent::LocalResult { result, .. } => {
                self.pending_local = self.pending_local.saturating_sub(1);
                self.collected.push(result);
                self.check_terminal()
            }
            SessionEvent::BroadcastResult { seq, result, .. } => {
                match self.branches.get_mut(source) {
                    Some(branch) => branch.note(seq, source),
                    None => debug!(%source, "result from an unknown or closed branch"),
                }
                self.collected.push(result);
                SessionFlow::Continue
            }
            SessionEvent::BroadcastFin { total } => {
                if let Some(branch) = self.branches.remove(source) {
                    if branch.received != total {
                        warn!(%source, expected = total, got = branch.received, "branch closed with missing results");
                    }
                }
                self.check_terminal()
            }
            _ => {
                debug!("unexpected event for a broadcast-ask session");
                SessionFlow::Continue
            }
        }
    }

    fn handle_downstream_disconnect(&mut self, source: &MessageSource) -> Result<SessionFlow, WireError> {
        if self.branches.remove(source).is_some() {
            // The branch's missing results are permanently lost; the
            // collector resolves with what arrived before the drop.
            debug!(%source, "broadcast-ask branch disconnected, truncating");
        }
        Ok(self.check_terminal())
    }

    fn terminate(&mut self, reason: Option<WireError>) {
        if let Some(done) = self.done.take() {
            let _ = match reason {
                Some(error) => done.send(Err(error)),
                None => done.send(Ok(std::mem::take(&mut self.collected))),
            };
        }
    }
}

/// The forwarding session on every bus between a branch and the origin.
pub(crate) struct RelayAskSession {
    call_id: Uuid,
    topic: Topic,
    bus_id: BusId,
    upstream: BridgeHandle,
    branches: HashMap<MessageSource, Branch>,
    pending_local: usize,
    next_seq: u64,
}

impl RelayAskSession {
    pub fn new(
        call_id: Uuid,
        topic: Topic,
        bus_id: BusId,
        upstream: BridgeHandle,
        branches: Vec<MessageSource>,
        pending_local: usize,
    ) -> Self {
        Self {
            call_id,
            topic,
            bus_id,
            upstream,
            branches: branches.into_iter().map(|source| (source, Branch::default())).collect(),
            pending_local,
            next_seq: 0,
        }
    }

    fn forward(&mut self, responder: NodeId, result: Result<RpcValue, WireError>) {
        let result_seq = self.next_seq;
        self.next_seq += 1;
        self.upstream.send_envelope(Envelope::Broadcast(BroadcastEnvelope {
            source_id: responder,
            source_groups: Vec::new(),
            topic: self.topic.clone(),
            loopback: false,
            payload: BroadcastPayload::AckResult { call_id: self.call_id, result_seq, result },
        }));
    }

    fn check_terminal(&mut self) -> SessionFlow {
        if self.branches.is_empty() && self.pending_local == 0 {
            self.upstream.send_envelope(Envelope::Broadcast(BroadcastEnvelope {
                source_id: self.bus_id.clone(),
                source_groups: Vec::new(),
                topic: self.topic.clone(),
                loopback: false,
                payload: BroadcastPayload::AckFin {
                    call_id: self.call_id,
                    total_results: self.next_seq,
                },
            }));
            return SessionFlow::Finished;
        }
        SessionFlow::Continue
    }
}

impl Session for RelayAskSession {
    fn update(&mut self, event: SessionEvent, source: &MessageSource) -> SessionFlow {
        match event {
            SessionEvent::LocalResult { responder, result } => {
                self.pending_local = self.pending_local.saturating_sub(1);
                self.forward(responder, result);
                self.check_terminal()
            }
            SessionEvent::BroadcastResult { responder, seq, result } => {
                match self.branches.get_mut(source) {
                    Some(branch) => branch.note(seq, source),
                    None => debug!(%source, "result from an unknown or closed branch"),
                }
                self.forward(responder, result);
                SessionFlow::Continue
            }
            SessionEvent::BroadcastFin { total } => {
                if let Some(branch) = self.branches.remove(source) {
                    if branch.received != total {
                        warn!(%source, expected = total, got = branch.received, "branch closed with missing results");
                    }
                }
                self.check_terminal()
            }
            _ => {
                debug!("unexpected event for a broadcast-ask relay");
                SessionFlow::Continue
            }
        }
    }

    fn handle_downstream_disconnect(&mut self, source: &MessageSource) -> Result<SessionFlow, WireError> {
        if source == &self.upstream.source {
            // Nobody left to report to.
            return Ok(SessionFlow::Finished);
        }
        if self.branches.remove(source).is_some() {
            debug!(%source, "broadcast-ask branch disconnected, truncating");
        }
        Ok(self.check_terminal())
    }

    fn terminate(&mut self, _reason: Option<WireError>) {
        // Best effort: the upstream either saw our fin or is gone.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_session_collects_until_all_branches_close() {
        let child_a = MessageSource::Child("a".to_string());
        let child_b = MessageSource::Child("b".to_string());
        let (done, outcome) = oneshot::channel();
        let mut session = RootAskSession::new(vec![child_a.clone(), child_b.clone()], 1, done);

        assert_eq!(
            session.update(
                SessionEvent::LocalResult { responder: "n0".to_string(), result: Ok(RpcValue::from(1_i64)) },
                &MessageSource::Local,
            ),
            SessionFlow::Continue
        );
        assert_eq!(
            session.update(
                SessionEvent::BroadcastResult {
                    responder: "n1".to_string(),
                    seq: 0,
                    result: Ok(RpcValue::from(2_i64)),
                },
                &child_a,
            ),
            SessionFlow::Continue
        );
        assert_eq!(session.update(SessionEvent::BroadcastFin { total: 1 }, &child_a), SessionFlow::Continue);
        assert_eq!(session.update(SessionEvent::BroadcastFin { total: 0 }, &child_b), SessionFlow::Finished);

        let collected = outcome.await.expect("resolved").expect("ok");
        assert_eq!(collected.len(), 2);
    }

    #[tokio::test]
    async fn disconnected_branch_truncates_instead_of_failing() {
        let child = MessageSource::Child("a".to_string());
        let (done, outcome) = oneshot::channel();
        let mut session = RootAskSession::new(vec![child.clone()], 0, done);

        assert_eq!(
            session.handle_downstream_disconnect(&child).expect("no error"),
            SessionFlow::Finished
        );
        let collected = outcome.await.expect("resolved").expect("ok");
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn terminate_fails_the_collector() {
        let (done, outcome) = oneshot::channel();
        let mut session = RootAskSession::new(vec![MessageSource::Parent], 0, done);
        session.terminate(Some(WireError::NodeClosing));
        let err = outcome.await.expect("resolved").expect_err("failed");
        assert_eq!(err, WireError::NodeClosing);
    }
}
