// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Routing tables: P2P reachability and Pub/Sub interest.
//!
//! Both tables map a key to output edges. The P2P table is first-heard-wins
//! with a cost tie-break (`local < child < parent`); a conflicting
//! announcement for an already-routed node is logged and ignored, which
//! keeps the documented race observable instead of silent.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use meshkit_erpc::Procedure;
use tracing::{debug, warn};

use crate::envelope::MessageSource;
use crate::{NodeId, Topic};

#[derive(Debug, Clone)]
pub(crate) struct RouteEntry {
    pub source: MessageSource,
    pub groups: Vec<String>,
}

/// `NodeId -> output edge` reachability.
#[derive(Default)]
pub(crate) struct P2pTable {
    routes: HashMap<NodeId, RouteEntry>,
}

impl P2pTable {
    /// Installs a route. Returns whether the table changed.
    pub fn insert(&mut self, node_id: NodeId, entry: RouteEntry) -> bool {
        match self.routes.get(&node_id) {
            None => {
                self.routes.insert(node_id, entry);
                true
            }
            Some(existing) if entry.source.cost() < existing.source.cost() => {
                debug!(%node_id, old = %existing.source, new = %entry.source, "route replaced by a cheaper edge");
                self.routes.insert(node_id, entry);
                true
            }
            Some(existing) if existing.source == entry.source => {
                // Refresh (e.g. updated groups) on the winning edge.
                self.routes.insert(node_id, entry);
                false
            }
            Some(existing) => {
                warn!(
                    %node_id,
                    kept = %existing.source,
                    ignored = %entry.source,
                    "conflicting node announcement; first-heard route wins"
                );
                false
            }
        }
    }

    /// Removes the route only if it points at `source`.
    pub fn remove_via(&mut self, node_id: &str, source: &MessageSource) -> bool {
        if self.routes.get(node_id).is_some_and(|entry| &entry.source == source) {
            self.routes.remove(node_id);
            return true;
        }
        false
    }

    /// Drops every route through `source`, returning what was lost.
    pub fn remove_source(&mut self, source: &MessageSource) -> Vec<(NodeId, Vec<String>)> {
        let lost: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|(_, entry)| &entry.source == source)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        lost.into_iter()
            .filter_map(|node_id| self.routes.remove(&node_id).map(|entry| (node_id, entry.groups)))
            .collect()
    }

    pub fn lookup(&self, node_id: &str) -> Option<&RouteEntry> {
        self.routes.get(node_id)
    }

    /// Every route that should be announced over `edge`: everything not
    /// learned from that edge itself.
    pub fn routable_for(&self, edge: &MessageSource) -> Vec<(NodeId, Vec<String>)> {
        self.routes
            .iter()
            .filter(|(_, entry)| &entry.source != edge)
            .map(|(node_id, entry)| (node_id.clone(), entry.groups.clone()))
            .collect()
    }
}

/// Topic interest: registration-ordered local subscribers plus the set of
/// adjacent edges with aggregated downstream interest.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    local: HashMap<Topic, IndexMap<NodeId, Procedure>>,
    remote: HashMap<Topic, HashSet<MessageSource>>,
}

impl SubscriptionTable {
    /// Returns whether the topic's local interest went from none to some.
    pub fn subscribe_local(&mut self, topic: &str, node_id: NodeId, handler: Procedure) -> bool {
        let subscribers = self.local.entry(topic.to_string()).or_default();
        let was_empty = subscribers.is_empty();
        subscribers.insert(node_id, handler);
        was_empty
    }

    /// Returns whether the topic's local interest went from some to none.
    pub fn unsubscribe_local(&mut self, topic: &str, node_id: &str) -> bool {
        let Some(subscribers) = self.local.get_mut(topic) else { return false };
        subscribers.shift_remove(node_id);
        if subscribers.is_empty() {
            self.local.remove(topic);
            return true;
        }
        false
    }

    /// Drops every subscription of `node_id`, returning the topics whose
    /// local interest disappeared.
    pub fn remove_local_node(&mut self, node_id: &str) -> Vec<Topic> {
        let mut emptied = Vec::new();
        self.local.retain(|topic, subscribers| {
            subscribers.shift_remove(node_id);
            if subscribers.is_empty() {
                emptied.push(topic.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    pub fn set_remote(&mut self, topic: &str, source: MessageSource, is_subscribed: bool) {
        if is_subscribed {
            self.remote.entry(topic.to_string()).or_default().insert(source);
        } else if let Some(sources) = self.remote.get_mut(topic) {
            sources.remove(&source);
            if sources.is_empty() {
                self.remote.remove(topic);
            }
        }
    }

    pub fn remove_source(&mut self, source: &MessageSource) {
        self.remote.retain(|_, sources| {
            sources.remove(source);
            !sources.is_empty()
        });
    }

    /// Edges to forward a `topic` message on, excluding where it came from.
    pub fn interested_edges(&self, topic: &str, except: &MessageSource) -> Vec<MessageSource> {
        self.remote
            .get(topic)
            .map(|sources| sources.iter().filter(|s| *s != except).cloned().collect())
            .unwrap_or_default()
    }

    /// Local subscribers in registration order.
    pub fn local_subscribers(&self, topic: &str) -> Vec<(NodeId, Procedure)> {
        self.local
            .get(topic)
            .map(|subscribers| {
                subscribers.iter().map(|(node_id, handler)| (node_id.clone(), handler.clone())).collect()
            })
            .unwrap_or_default()
    }

    /// Whether this bus should report interest in `topic` over `edge`:
    /// any local subscriber, or aggregated interest on another edge.
    pub fn interest_for(&self, topic: &str, edge: &MessageSource) -> bool {
        if self.local.get(topic).is_some_and(|subscribers| !subscribers.is_empty()) {
            return true;
        }
        self.remote
            .get(topic)
            .is_some_and(|sources| sources.iter().any(|source| source != edge))
    }

    /// Every topic this bus should currently report over `edge`.
    pub fn topics_for(&self, edge: &MessageSource) -> HashSet<Topic> {
        let mut topics: HashSet<Topic> = self
            .local
            .iter()
            .filter(|(_, subscribers)| !subscribers.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        for (topic, sources) in &self.remote {
            if sources.iter().any(|source| source != edge) {
                topics.insert(topic.clone());
            }
        }
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkit_erpc::RpcValue;

    fn noop() -> Procedure {
        Procedure::new(|_args, _ctx| async move { Ok(RpcValue::null()) })
    }

    #[test]
    fn first_heard_route_wins_over_equal_cost() {
        let mut table = P2pTable::default();
        let a = MessageSource::Child("a".to_string());
        let b = MessageSource::Child("b".to_string());
        assert!(table.insert("n1".to_string(), RouteEntry { source: a.clone(), groups: vec![] }));
        assert!(!table.insert("n1".to_string(), RouteEntry { source: b, groups: vec![] }));
        assert_eq!(table.lookup("n1").map(|entry| entry.source.clone()), Some(a));
    }

    #[test]
    fn cheaper_edge_replaces_costlier_route() {
        let mut table = P2pTable::default();
        assert!(table.insert("n1".to_string(), RouteEntry { source: MessageSource::Parent, groups: vec![] }));
        assert!(table.insert(
            "n1".to_string(),
            RouteEntry { source: MessageSource::Child("c".to_string()), groups: vec![] }
        ));
        assert!(table.insert("n1".to_string(), RouteEntry { source: MessageSource::Local, groups: vec![] }));
        assert_eq!(table.lookup("n1").map(|entry| entry.source.clone()), Some(MessageSource::Local));
    }

    #[test]
    fn edge_loss_withdraws_only_its_routes() {
        let mut table = P2pTable::default();
        let gone = MessageSource::Child("gone".to_string());
        table.insert("n1".to_string(), RouteEntry { source: gone.clone(), groups: vec![] });
        table.insert("n2".to_string(), RouteEntry { source: MessageSource::Parent, groups: vec![] });

        let lost = table.remove_source(&gone);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, "n1");
        assert!(table.lookup("n1").is_none());
        assert!(table.lookup("n2").is_some());
    }

    #[test]
    fn interest_aggregates_local_and_other_edges() {
        let mut table = SubscriptionTable::default();
        let parent = MessageSource::Parent;
        let child = MessageSource::Child("c".to_string());

        // Interest from a child is reported to the parent but not back to
        // the child it came from.
        table.set_remote("t", child.clone(), true);
        assert!(table.interest_for("t", &parent));
        assert!(!table.interest_for("t", &child));

        // A local subscriber makes the topic interesting to every edge.
        assert!(table.subscribe_local("t", "n1".to_string(), noop()));
        assert!(table.interest_for("t", &child));

        // Dropping both clears the interest again.
        assert!(table.unsubscribe_local("t", "n1"));
        table.set_remote("t", child.clone(), false);
        assert!(!table.interest_for("t", &parent));
    }

    #[test]
    fn local_subscribers_keep_registration_order() {
        let mut table = SubscriptionTable::default();
        table.subscribe_local("t", "n3".to_string(), noop());
        table.subscribe_local("t", "n1".to_string(), noop());
        table.subscribe_local("t", "n2".to_string(), noop());
        let order: Vec<NodeId> = table.local_subscribers("t").into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["n3", "n1", "n2"]);
    }
}
