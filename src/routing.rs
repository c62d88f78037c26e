use crate::handler::{Handler, HandlerRegistration, ProbeHandler};
use crate::protocol::{
    sanitize_topic, tag_expression, wire_topic, Capabilities, CommandKind, ALL_TAGS, PROBE_TAG,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// A resolved handler together with what it accepts.
#[derive(Clone)]
pub struct Route {
    pub topic: String,
    pub tag: String,
    pub capabilities: Capabilities,
    pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("topic", &self.topic)
            .field("tag", &self.tag)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Immutable (topic, tag) to handler mapping plus the per-kind tag sets each
/// consumer group subscribes to. Topics are stored sanitized.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<(String, String), Arc<Route>>,
    subscriptions: BTreeMap<CommandKind, BTreeMap<String, BTreeSet<String>>>,
}

impl RoutingTable {
    /// Build from registrations. Unroutable registrations are skipped with a
    /// warning; a later registration for the same (topic, tag) replaces an
    /// earlier one.
    pub fn build(registrations: &[HandlerRegistration]) -> Self {
        let mut table = Self::default();
        for registration in registrations {
            if let Some(problem) = registration.problem() {
                tracing::warn!(
                    topic = %registration.topic,
                    tag = %registration.tag,
                    problem,
                    "Skipping handler registration"
                );
                continue;
            }
            table.insert(Route {
                topic: sanitize_topic(registration.topic.trim()),
                tag: registration.tag.trim().to_string(),
                capabilities: registration.capabilities,
                handler: Arc::clone(&registration.handler),
            });
        }
        table
    }

    fn insert(&mut self, route: Route) {
        let key = (route.topic.clone(), route.tag.clone());
        if let Some(previous) = self.routes.get(&key) {
            tracing::warn!(
                topic = %route.topic,
                tag = %route.tag,
                "Duplicate handler registration; the later one wins"
            );
            for kind in previous.capabilities.kinds() {
                if let Some(tags) = self
                    .subscriptions
                    .get_mut(&kind)
                    .and_then(|topics| topics.get_mut(&route.topic))
                {
                    tags.remove(&route.tag);
                }
            }
        }
        for kind in route.capabilities.kinds() {
            self.subscriptions
                .entry(kind)
                .or_default()
                .entry(route.topic.clone())
                .or_default()
                .insert(route.tag.clone());
        }
        self.routes.insert(key, Arc::new(route));
        self.subscriptions.retain(|_, topics| {
            topics.retain(|_, tags| !tags.is_empty());
            !topics.is_empty()
        });
    }

    /// Add a probe handler to every topic that has at least one handler.
    /// The probe only joins the kinds its topic is already active for.
    #[must_use]
    pub fn with_probes(mut self) -> Self {
        let topics: BTreeSet<String> = self.routes.keys().map(|(topic, _)| topic.clone()).collect();
        for topic in topics {
            let capabilities = self
                .subscriptions
                .iter()
                .filter(|(_, topics)| topics.contains_key(&topic))
                .fold(Capabilities::NONE, |caps, (kind, _)| caps.with(*kind));
            if self.routes.contains_key(&(topic.clone(), PROBE_TAG.to_string())) {
                continue;
            }
            self.insert(Route {
                topic,
                tag: PROBE_TAG.to_string(),
                capabilities,
                handler: Arc::new(ProbeHandler),
            });
        }
        self
    }

    /// Resolve the route serving `kind` for a sanitized topic and tag. An exact
    /// route that does not accept `kind` gives way to a `*` route that does.
    pub fn resolve(&self, topic: &str, tag: &str, kind: CommandKind) -> Option<&Arc<Route>> {
        [tag, ALL_TAGS]
            .into_iter()
            .filter_map(|tag| self.lookup(topic, tag))
            .find(|route| route.capabilities.supports(kind))
    }

    /// Exact (topic, tag) entry, whatever kinds it accepts.
    pub fn lookup(&self, topic: &str, tag: &str) -> Option<&Arc<Route>> {
        self.routes.get(&(topic.to_string(), tag.to_string()))
    }

    pub fn is_active(&self, kind: CommandKind) -> bool {
        self.subscriptions.contains_key(&kind)
    }

    /// Sanitized topics with at least one handler for `kind`.
    pub fn topics(&self, kind: CommandKind) -> Vec<String> {
        self.subscriptions
            .get(&kind)
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Wire topic to tag expression, as handed to the broker.
    pub fn subscriptions(&self, kind: CommandKind) -> BTreeMap<String, String> {
        self.subscriptions
            .get(&kind)
            .map(|topics| {
                topics
                    .iter()
                    .map(|(topic, tags)| {
                        (
                            wire_topic(topic, kind),
                            tag_expression(tags.iter().map(String::as_str)),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First topic (in name order) active for `kind`.
    pub fn first_topic(&self, kind: CommandKind) -> Option<String> {
        self.subscriptions
            .get(&kind)
            .and_then(|topics| topics.keys().next().cloned())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
