//! Receiving side: handler registration and per-kind consumer groups.

use crate::broker::{Broker, ConsumeMode, Consumer, ConsumerSpec};
use crate::caller::{Caller, CallerOptions, Lifecycle};
use crate::codec::Codec;
use crate::command::{InvokeCommand, InvokeResult, NoticeCommand, NoticeResult};
use crate::config::{Config, ConsumerSettings};
use crate::error::{BrokerError, CourierError, Result};
use crate::handler::HandlerRegistration;
use crate::listener::DispatchListener;
use crate::protocol::{consumer_group, wire_topic, CommandKind, PROBE_TAG};
use crate::routing::RoutingTable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub caller: CallerOptions,
    /// Queue count for topics created at startup.
    pub topic_queue_count: usize,
    pub consumers: BTreeMap<CommandKind, ConsumerSettings>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ClientOptions {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            caller: CallerOptions::new(group_name),
            ..Self::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            caller: CallerOptions::from_config(config),
            topic_queue_count: config.topic_queue_count,
            consumers: CommandKind::ALL
                .into_iter()
                .map(|kind| (kind, config.consumer(kind)))
                .collect(),
        }
    }

    pub fn consumer(&self, kind: CommandKind) -> ConsumerSettings {
        self.consumers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| ConsumerSettings::defaults_for(kind))
    }

    /// Adjust the settings of one consumer group.
    #[must_use]
    pub fn with_consumer(
        mut self,
        kind: CommandKind,
        update: impl FnOnce(&mut ConsumerSettings),
    ) -> Self {
        let mut settings = self.consumer(kind);
        update(&mut settings);
        self.consumers.insert(kind, settings);
        self
    }
}

/// Point-in-time view of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub lifecycle: Lifecycle,
    pub consumer_groups: Vec<String>,
    pub routes: usize,
    pub pending_invokes: usize,
}

struct ClientState {
    lifecycle: Lifecycle,
    routing: Option<Arc<RoutingTable>>,
    consumers: Vec<(CommandKind, Arc<dyn Consumer>)>,
}

/// A [`Caller`] that also serves commands through registered handlers.
pub struct Client {
    caller: Caller,
    options: ClientOptions,
    registrations: Mutex<Vec<HandlerRegistration>>,
    state: tokio::sync::Mutex<ClientState>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("caller", &self.caller)
            .field("registrations", &self.registrations.lock().len())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(options: ClientOptions, broker: Arc<dyn Broker>) -> Self {
        Self {
            caller: Caller::new(options.caller.clone(), broker),
            options,
            registrations: Mutex::new(Vec::new()),
            state: tokio::sync::Mutex::new(ClientState {
                lifecycle: Lifecycle::Stopped,
                routing: None,
                consumers: Vec::new(),
            }),
        }
    }

    pub fn from_config(config: &Config, broker: Arc<dyn Broker>) -> Self {
        Self::new(ClientOptions::from_config(config), broker)
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.caller = self.caller.with_codec(codec);
        self
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Add handlers. Registrations without a topic, a tag or any supported
    /// kind are dropped with a warning. Takes effect on the next `start`.
    pub fn register(&self, registrations: impl IntoIterator<Item = HandlerRegistration>) {
        let mut registered = self.registrations.lock();
        for registration in registrations {
            if let Some(problem) = registration.problem() {
                tracing::warn!(
                    topic = %registration.topic,
                    tag = %registration.tag,
                    problem,
                    "Rejected handler registration"
                );
                continue;
            }
            registered.push(registration);
        }
    }

    /// Start the caller and every consumer group that is enabled and has a
    /// handler for its kind. All or nothing: on failure every group started by
    /// this call is shut down again. A no-op when already running.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.lifecycle == Lifecycle::Running {
            return Ok(());
        }
        state.lifecycle = Lifecycle::Starting;

        let caller_started_here = match self.caller.ensure_started().await {
            Ok(started) => started,
            Err(error) => {
                state.lifecycle = Lifecycle::Stopped;
                return Err(error);
            }
        };

        let registrations = self.registrations.lock().clone();
        let routing = Arc::new(RoutingTable::build(&registrations).with_probes());
        let mut started = Vec::new();
        let outcome = match self.start_consumers(&routing, &mut started).await {
            Ok(()) => self.probe(&routing, &started).await,
            Err(error) => Err(error),
        };

        if let Err(error) = outcome {
            for (kind, consumer) in started.drain(..).rev() {
                tracing::debug!(
                    kind = %kind,
                    group = consumer.group(),
                    "Rolling back consumer group"
                );
                consumer.shutdown().await;
            }
            if caller_started_here {
                self.caller.shutdown().await;
            }
            state.lifecycle = Lifecycle::Stopped;
            tracing::warn!(
                group = %self.caller.group_name(),
                error = %error,
                "Client failed to start"
            );
            return Err(error);
        }

        tracing::info!(
            group = %self.caller.group_name(),
            consumer_groups = started.len(),
            routes = routing.len(),
            "Client started"
        );
        state.consumers = started;
        state.routing = Some(routing);
        state.lifecycle = Lifecycle::Running;
        Ok(())
    }

    async fn start_consumers(
        &self,
        routing: &Arc<RoutingTable>,
        started: &mut Vec<(CommandKind, Arc<dyn Consumer>)>,
    ) -> Result<()> {
        let broker = self.caller.broker();
        let producer = self
            .caller
            .producer()
            .ok_or(CourierError::NotStarted { component: "caller" })?;

        for kind in CommandKind::ALL {
            let settings = self.options.consumer(kind);
            if !settings.executable {
                tracing::debug!(kind = %kind, "Consumer group disabled");
                continue;
            }
            if !routing.is_active(kind) {
                continue;
            }

            for topic in routing.topics(kind) {
                broker
                    .create_topic(&wire_topic(&topic, kind), self.options.topic_queue_count)
                    .await
                    .map_err(|error| client_startup_error(kind, error))?;
            }

            let spec = ConsumerSpec {
                group: consumer_group(self.caller.group_name(), kind),
                mode: if kind == CommandKind::OrderedNotice {
                    ConsumeMode::Orderly
                } else {
                    ConsumeMode::Concurrent
                },
                subscriptions: routing.subscriptions(kind),
                threads: settings.threads,
                max_reconsume_times: settings.max_reconsume_times,
                consume_timeout: settings.consume_timeout,
            };
            let listener = DispatchListener::new(
                kind,
                Arc::clone(routing),
                Arc::clone(self.caller.codec()),
                Arc::clone(&producer),
            )
            .with_begin_executable_time(settings.begin_executable_time)
            .with_delay_levels(broker.delay_levels());

            let consumer = broker
                .subscribe(spec, Arc::new(listener))
                .await
                .map_err(|error| client_startup_error(kind, error))?;
            tracing::debug!(kind = %kind, group = consumer.group(), "Consumer group running");
            started.push((kind, consumer));
        }
        Ok(())
    }

    /// Invoke our own probe handler once the invoke group is up.
    async fn probe(
        &self,
        routing: &RoutingTable,
        started: &[(CommandKind, Arc<dyn Consumer>)],
    ) -> Result<()> {
        if !started.iter().any(|(kind, _)| *kind == CommandKind::Invoke) {
            return Ok(());
        }
        let Some(topic) = routing.first_topic(CommandKind::Invoke) else {
            return Ok(());
        };
        let command = InvokeCommand::new(topic.clone(), PROBE_TAG, PROBE_TAG.as_bytes().to_vec());
        self.caller
            .invoke(command, self.caller.default_invoke_timeout())
            .await
            .map_err(|error| CourierError::Startup {
                component: "client",
                reason: format!("liveness probe on `{topic}` failed: {error}"),
            })?;
        tracing::debug!(topic = %topic, "Client liveness probe passed");
        Ok(())
    }

    /// Stop every consumer group and the caller. Safe to call in any state.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Stopped || !state.consumers.is_empty() {
            state.lifecycle = Lifecycle::Stopping;
            for (_, consumer) in state.consumers.drain(..) {
                consumer.shutdown().await;
            }
            state.routing = None;
            tracing::info!(group = %self.caller.group_name(), "Client shut down");
        }
        self.caller.shutdown().await;
        state.lifecycle = Lifecycle::Stopped;
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.lifecycle == Lifecycle::Running
    }

    pub async fn status(&self) -> ClientStatus {
        let state = self.state.lock().await;
        ClientStatus {
            lifecycle: state.lifecycle,
            consumer_groups: state
                .consumers
                .iter()
                .map(|(_, consumer)| consumer.group().to_string())
                .collect(),
            routes: state.routing.as_ref().map_or(0, |routing| routing.len()),
            pending_invokes: self.caller.correlation_table().len(),
        }
    }

    pub async fn invoke(&self, command: InvokeCommand, timeout: Duration) -> Result<InvokeResult> {
        self.caller.invoke(command, timeout).await
    }

    pub async fn notice(
        &self,
        command: NoticeCommand,
        order_key: Option<&str>,
    ) -> Result<NoticeResult> {
        self.caller.notice(command, order_key).await
    }

    pub async fn delayed_notice(
        &self,
        command: NoticeCommand,
        delay: Duration,
    ) -> Result<NoticeResult> {
        self.caller.delayed_notice(command, delay).await
    }
}

fn client_startup_error(kind: CommandKind, error: BrokerError) -> CourierError {
    match error.connectivity() {
        Some(connectivity) => CourierError::Connectivity(connectivity),
        None => CourierError::Startup {
            component: "client",
            reason: format!("{kind} consumer group: {error}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::handler::{handler_fn, HandlerParams, HandlerResult};
    use crate::protocol::Capabilities;

    fn echo() -> HandlerRegistration {
        HandlerRegistration::new(
            "echo",
            "m",
            Capabilities::ALL,
            handler_fn(|params: HandlerParams| async move { Ok(HandlerResult::body(params.body)) }),
        )
    }

    #[tokio::test]
    async fn start_runs_one_group_per_active_kind() {
        let broker = InMemoryBroker::new();
        let client = Client::new(ClientOptions::new("svc"), Arc::new(broker.clone()));
        client.register([echo()]);
        client.start().await.unwrap();

        assert_eq!(
            broker.active_consumer_groups(),
            vec![
                "CONSUMER_svc_CALLER_INVOKE",
                "CONSUMER_svc_DELAY_NOTICE",
                "CONSUMER_svc_INVOKE",
                "CONSUMER_svc_NOTICE",
                "CONSUMER_svc_ORDERED_NOTICE",
            ]
        );
        let status = client.status().await;
        assert_eq!(status.lifecycle, Lifecycle::Running);
        assert_eq!(status.consumer_groups.len(), 4);
        assert_eq!(status.routes, 2);

        client.shutdown().await;
        client.shutdown().await;
        assert!(broker.active_consumer_groups().is_empty());
        assert_eq!(client.status().await.lifecycle, Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn disabled_kinds_are_not_started() {
        let broker = InMemoryBroker::new();
        let options = ClientOptions::new("svc")
            .with_consumer(CommandKind::Notice, |settings| settings.executable = false)
            .with_consumer(CommandKind::DelayedNotice, |settings| settings.executable = false);
        let client = Client::new(options, Arc::new(broker.clone()));
        client.register([echo()]);
        client.start().await.unwrap();

        let groups = client.status().await.consumer_groups;
        assert_eq!(groups, vec!["CONSUMER_svc_INVOKE", "CONSUMER_svc_ORDERED_NOTICE"]);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_registrations_are_dropped() {
        let broker = InMemoryBroker::new();
        let client = Client::new(ClientOptions::new("svc"), Arc::new(broker));
        let mut nameless = echo();
        nameless.topic = String::new();
        client.register([nameless, echo()]);
        assert_eq!(client.registrations.lock().len(), 1);
    }

    #[tokio::test]
    async fn client_without_handlers_only_runs_the_caller() {
        let broker = InMemoryBroker::new();
        let client = Client::new(ClientOptions::new("svc"), Arc::new(broker.clone()));
        client.start().await.unwrap();
        assert_eq!(broker.active_consumer_groups(), vec!["CONSUMER_svc_CALLER_INVOKE"]);
        assert!(client.is_running().await);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn failed_start_leaves_everything_stopped() {
        let broker = InMemoryBroker::new();
        broker.reject_consumer_group("CONSUMER_svc_ORDERED_NOTICE", "injected");
        let client = Client::new(ClientOptions::new("svc"), Arc::new(broker.clone()));
        client.register([echo()]);

        let error = client.start().await.unwrap_err();
        assert!(matches!(error, CourierError::Startup { component: "client", .. }));
        assert!(error.to_string().contains("ordered_notice"));
        assert!(broker.active_consumer_groups().is_empty());
        assert!(!client.is_running().await);

        broker.clear_faults();
        client.start().await.unwrap();
        assert!(client.is_running().await);
        client.shutdown().await;
    }
}
