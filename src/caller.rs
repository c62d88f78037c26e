//! Sending side: invoke, notice, ordered notice and delayed notice.

use crate::broker::{
    Broker, ConsumeMode, ConsumeStatus, Consumer, ConsumerSpec, DeliveredMessage,
    MessageListener, OutboundMessage, Producer,
};
use crate::clock;
use crate::codec::{default_codec, Codec};
use crate::command::{InvokeCommand, InvokeResult, NoticeCommand, NoticeResult};
use crate::config::Config;
use crate::correlation::CorrelationTable;
use crate::error::{BrokerError, CourierError, Result};
use crate::promise::Promise;
use crate::protocol::{
    delay_level_for, producer_group, response_consumer_group, response_tag, response_topic,
    wire_topic, CommandKind, DelayedNoticeRequest, InvokeRequest, InvokeResponse, ALL_TAGS,
    COMMAND_KIND_KEY, DELAYED_NOTICE_REQUEST_KEY, INVOKE_REQUEST_KEY, PROBE_TAG,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle shared by [`Caller`] and [`crate::Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerOptions {
    pub group_name: String,
    pub default_invoke_timeout: Duration,
    pub response_threads: usize,
    pub response_consume_timeout: Duration,
}

impl Default for CallerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CallerOptions {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            group_name: config.group_name.clone(),
            default_invoke_timeout: config.default_invoke_timeout(),
            response_threads: config.response_threads,
            response_consume_timeout: config.consumer(CommandKind::Invoke).consume_timeout,
        }
    }
}

struct CallerState {
    lifecycle: Lifecycle,
    producer: Option<Arc<dyn Producer>>,
    response_consumer: Option<Arc<dyn Consumer>>,
}

/// Owns the producer, the private response consumer and the correlation
/// table. Every method that sends must be called inside a tokio runtime.
pub struct Caller {
    options: CallerOptions,
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    table: CorrelationTable,
    response_topic: String,
    delay_levels: Vec<Duration>,
    state: tokio::sync::Mutex<CallerState>,
    // Set only while running; read on every send without touching `state`.
    producer: RwLock<Option<Arc<dyn Producer>>>,
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("group_name", &self.options.group_name)
            .field("response_topic", &self.response_topic)
            .field("pending", &self.table.len())
            .finish_non_exhaustive()
    }
}

impl Caller {
    pub fn new(options: CallerOptions, broker: Arc<dyn Broker>) -> Self {
        let delay_levels = broker.delay_levels();
        Self {
            response_topic: response_topic(&options.group_name),
            options,
            broker,
            codec: default_codec(),
            table: CorrelationTable::new(),
            delay_levels,
            state: tokio::sync::Mutex::new(CallerState {
                lifecycle: Lifecycle::Stopped,
                producer: None,
                response_consumer: None,
            }),
            producer: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn group_name(&self) -> &str {
        &self.options.group_name
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    pub fn default_invoke_timeout(&self) -> Duration {
        self.options.default_invoke_timeout
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn correlation_table(&self) -> &CorrelationTable {
        &self.table
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.state.lock().await.lifecycle
    }

    pub(crate) fn producer(&self) -> Option<Arc<dyn Producer>> {
        self.producer.read().clone()
    }

    fn require_producer(&self) -> Result<Arc<dyn Producer>> {
        self.producer()
            .ok_or(CourierError::NotStarted { component: "caller" })
    }

    /// Start the producer and response consumer, then publish a probe to our
    /// own response topic. A no-op when already running.
    pub async fn start(&self) -> Result<()> {
        self.ensure_started().await.map(|_| ())
    }

    /// Like [`start`](Self::start); `Ok(true)` when this call did the start.
    pub(crate) async fn ensure_started(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.lifecycle == Lifecycle::Running {
            return Ok(false);
        }
        state.lifecycle = Lifecycle::Starting;

        match self.start_components(&mut state).await {
            Ok(producer) => {
                *self.producer.write() = Some(producer);
                state.lifecycle = Lifecycle::Running;
                tracing::info!(
                    group = %self.options.group_name,
                    response_topic = %self.response_topic,
                    "Caller started"
                );
                Ok(true)
            }
            Err(error) => {
                stop_components(&mut state).await;
                state.lifecycle = Lifecycle::Stopped;
                tracing::warn!(
                    group = %self.options.group_name,
                    error = %error,
                    "Caller failed to start"
                );
                Err(error)
            }
        }
    }

    async fn start_components(&self, state: &mut CallerState) -> Result<Arc<dyn Producer>> {
        let producer = self
            .broker
            .create_producer(&producer_group(&self.options.group_name))
            .await
            .map_err(|error| startup_error("caller", error))?;
        state.producer = Some(Arc::clone(&producer));

        let spec = ConsumerSpec {
            group: response_consumer_group(&self.options.group_name),
            mode: ConsumeMode::Broadcast,
            subscriptions: BTreeMap::from([(self.response_topic.clone(), ALL_TAGS.to_string())]),
            threads: self.options.response_threads.max(1),
            max_reconsume_times: 0,
            consume_timeout: self.options.response_consume_timeout,
        };
        let listener = ResponseListener {
            table: self.table.clone(),
            codec: Arc::clone(&self.codec),
        };
        let consumer = self
            .broker
            .subscribe(spec, Arc::new(listener))
            .await
            .map_err(|error| startup_error("caller", error))?;
        state.response_consumer = Some(consumer);

        self.self_test(producer.as_ref()).await?;
        Ok(producer)
    }

    async fn self_test(&self, producer: &dyn Producer) -> Result<()> {
        let now = clock::now_millis();
        let probe = InvokeResponse {
            request_id: format!("probe-{}", Uuid::new_v4()),
            body: Some(Vec::new()),
            error_detail: None,
            trace_nos: Vec::new(),
            issue_time: now,
            response_time: now,
        };
        let message = OutboundMessage::new(
            &self.response_topic,
            response_tag(PROBE_TAG),
            self.codec.encode(&probe)?,
        );
        producer
            .send(message)
            .await
            .map_err(|error| startup_error("caller", error))?;
        tracing::debug!(response_topic = %self.response_topic, "Caller self-test passed");
        Ok(())
    }

    /// Stop the producer and response consumer and cancel pending invokes.
    /// Safe to call in any state.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle == Lifecycle::Stopped
            && state.producer.is_none()
            && state.response_consumer.is_none()
        {
            return;
        }
        state.lifecycle = Lifecycle::Stopping;
        *self.producer.write() = None;
        stop_components(&mut state).await;
        let cancelled = self.table.cancel_all();
        state.lifecycle = Lifecycle::Stopped;
        tracing::info!(
            group = %self.options.group_name,
            cancelled,
            "Caller shut down"
        );
    }

    /// Send an invoke and return a promise for its result.
    ///
    /// The promise fails immediately when the caller is not running or the
    /// envelope cannot be built, fails with the send error when the broker
    /// refuses the message, and is cancelled once `timeout` elapses without
    /// a response.
    pub fn async_invoke(&self, command: InvokeCommand, timeout: Duration) -> Promise<InvokeResult> {
        let producer = match self.require_producer() {
            Ok(producer) => producer,
            Err(error) => return failed(error),
        };

        let issue_time = clock::now_millis();
        let request = InvokeRequest {
            request_id: Uuid::new_v4().to_string(),
            issue_time,
            deadline: issue_time.saturating_add(millis_i64(timeout)),
            response_topic: self.response_topic.clone(),
            response_tag: response_tag(&command.tag),
        };
        let promise = self.table.register(&request.request_id, timeout);

        let message = match self.invoke_message(&command, &request) {
            Ok(message) => message,
            Err(error) => {
                self.table.settle(&request.request_id, Err(error));
                return promise;
            }
        };

        let table = self.table.clone();
        let request_id = request.request_id;
        tokio::spawn(async move {
            if let Err(error) = producer.send(message).await {
                tracing::warn!(
                    request_id = %request_id,
                    topic = %command.topic,
                    tag = %command.tag,
                    error = %error,
                    "Invoke send failed"
                );
                table.settle(&request_id, Err(error.into()));
            }
        });
        promise
    }

    /// Send an invoke and wait for the result. Expiry surfaces as
    /// [`CourierError::Timeout`].
    pub async fn invoke(&self, command: InvokeCommand, timeout: Duration) -> Result<InvokeResult> {
        let topic = command.topic.clone();
        let tag = command.tag.clone();
        self.async_invoke(command, timeout)
            .result()
            .await
            .map_err(|error| match error {
                CourierError::Cancelled => CourierError::Timeout {
                    topic,
                    tag,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                },
                other => other,
            })
    }

    fn invoke_message(
        &self,
        command: &InvokeCommand,
        request: &InvokeRequest,
    ) -> Result<OutboundMessage> {
        let mut message = OutboundMessage::new(
            wire_topic(&command.topic, CommandKind::Invoke),
            &command.tag,
            command.body.clone(),
        );
        message.properties = command.wire_properties();
        Ok(message
            .with_property(COMMAND_KIND_KEY, CommandKind::Invoke.as_str())
            .with_property(INVOKE_REQUEST_KEY, self.codec.encode_text(request)?))
    }

    /// Send a notice. With an order key it goes to the ordered-notice topic
    /// and every notice sharing the key lands on the same queue.
    pub async fn notice(
        &self,
        command: NoticeCommand,
        order_key: Option<&str>,
    ) -> Result<NoticeResult> {
        let producer = self.require_producer()?;
        let kind = if order_key.is_some() {
            CommandKind::OrderedNotice
        } else {
            CommandKind::Notice
        };
        send_routed(producer.as_ref(), notice_message(&command, kind), order_key).await
    }

    pub fn async_notice(
        &self,
        command: NoticeCommand,
        order_key: Option<String>,
    ) -> Promise<NoticeResult> {
        let producer = match self.require_producer() {
            Ok(producer) => producer,
            Err(error) => return failed(error),
        };
        let kind = if order_key.is_some() {
            CommandKind::OrderedNotice
        } else {
            CommandKind::Notice
        };
        let message = notice_message(&command, kind);
        let promise = Promise::new();
        let settled = promise.clone();
        tokio::spawn(async move {
            let outcome = send_routed(producer.as_ref(), message, order_key.as_deref()).await;
            settle_notice(&settled, outcome);
        });
        promise
    }

    /// Send a notice that must not be handled before `delay` has elapsed.
    pub async fn delayed_notice(
        &self,
        command: NoticeCommand,
        delay: Duration,
    ) -> Result<NoticeResult> {
        let producer = self.require_producer()?;
        let message = self.delayed_message(&command, delay, clock::now_millis())?;
        send_notice(producer.as_ref(), message).await
    }

    pub fn async_delayed_notice(
        &self,
        command: NoticeCommand,
        delay: Duration,
    ) -> Promise<NoticeResult> {
        let producer = match self.require_producer() {
            Ok(producer) => producer,
            Err(error) => return failed(error),
        };
        let message = match self.delayed_message(&command, delay, clock::now_millis()) {
            Ok(message) => message,
            Err(error) => return failed(error),
        };
        let promise = Promise::new();
        let settled = promise.clone();
        tokio::spawn(async move {
            settle_notice(&settled, send_notice(producer.as_ref(), message).await);
        });
        promise
    }

    /// Map `delay` onto a broker delay level. When the level is not exact the
    /// precise target time travels in a [`DelayedNoticeRequest`] header.
    fn delayed_message(
        &self,
        command: &NoticeCommand,
        delay: Duration,
        now: i64,
    ) -> Result<OutboundMessage> {
        let mut message = notice_message(command, CommandKind::DelayedNotice);
        let level = delay_level_for(delay, &self.delay_levels);
        let exact = match level {
            Some(level) => {
                message.delay_level = Some(level.level);
                level.exact
            }
            None => {
                if !delay.is_zero() {
                    tracing::warn!(
                        topic = %command.topic,
                        tag = %command.tag,
                        delay_ms = millis_i64(delay),
                        "Delay is shorter than the smallest delay level; sending undelayed"
                    );
                }
                delay.is_zero()
            }
        };
        if !exact {
            let request = DelayedNoticeRequest {
                target_execute_time: now.saturating_add(millis_i64(delay)),
            };
            let header = self.codec.encode_text(&request)?;
            message = message.with_property(DELAYED_NOTICE_REQUEST_KEY, header);
        }
        Ok(message)
    }
}

fn notice_message(command: &NoticeCommand, kind: CommandKind) -> OutboundMessage {
    let mut message = OutboundMessage::new(
        wire_topic(&command.topic, kind),
        &command.tag,
        command.body.clone(),
    );
    message.properties = command.wire_properties();
    message.with_property(COMMAND_KIND_KEY, kind.as_str())
}

async fn send_routed(
    producer: &dyn Producer,
    mut message: OutboundMessage,
    order_key: Option<&str>,
) -> Result<NoticeResult> {
    if let Some(key) = order_key {
        let queues = producer.queue_count(&message.topic).await?;
        message.queue = Some(select_queue(key, queues));
    }
    send_notice(producer, message).await
}

async fn send_notice(producer: &dyn Producer, message: OutboundMessage) -> Result<NoticeResult> {
    let receipt = producer.send(message).await?;
    Ok(NoticeResult {
        id: receipt.message_id,
    })
}

fn settle_notice(promise: &Promise<NoticeResult>, outcome: Result<NoticeResult>) {
    match outcome {
        Ok(result) => promise.fulfill(result),
        Err(error) => promise.fail(error),
    };
}

fn failed<T: Clone + Send + Sync + 'static>(error: CourierError) -> Promise<T> {
    let promise = Promise::new();
    promise.fail(error);
    promise
}

/// Stable queue for an order key, independent of process and platform.
pub fn select_queue(order_key: &str, queues: usize) -> usize {
    if queues <= 1 {
        return 0;
    }
    let digest = Sha256::digest(order_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let queues = queues as u64;
    usize::try_from(u64::from_be_bytes(prefix) % queues).unwrap_or(0)
}

fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn startup_error(component: &'static str, error: BrokerError) -> CourierError {
    match error.connectivity() {
        Some(connectivity) => CourierError::Connectivity(connectivity),
        None => CourierError::Startup {
            component,
            reason: error.to_string(),
        },
    }
}

async fn stop_components(state: &mut CallerState) {
    if let Some(consumer) = state.response_consumer.take() {
        consumer.shutdown().await;
    }
    if let Some(producer) = state.producer.take() {
        producer.shutdown().await;
    }
}

/// Resolves pending invokes from responses on the private response topic.
struct ResponseListener {
    table: CorrelationTable,
    codec: Arc<dyn Codec>,
}

#[async_trait]
impl MessageListener for ResponseListener {
    async fn consume(&self, message: &DeliveredMessage) -> ConsumeStatus {
        let response: InvokeResponse = match self.codec.decode(&message.body) {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    error = %error,
                    "Dropping undecodable invoke response"
                );
                return ConsumeStatus::Success;
            }
        };

        let result = match response.error_detail {
            Some(detail) => Err(CourierError::Execution { detail }),
            None => Ok(InvokeResult {
                body: response.body.unwrap_or_default(),
                trace_nos: response.trace_nos,
            }),
        };
        if !self.table.settle(&response.request_id, result) {
            tracing::trace!(
                request_id = %response.request_id,
                "No pending invoke for response; dropped"
            );
        }
        ConsumeStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, InMemoryBrokerOptions};
    use crate::error::{ConnectivityError, ErrorKind};

    fn caller(broker: &InMemoryBroker) -> Caller {
        Caller::new(CallerOptions::new("caller"), Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn commands_fail_fast_before_start() {
        let broker = InMemoryBroker::new();
        let caller = caller(&broker);

        let error = caller
            .invoke(InvokeCommand::new("echo", "m", "x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(error, CourierError::NotStarted { component: "caller" });
        assert!(caller.correlation_table().is_empty());

        let error = caller
            .notice(NoticeCommand::new("audit", "x", "y"), None)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Lifecycle);
    }

    #[tokio::test]
    async fn start_without_name_server_is_a_connectivity_error() {
        let broker = InMemoryBroker::with_options(InMemoryBrokerOptions {
            name_server: None,
            ..InMemoryBrokerOptions::default()
        });
        let caller = caller(&broker);
        let error = caller.start().await.unwrap_err();
        assert_eq!(
            error,
            CourierError::Connectivity(ConnectivityError::NoNameServerAddress)
        );
        assert_eq!(caller.lifecycle().await, Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn start_without_route_is_a_connectivity_error_and_rolls_back() {
        let broker = InMemoryBroker::with_options(InMemoryBrokerOptions {
            auto_create_topics: false,
            ..InMemoryBrokerOptions::default()
        });
        let caller = caller(&broker);
        let error = caller.start().await.unwrap_err();
        assert_eq!(
            error,
            CourierError::Connectivity(ConnectivityError::NoRouteInfo {
                topic: "caller_resp".into()
            })
        );
        assert!(broker.active_consumer_groups().is_empty());
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let broker = InMemoryBroker::new();
        let caller = caller(&broker);
        caller.start().await.unwrap();
        caller.start().await.unwrap();
        assert_eq!(caller.lifecycle().await, Lifecycle::Running);
        assert_eq!(
            broker.active_consumer_groups(),
            vec!["CONSUMER_caller_CALLER_INVOKE"]
        );

        caller.shutdown().await;
        caller.shutdown().await;
        assert_eq!(caller.lifecycle().await, Lifecycle::Stopped);
        assert!(broker.active_consumer_groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_invoke_times_out_and_leaves_no_entry() {
        let broker = InMemoryBroker::new();
        let caller = caller(&broker);
        caller.start().await.unwrap();

        let error = caller
            .invoke(InvokeCommand::new("nobody", "m", "x"), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            CourierError::Timeout {
                topic: "nobody".into(),
                tag: "m".into(),
                timeout_ms: 3_000
            }
        );
        assert!(caller.correlation_table().is_empty());
    }

    #[tokio::test]
    async fn rejected_send_fails_the_promise() {
        let broker = InMemoryBroker::new();
        broker.reject_sends_to("echo_invoke", "disk full");
        let caller = caller(&broker);
        caller.start().await.unwrap();

        let error = caller
            .invoke(InvokeCommand::new("echo", "m", "x"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Send);
        assert!(caller.correlation_table().is_empty());
    }

    #[tokio::test]
    async fn async_notice_resolves_with_broker_message_id() {
        let broker = InMemoryBroker::new();
        let caller = caller(&broker);
        caller.start().await.unwrap();

        let result = caller
            .async_notice(NoticeCommand::new("audit", "x", "y"), Some("key".into()))
            .result()
            .await
            .unwrap();
        assert!(!result.id.is_empty());
        assert_eq!(broker.topic_queue_count("audit_orderednotice"), Some(4));
    }

    #[test]
    fn order_keys_map_to_stable_queues() {
        let first = select_queue("customer-42", 8);
        for _ in 0..10 {
            assert_eq!(select_queue("customer-42", 8), first);
        }
        assert!(first < 8);
        assert_eq!(select_queue("anything", 1), 0);
        assert_eq!(select_queue("anything", 0), 0);
    }

    #[test]
    fn delayed_messages_carry_level_and_exact_target() {
        let broker = InMemoryBroker::new();
        let caller = caller(&broker);
        let command = NoticeCommand::new("billing.v1", "charge", "{}");

        let exact = caller
            .delayed_message(&command, Duration::from_secs(10), 1_000)
            .unwrap();
        assert_eq!(exact.topic, "billing_v1_notice");
        assert_eq!(exact.delay_level, Some(3));
        assert!(!exact.properties.contains_key(DELAYED_NOTICE_REQUEST_KEY));
        assert_eq!(
            exact.properties.get(COMMAND_KIND_KEY).map(String::as_str),
            Some("delayed_notice")
        );

        let coarse = caller
            .delayed_message(&command, Duration::from_secs(45), 1_000)
            .unwrap();
        assert_eq!(coarse.delay_level, Some(4));
        let header: DelayedNoticeRequest = caller
            .codec()
            .decode_text(&coarse.properties[DELAYED_NOTICE_REQUEST_KEY])
            .unwrap();
        assert_eq!(header.target_execute_time, 46_000);

        let tiny = caller
            .delayed_message(&command, Duration::from_millis(300), 1_000)
            .unwrap();
        assert_eq!(tiny.delay_level, None);
        assert!(tiny.properties.contains_key(DELAYED_NOTICE_REQUEST_KEY));
    }
}
