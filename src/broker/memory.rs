use super::{
    Broker, ConsumeMode, ConsumeStatus, Consumer, ConsumerSpec, DeliveredMessage,
    MessageListener, OutboundMessage, Producer, SendReceipt,
};
use crate::clock;
use crate::error::BrokerError;
use crate::protocol::{default_delay_levels, tag_matches};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Construction options for [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryBrokerOptions {
    /// `None` behaves like a client with no name server address configured.
    pub name_server: Option<String>,
    pub default_queue_count: usize,
    /// Redelivery `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    /// When false, unknown topics fail with `NoRouteInfo`.
    pub auto_create_topics: bool,
    pub max_dead_letters: usize,
}

impl Default for InMemoryBrokerOptions {
    fn default() -> Self {
        Self {
            name_server: Some("127.0.0.1:9876".to_string()),
            default_queue_count: 4,
            retry_backoff: Duration::from_secs(1),
            auto_create_topics: true,
            max_dead_letters: 256,
        }
    }
}

/// Message that exhausted its redelivery budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub group: String,
    pub message: DeliveredMessage,
    pub reason: String,
}

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InMemoryBrokerStats {
    pub sent_total: u64,
    /// Fan-out count: one per consumer group a message was handed to.
    pub delivered_total: u64,
    pub redelivered_total: u64,
    /// Messages no running consumer group subscribed to.
    pub undeliverable_total: u64,
    pub dead_letters_total: u64,
    pub dead_letter_evictions_total: u64,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, usize>,
    groups: HashMap<String, Arc<GroupRuntime>>,
    rejected_groups: HashMap<String, String>,
    rejected_topics: HashMap<String, String>,
    dead_letters: VecDeque<DeadLetter>,
    stats: InMemoryBrokerStats,
}

struct Shared {
    options: InMemoryBrokerOptions,
    delay_levels: Vec<Duration>,
    state: Mutex<BrokerState>,
}

/// In-process broker with partitioned topics, tag filtering, per-group worker
/// pools, ordered queues, redelivery with dead-lettering and delay levels.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_options(InMemoryBrokerOptions::default())
    }

    pub fn with_options(mut options: InMemoryBrokerOptions) -> Self {
        if options.default_queue_count == 0 {
            options.default_queue_count = 1;
        }
        if options.max_dead_letters == 0 {
            options.max_dead_letters = 1;
        }
        Self {
            shared: Arc::new(Shared {
                options,
                delay_levels: default_delay_levels(),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    pub fn options(&self) -> &InMemoryBrokerOptions {
        &self.shared.options
    }

    /// Make every subsequent `subscribe` for `group` fail.
    pub fn reject_consumer_group(&self, group: impl Into<String>, reason: impl Into<String>) {
        self.shared
            .state
            .lock()
            .rejected_groups
            .insert(group.into(), reason.into());
    }

    /// Make every subsequent send to `topic` fail with `Rejected`.
    pub fn reject_sends_to(&self, topic: impl Into<String>, reason: impl Into<String>) {
        self.shared
            .state
            .lock()
            .rejected_topics
            .insert(topic.into(), reason.into());
    }

    pub fn clear_faults(&self) {
        let mut state = self.shared.state.lock();
        state.rejected_groups.clear();
        state.rejected_topics.clear();
    }

    /// Names of the consumer groups currently running, sorted.
    pub fn active_consumer_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.shared.state.lock().groups.keys().cloned().collect();
        groups.sort();
        groups
    }

    pub fn topic_queue_count(&self, topic: &str) -> Option<usize> {
        self.shared.state.lock().topics.get(topic).copied()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn stats(&self) -> InMemoryBrokerStats {
        self.shared.state.lock().stats
    }

    fn check_name_server(&self) -> Result<(), BrokerError> {
        match self.shared.options.name_server.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => Ok(()),
            _ => Err(BrokerError::NoNameServerAddress),
        }
    }

    fn route(&self, topic: &str) -> Result<usize, BrokerError> {
        let mut state = self.shared.state.lock();
        if let Some(reason) = state.rejected_topics.get(topic) {
            return Err(BrokerError::Rejected {
                topic: topic.to_string(),
                reason: reason.clone(),
            });
        }
        route_locked(&mut state, &self.shared.options, topic)
    }

    fn delay_for(&self, level: u8) -> Option<Duration> {
        let levels = &self.shared.delay_levels;
        let index = usize::from(level).min(levels.len());
        index.checked_sub(1).and_then(|index| levels.get(index)).copied()
    }

    fn schedule(&self, message: DeliveredMessage, delay: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.dispatch(message);
        });
    }

    fn dispatch(&self, message: DeliveredMessage) {
        let targets: Vec<Arc<GroupRuntime>> = {
            let mut state = self.shared.state.lock();
            let targets: Vec<_> = state
                .groups
                .values()
                .filter(|group| group.accepts(&message.topic, &message.tag))
                .cloned()
                .collect();
            if targets.is_empty() {
                state.stats.undeliverable_total += 1;
            } else {
                state.stats.delivered_total += targets.len() as u64;
            }
            targets
        };

        if targets.is_empty() {
            tracing::debug!(
                topic = %message.topic,
                tag = %message.tag,
                message_id = %message.message_id,
                "No consumer group subscribed; message dropped"
            );
            return;
        }

        for group in targets {
            group.deliver(message.clone());
        }
    }
}

fn route_locked(
    state: &mut BrokerState,
    options: &InMemoryBrokerOptions,
    topic: &str,
) -> Result<usize, BrokerError> {
    if let Some(queues) = state.topics.get(topic) {
        return Ok(*queues);
    }
    if !options.auto_create_topics {
        return Err(BrokerError::NoRouteInfo {
            topic: topic.to_string(),
        });
    }
    state
        .topics
        .insert(topic.to_string(), options.default_queue_count);
    Ok(options.default_queue_count)
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn create_producer(&self, group: &str) -> Result<Arc<dyn Producer>, BrokerError> {
        self.check_name_server()?;
        Ok(Arc::new(InMemoryProducer {
            group: group.to_string(),
            broker: self.clone(),
            next_queue: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_topic(&self, topic: &str, queues: usize) -> Result<(), BrokerError> {
        self.check_name_server()?;
        let queues = queues.max(1);
        let mut state = self.shared.state.lock();
        state.topics.entry(topic.to_string()).or_insert(queues);
        Ok(())
    }

    async fn subscribe(
        &self,
        spec: ConsumerSpec,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Arc<dyn Consumer>, BrokerError> {
        self.check_name_server()?;

        let mut state = self.shared.state.lock();
        if let Some(reason) = state.rejected_groups.get(&spec.group) {
            return Err(BrokerError::ConsumerStart {
                group: spec.group.clone(),
                reason: reason.clone(),
            });
        }
        if spec.threads == 0 {
            return Err(BrokerError::ConsumerStart {
                group: spec.group.clone(),
                reason: "thread count must be positive".to_string(),
            });
        }
        if state.groups.contains_key(&spec.group) {
            return Err(BrokerError::DuplicateConsumerGroup {
                group: spec.group.clone(),
            });
        }
        for topic in spec.subscriptions.keys() {
            route_locked(&mut state, &self.shared.options, topic)?;
        }

        let runtime = Arc::new(GroupRuntime {
            permits: Arc::new(Semaphore::new(spec.threads)),
            retry_backoff: self.shared.options.retry_backoff,
            cancel: CancellationToken::new(),
            lanes: Mutex::new(HashMap::new()),
            shared: Arc::downgrade(&self.shared),
            listener,
            spec,
        });
        state
            .groups
            .insert(runtime.spec.group.clone(), Arc::clone(&runtime));
        drop(state);

        tracing::info!(
            group = %runtime.spec.group,
            mode = ?runtime.spec.mode,
            threads = runtime.spec.threads,
            topics = runtime.spec.subscriptions.len(),
            "Consumer group started"
        );

        Ok(Arc::new(InMemoryConsumer {
            group: runtime.spec.group.clone(),
            shared: Arc::downgrade(&self.shared),
            runtime,
        }))
    }

    fn delay_levels(&self) -> Vec<Duration> {
        self.shared.delay_levels.clone()
    }
}

struct InMemoryProducer {
    group: String,
    broker: InMemoryBroker,
    next_queue: AtomicUsize,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for InMemoryProducer {
    fn group(&self) -> &str {
        &self.group
    }

    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Shutdown {
                component: format!("producer {}", self.group),
            });
        }
        self.broker.check_name_server()?;
        let queues = self.broker.route(&message.topic)?;
        let queue = match message.queue {
            Some(queue) if queue < queues => queue,
            Some(queue) => {
                return Err(BrokerError::NoSuchQueue {
                    topic: message.topic,
                    queue,
                    available: queues,
                })
            }
            None => self.next_queue.fetch_add(1, Ordering::Relaxed) % queues,
        };

        let delivered = DeliveredMessage {
            message_id: Uuid::new_v4().to_string(),
            topic: message.topic,
            tag: message.tag,
            body: message.body,
            properties: message.properties,
            queue,
            born_at: clock::now_millis(),
            reconsume_times: 0,
        };
        let receipt = SendReceipt {
            message_id: delivered.message_id.clone(),
            topic: delivered.topic.clone(),
            queue,
        };
        self.broker.shared.state.lock().stats.sent_total += 1;

        match message.delay_level.and_then(|level| self.broker.delay_for(level)) {
            Some(delay) => self.broker.schedule(delivered, delay),
            None => self.broker.dispatch(delivered),
        }
        Ok(receipt)
    }

    async fn queue_count(&self, topic: &str) -> Result<usize, BrokerError> {
        self.broker.check_name_server()?;
        self.broker.route(topic)
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(group = %self.group, "Producer shut down");
        }
    }
}

struct GroupRuntime {
    spec: ConsumerSpec,
    listener: Arc<dyn MessageListener>,
    permits: Arc<Semaphore>,
    retry_backoff: Duration,
    cancel: CancellationToken,
    lanes: Mutex<HashMap<(String, usize), mpsc::UnboundedSender<DeliveredMessage>>>,
    shared: Weak<Shared>,
}

impl GroupRuntime {
    fn accepts(&self, topic: &str, tag: &str) -> bool {
        !self.cancel.is_cancelled()
            && self
                .spec
                .subscriptions
                .get(topic)
                .is_some_and(|expression| tag_matches(expression, tag))
    }

    fn deliver(self: &Arc<Self>, message: DeliveredMessage) {
        match self.spec.mode {
            ConsumeMode::Orderly => self.enqueue_ordered(message),
            ConsumeMode::Concurrent | ConsumeMode::Broadcast => {
                let group = Arc::clone(self);
                tokio::spawn(async move { group.process(message).await });
            }
        }
    }

    fn enqueue_ordered(self: &Arc<Self>, message: DeliveredMessage) {
        let mut lanes = self.lanes.lock();
        let lane = lanes
            .entry((message.topic.clone(), message.queue))
            .or_insert_with(|| self.spawn_lane());
        if lane.send(message).is_err() {
            tracing::debug!(group = %self.spec.group, "Ordered lane closed; message dropped");
        }
    }

    fn spawn_lane(self: &Arc<Self>) -> mpsc::UnboundedSender<DeliveredMessage> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let group = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = group.cancel.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };
                group.process(message).await;
            }
        });
        sender
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            () = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }
    }

    /// Run the listener until it succeeds or the redelivery budget is spent.
    /// Ordered lanes call this inline, so a failing message blocks its queue.
    async fn process(&self, mut message: DeliveredMessage) {
        loop {
            let Some(permit) = self.acquire().await else {
                return;
            };
            let status = self.invoke_listener(&message).await;
            drop(permit);

            if status == ConsumeStatus::Success {
                return;
            }
            if message.reconsume_times >= self.spec.max_reconsume_times {
                self.dead_letter(message, "max reconsume times exceeded");
                return;
            }

            message.reconsume_times += 1;
            let backoff = self.retry_backoff * message.reconsume_times;
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }
            if let Some(shared) = self.shared.upgrade() {
                shared.state.lock().stats.redelivered_total += 1;
            }
            tracing::debug!(
                group = %self.spec.group,
                message_id = %message.message_id,
                attempt = message.reconsume_times,
                "Redelivering message"
            );
        }
    }

    async fn invoke_listener(&self, message: &DeliveredMessage) -> ConsumeStatus {
        let listener = Arc::clone(&self.listener);
        let delivered = message.clone();
        let mut task = tokio::spawn(async move { listener.consume(&delivered).await });

        match tokio::time::timeout(self.spec.consume_timeout, &mut task).await {
            Ok(Ok(status)) => status,
            Ok(Err(error)) => {
                tracing::warn!(
                    group = %self.spec.group,
                    message_id = %message.message_id,
                    error = %error,
                    "Listener aborted"
                );
                ConsumeStatus::Retry
            }
            Err(_) => {
                tracing::warn!(
                    group = %self.spec.group,
                    message_id = %message.message_id,
                    timeout_ms = u64::try_from(self.spec.consume_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "Consume timed out"
                );
                // An overrun keeps running in concurrent groups. An ordered
                // lane stops it first so runs of one queue never overlap.
                if self.spec.mode == ConsumeMode::Orderly {
                    task.abort();
                    let _ = task.await;
                }
                ConsumeStatus::Retry
            }
        }
    }

    fn dead_letter(&self, message: DeliveredMessage, reason: &str) {
        tracing::warn!(
            group = %self.spec.group,
            topic = %message.topic,
            message_id = %message.message_id,
            reconsume_times = message.reconsume_times,
            reason,
            "Message moved to dead letters"
        );
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        state.stats.dead_letters_total += 1;
        if state.dead_letters.len() >= shared.options.max_dead_letters {
            state.dead_letters.pop_front();
            state.stats.dead_letter_evictions_total += 1;
        }
        state.dead_letters.push_back(DeadLetter {
            group: self.spec.group.clone(),
            message,
            reason: reason.to_string(),
        });
    }
}

struct InMemoryConsumer {
    group: String,
    runtime: Arc<GroupRuntime>,
    shared: Weak<Shared>,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn group(&self) -> &str {
        &self.group
    }

    async fn shutdown(&self) {
        if self.runtime.cancel.is_cancelled() {
            return;
        }
        self.runtime.cancel.cancel();
        self.runtime.lanes.lock().clear();
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if state
                .groups
                .get(&self.group)
                .is_some_and(|running| Arc::ptr_eq(running, &self.runtime))
            {
                state.groups.remove(&self.group);
            }
        }
        tracing::info!(group = %self.group, "Consumer group shut down");
    }
}
