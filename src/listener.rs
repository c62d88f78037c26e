//! Per-consumer-group dispatch of delivered messages to registered handlers.

use crate::broker::{ConsumeStatus, DeliveredMessage, MessageListener, OutboundMessage, Producer};
use crate::clock;
use crate::codec::Codec;
use crate::command::{ext_params_of, trace_nos_of};
use crate::handler::{HandlerParams, HandlerResult};
use crate::protocol::{
    default_delay_levels, delay_level_for, logical_topic, CommandKind, DelayedNoticeRequest,
    InvokeRequest, InvokeResponse, COMMAND_KIND_KEY, DELAYED_NOTICE_REQUEST_KEY,
    INVOKE_REQUEST_KEY,
};
use crate::routing::{Route, RoutingTable};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Listener attached to one of the client's consumer groups.
///
/// Routing misses and unsupported kinds are acknowledged so unroutable
/// traffic is never redelivered. Invoke failures travel back to the caller
/// inside the response; notice failures ask the broker for redelivery.
pub struct DispatchListener {
    kind: CommandKind,
    routing: Arc<RoutingTable>,
    codec: Arc<dyn Codec>,
    producer: Arc<dyn Producer>,
    begin_executable_time: Option<i64>,
    delay_levels: Vec<Duration>,
}

impl DispatchListener {
    pub fn new(
        kind: CommandKind,
        routing: Arc<RoutingTable>,
        codec: Arc<dyn Codec>,
        producer: Arc<dyn Producer>,
    ) -> Self {
        Self {
            kind,
            routing,
            codec,
            producer,
            begin_executable_time: None,
            delay_levels: default_delay_levels(),
        }
    }

    /// Skip messages submitted before `at` (epoch millis).
    #[must_use]
    pub fn with_begin_executable_time(mut self, at: Option<i64>) -> Self {
        self.begin_executable_time = at;
        self
    }

    #[must_use]
    pub fn with_delay_levels(mut self, delay_levels: Vec<Duration>) -> Self {
        self.delay_levels = delay_levels;
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    fn accepts_kind(&self, message: &DeliveredMessage) -> bool {
        let carried = message
            .property(COMMAND_KIND_KEY)
            .and_then(CommandKind::parse);
        match self.kind {
            CommandKind::Notice => carried != Some(CommandKind::DelayedNotice),
            CommandKind::DelayedNotice => carried == Some(CommandKind::DelayedNotice),
            CommandKind::Invoke | CommandKind::OrderedNotice => true,
        }
    }

    fn resolve(&self, message: &DeliveredMessage) -> Option<Arc<Route>> {
        let topic = logical_topic(&message.topic, self.kind);
        if let Some(route) = self.routing.resolve(topic, &message.tag, self.kind) {
            return Some(Arc::clone(route));
        }
        if self.routing.lookup(topic, &message.tag).is_some() {
            tracing::warn!(
                kind = %self.kind,
                topic = %message.topic,
                tag = %message.tag,
                message_id = %message.message_id,
                "Handler does not accept this command kind; message acknowledged"
            );
        } else {
            tracing::error!(
                kind = %self.kind,
                topic = %message.topic,
                tag = %message.tag,
                message_id = %message.message_id,
                "No handler registered; message acknowledged"
            );
        }
        None
    }

    fn params(&self, message: &DeliveredMessage, issued_at: i64) -> HandlerParams {
        HandlerParams {
            topic: logical_topic(&message.topic, self.kind).to_string(),
            tag: message.tag.clone(),
            kind: self.kind,
            body: message.body.clone(),
            trace_nos: trace_nos_of(message),
            ext_params: ext_params_of(message),
            message_id: message.message_id.clone(),
            issued_at,
            reconsume_times: message.reconsume_times,
        }
    }

    async fn consume_invoke(&self, route: &Route, message: &DeliveredMessage) -> ConsumeStatus {
        let request = match message
            .property(INVOKE_REQUEST_KEY)
            .map(|header| self.codec.decode_text::<InvokeRequest>(header))
        {
            Some(Ok(request)) => request,
            Some(Err(error)) => {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %error,
                    "Malformed invoke request header; message acknowledged"
                );
                return ConsumeStatus::Success;
            }
            None => {
                tracing::error!(
                    message_id = %message.message_id,
                    "Invoke message without request header; message acknowledged"
                );
                return ConsumeStatus::Success;
            }
        };

        let now = clock::now_millis();
        if request.is_expired_at(now) {
            tracing::warn!(
                request_id = %request.request_id,
                topic = %message.topic,
                tag = %message.tag,
                overdue_ms = now - request.deadline,
                "Invoke request past its deadline; skipping execution"
            );
            return ConsumeStatus::Success;
        }

        let params = self.params(message, request.issue_time);
        let request_trace_nos = params.trace_nos.clone();
        let response = match run_handler(route, params).await {
            Ok(result) => {
                let trace_nos = if result.trace_nos.is_empty() {
                    request_trace_nos
                } else {
                    result.trace_nos
                };
                InvokeResponse::success(&request, result.body, clock::now_millis())
                    .with_trace_nos(trace_nos)
            }
            Err(error) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    topic = %message.topic,
                    tag = %message.tag,
                    error = %error,
                    "Invoke handler failed"
                );
                InvokeResponse::failure(&request, format!("{error:#}"), clock::now_millis())
                    .with_trace_nos(request_trace_nos)
            }
        };

        if request.is_expired_at(response.response_time) {
            tracing::warn!(
                request_id = %request.request_id,
                elapsed_ms = response.response_time - request.issue_time,
                "Invoke finished after its deadline; response dropped"
            );
            return ConsumeStatus::Success;
        }

        let body = match self.codec.encode(&response) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(
                    request_id = %request.request_id,
                    error = %error,
                    "Failed to encode invoke response"
                );
                return ConsumeStatus::Success;
            }
        };
        let reply = OutboundMessage::new(&request.response_topic, &request.response_tag, body);
        if let Err(error) = self.producer.send(reply).await {
            tracing::error!(
                request_id = %request.request_id,
                response_topic = %request.response_topic,
                error = %error,
                "Failed to publish invoke response"
            );
        }
        ConsumeStatus::Success
    }

    async fn consume_notice(&self, route: &Route, message: &DeliveredMessage) -> ConsumeStatus {
        match run_handler(route, self.params(message, message.born_at)).await {
            Ok(_) => ConsumeStatus::Success,
            Err(error) => {
                tracing::warn!(
                    kind = %self.kind,
                    topic = %message.topic,
                    tag = %message.tag,
                    message_id = %message.message_id,
                    reconsume_times = message.reconsume_times,
                    error = %error,
                    "Notice handler failed; requesting redelivery"
                );
                ConsumeStatus::Retry
            }
        }
    }

    /// Delay levels are coarse. A delayed notice that arrives before its target
    /// time goes back to the broker with the best remaining level, or waits out
    /// a remainder shorter than the smallest level.
    async fn consume_delayed(&self, route: &Route, message: &DeliveredMessage) -> ConsumeStatus {
        if let Some(header) = message.property(DELAYED_NOTICE_REQUEST_KEY) {
            match self.codec.decode_text::<DelayedNoticeRequest>(header) {
                Ok(request) => {
                    let remaining = request.target_execute_time - clock::now_millis();
                    if remaining > 0 {
                        let remaining = Duration::from_millis(remaining.unsigned_abs());
                        if let Some(level) = delay_level_for(remaining, &self.delay_levels) {
                            return self.redefer(message, level.level).await;
                        }
                        tokio::time::sleep(remaining).await;
                    }
                }
                Err(error) => tracing::warn!(
                    message_id = %message.message_id,
                    error = %error,
                    "Malformed delayed notice header; executing now"
                ),
            }
        }
        self.consume_notice(route, message).await
    }

    async fn redefer(&self, message: &DeliveredMessage, level: u8) -> ConsumeStatus {
        let mut again = OutboundMessage::new(&message.topic, &message.tag, message.body.clone())
            .with_delay_level(level);
        again.properties = message.properties.clone();
        match self.producer.send(again).await {
            Ok(receipt) => {
                tracing::debug!(
                    message_id = %message.message_id,
                    redeferred_as = %receipt.message_id,
                    level,
                    "Delayed notice arrived early; deferred again"
                );
                ConsumeStatus::Success
            }
            Err(error) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    error = %error,
                    "Failed to defer early delayed notice"
                );
                ConsumeStatus::Retry
            }
        }
    }
}

#[async_trait]
impl MessageListener for DispatchListener {
    async fn consume(&self, message: &DeliveredMessage) -> ConsumeStatus {
        if let Some(begin) = self.begin_executable_time {
            if message.born_at < begin {
                tracing::debug!(
                    kind = %self.kind,
                    message_id = %message.message_id,
                    born_at = message.born_at,
                    begin_executable_time = begin,
                    "Message predates begin executable time; skipped"
                );
                return ConsumeStatus::Success;
            }
        }
        if !self.accepts_kind(message) {
            tracing::trace!(
                kind = %self.kind,
                topic = %message.topic,
                tag = %message.tag,
                message_id = %message.message_id,
                "Message belongs to another command kind; skipped"
            );
            return ConsumeStatus::Success;
        }
        let Some(route) = self.resolve(message) else {
            return ConsumeStatus::Success;
        };

        tracing::debug!(
            kind = %self.kind,
            topic = %message.topic,
            tag = %message.tag,
            message_id = %message.message_id,
            "Dispatching message"
        );
        match self.kind {
            CommandKind::Invoke => self.consume_invoke(&route, message).await,
            CommandKind::Notice | CommandKind::OrderedNotice => {
                self.consume_notice(&route, message).await
            }
            CommandKind::DelayedNotice => self.consume_delayed(&route, message).await,
        }
    }
}

async fn run_handler(route: &Route, params: HandlerParams) -> anyhow::Result<HandlerResult> {
    match AssertUnwindSafe(route.handler.handle(params))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SendReceipt;
    use crate::codec::default_codec;
    use crate::error::BrokerError;
    use crate::handler::{handler_fn, HandlerRegistration};
    use crate::protocol::{wire_topic, Capabilities, TRACE_NOS_KEY};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingProducer {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl Producer for RecordingProducer {
        fn group(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: OutboundMessage) -> Result<SendReceipt, BrokerError> {
            let receipt = SendReceipt {
                message_id: format!("sent-{}", self.sent.lock().len()),
                topic: message.topic.clone(),
                queue: 0,
            };
            self.sent.lock().push(message);
            Ok(receipt)
        }

        async fn queue_count(&self, _topic: &str) -> Result<usize, BrokerError> {
            Ok(1)
        }

        async fn shutdown(&self) {}
    }

    struct Fixture {
        calls: Arc<AtomicUsize>,
        producer: Arc<RecordingProducer>,
    }

    impl Fixture {
        fn listener(&self, kind: CommandKind, fail: bool) -> DispatchListener {
            let calls = Arc::clone(&self.calls);
            let handler = handler_fn(move |params: HandlerParams| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        anyhow::bail!("handler exploded");
                    }
                    Ok(HandlerResult::body(params.body))
                }
            });
            let routing = RoutingTable::build(&[HandlerRegistration::new(
                "echo",
                "m",
                Capabilities::ALL,
                handler,
            )]);
            DispatchListener::new(
                kind,
                Arc::new(routing),
                default_codec(),
                self.producer.clone(),
            )
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            calls: Arc::new(AtomicUsize::new(0)),
            producer: Arc::new(RecordingProducer::default()),
        }
    }

    fn message(
        kind: CommandKind,
        tag: &str,
        properties: BTreeMap<String, String>,
    ) -> DeliveredMessage {
        DeliveredMessage {
            message_id: "msg-1".into(),
            topic: wire_topic("echo", kind),
            tag: tag.into(),
            body: b"ping".to_vec(),
            properties,
            queue: 0,
            born_at: clock::now_millis(),
            reconsume_times: 0,
        }
    }

    fn invoke_message(deadline: i64) -> DeliveredMessage {
        let request = InvokeRequest {
            request_id: "req-1".into(),
            issue_time: deadline - 1_000,
            deadline,
            response_topic: "caller_resp".into(),
            response_tag: "m_resp".into(),
        };
        let header = default_codec().encode_text(&request).unwrap();
        message(
            CommandKind::Invoke,
            "m",
            BTreeMap::from([
                (INVOKE_REQUEST_KEY.to_string(), header),
                (TRACE_NOS_KEY.to_string(), r#"["t-1"]"#.to_string()),
            ]),
        )
    }

    #[tokio::test]
    async fn expired_invoke_never_reaches_the_handler() {
        let fixture = fixture();
        let listener = fixture.listener(CommandKind::Invoke, false);

        let status = listener
            .consume(&invoke_message(clock::now_millis() - 5_000))
            .await;

        assert_eq!(status, ConsumeStatus::Success);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert!(fixture.producer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn invoke_replies_to_the_callers_response_topic() {
        let fixture = fixture();
        let listener = fixture.listener(CommandKind::Invoke, false);

        let status = listener
            .consume(&invoke_message(clock::now_millis() + 60_000))
            .await;
        assert_eq!(status, ConsumeStatus::Success);

        let sent = fixture.producer.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "caller_resp");
        assert_eq!(sent[0].tag, "m_resp");
        let response: InvokeResponse = default_codec().decode(&sent[0].body).unwrap();
        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.body.as_deref(), Some(&b"ping"[..]));
        assert_eq!(response.trace_nos, vec!["t-1"]);
    }

    #[tokio::test]
    async fn invoke_handler_errors_become_error_responses() {
        let fixture = fixture();
        let listener = fixture.listener(CommandKind::Invoke, true);

        let status = listener
            .consume(&invoke_message(clock::now_millis() + 60_000))
            .await;
        assert_eq!(status, ConsumeStatus::Success);

        let sent = fixture.producer.sent.lock().clone();
        let response: InvokeResponse = default_codec().decode(&sent[0].body).unwrap();
        assert!(response.body.is_none());
        assert!(response
            .error_detail
            .unwrap()
            .contains("handler exploded"));
    }

    #[tokio::test]
    async fn notice_failures_request_redelivery() {
        let fixture = fixture();
        let listener = fixture.listener(CommandKind::Notice, true);
        let status = listener
            .consume(&message(CommandKind::Notice, "m", BTreeMap::new()))
            .await;
        assert_eq!(status, ConsumeStatus::Retry);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn routing_misses_are_acknowledged() {
        let fixture = fixture();
        let listener = fixture.listener(CommandKind::OrderedNotice, true);
        let status = listener
            .consume(&message(CommandKind::OrderedNotice, "unknown", BTreeMap::new()))
            .await;
        assert_eq!(status, ConsumeStatus::Success);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn messages_before_begin_time_are_skipped() {
        let fixture = fixture();
        let listener = fixture
            .listener(CommandKind::Notice, true)
            .with_begin_executable_time(Some(clock::now_millis() + 60_000));
        let status = listener
            .consume(&message(CommandKind::Notice, "m", BTreeMap::new()))
            .await;
        assert_eq!(status, ConsumeStatus::Success);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn notice_and_delayed_groups_split_the_shared_topic() {
        let fixture = fixture();
        let delayed_props = BTreeMap::from([(
            COMMAND_KIND_KEY.to_string(),
            CommandKind::DelayedNotice.as_str().to_string(),
        )]);

        let notice = fixture.listener(CommandKind::Notice, false);
        notice
            .consume(&message(CommandKind::Notice, "m", delayed_props.clone()))
            .await;
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);

        let delayed = fixture.listener(CommandKind::DelayedNotice, false);
        delayed
            .consume(&message(CommandKind::DelayedNotice, "m", BTreeMap::new()))
            .await;
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);

        delayed
            .consume(&message(CommandKind::DelayedNotice, "m", delayed_props))
            .await;
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn early_delayed_notice_is_deferred_again() {
        let fixture = fixture();
        let listener = fixture.listener(CommandKind::DelayedNotice, false);
        let target = DelayedNoticeRequest {
            target_execute_time: clock::now_millis() + 45_000,
        };
        let properties = BTreeMap::from([
            (
                COMMAND_KIND_KEY.to_string(),
                CommandKind::DelayedNotice.as_str().to_string(),
            ),
            (
                DELAYED_NOTICE_REQUEST_KEY.to_string(),
                default_codec().encode_text(&target).unwrap(),
            ),
        ]);

        let status = listener
            .consume(&message(CommandKind::DelayedNotice, "m", properties.clone()))
            .await;

        assert_eq!(status, ConsumeStatus::Success);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        let sent = fixture.producer.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].delay_level, Some(4));
        assert_eq!(sent[0].properties, properties);
    }

    #[tokio::test(start_paused = true)]
    async fn short_remainder_is_waited_out_locally() {
        let fixture = fixture();
        let listener = fixture.listener(CommandKind::DelayedNotice, false);
        let start = clock::now_millis();
        let target = DelayedNoticeRequest {
            target_execute_time: start + 600,
        };
        let properties = BTreeMap::from([
            (
                COMMAND_KIND_KEY.to_string(),
                CommandKind::DelayedNotice.as_str().to_string(),
            ),
            (
                DELAYED_NOTICE_REQUEST_KEY.to_string(),
                default_codec().encode_text(&target).unwrap(),
            ),
        ]);

        listener
            .consume(&message(CommandKind::DelayedNotice, "m", properties))
            .await;

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert!(clock::now_millis() >= start + 600);
        assert!(fixture.producer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn panicking_handlers_are_contained() {
        let handler = handler_fn(|_params: HandlerParams| async move {
            if true {
                panic!("kaboom");
            }
            Ok(HandlerResult::empty())
        });
        let routing = RoutingTable::build(&[HandlerRegistration::notice("echo", "m", handler)]);
        let listener = DispatchListener::new(
            CommandKind::Notice,
            Arc::new(routing),
            default_codec(),
            Arc::new(RecordingProducer::default()),
        );
        let status = listener
            .consume(&message(CommandKind::Notice, "m", BTreeMap::new()))
            .await;
        assert_eq!(status, ConsumeStatus::Retry);
    }
}
