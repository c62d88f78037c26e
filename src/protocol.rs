//! Wire-level naming and header types shared by callers and handlers.
//!
//! Topic layout, per command kind:
//!
//! ```text
//! invoke          <sanitized topic>_invoke
//! notice          <sanitized topic>_notice     (also delayed notices)
//! ordered notice  <sanitized topic>_orderednotice
//! response        <group name>_resp            tag: <tag>_resp
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const INVOKE_TOPIC_SUFFIX: &str = "_invoke";
pub const NOTICE_TOPIC_SUFFIX: &str = "_notice";
pub const ORDERED_NOTICE_TOPIC_SUFFIX: &str = "_orderednotice";
pub const RESPONSE_TOPIC_SUFFIX: &str = "_resp";
pub const RESPONSE_TAG_SUFFIX: &str = "_resp";

pub const PRODUCER_PREFIX: &str = "PRODUCER_";
pub const CONSUMER_PREFIX: &str = "CONSUMER_";
pub const RESPONSE_CONSUMER_SUFFIX: &str = "_CALLER_INVOKE";

/// Subscribes a consumer group to every tag of a topic.
pub const ALL_TAGS: &str = "*";
/// Separator used when a consumer subscribes to several tags of one topic.
pub const TAG_SEPARATOR: &str = "||";
/// Tag of the no-op handler injected on every active topic.
pub const PROBE_TAG: &str = "COURIER_CLIENT_PROBE";

/// Message property carrying an encoded [`InvokeRequest`].
pub const INVOKE_REQUEST_KEY: &str = "COURIER_INVOKE_REQUEST";
/// Message property carrying an encoded [`DelayedNoticeRequest`].
pub const DELAYED_NOTICE_REQUEST_KEY: &str = "COURIER_DELAY_NOTICE_REQUEST";
/// Message property carrying `|`-separated trace numbers.
pub const TRACE_NOS_KEY: &str = "COURIER_TRACE_NOS";
/// Prefix for command extension parameters stored as message properties.
pub const EXT_PARAM_PREFIX: &str = "COURIER_EXT_";
/// Message property naming the [`CommandKind`] of a command. Notices and
/// delayed notices share a topic and are told apart by it.
pub const COMMAND_KIND_KEY: &str = "COURIER_COMMAND_KIND";

/// The four application-level command patterns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Invoke,
    Notice,
    DelayedNotice,
    OrderedNotice,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        CommandKind::Invoke,
        CommandKind::Notice,
        CommandKind::DelayedNotice,
        CommandKind::OrderedNotice,
    ];

    /// Topic suffix used on the wire. Delayed notices share the notice topic.
    pub fn topic_suffix(self) -> &'static str {
        match self {
            Self::Invoke => INVOKE_TOPIC_SUFFIX,
            Self::Notice | Self::DelayedNotice => NOTICE_TOPIC_SUFFIX,
            Self::OrderedNotice => ORDERED_NOTICE_TOPIC_SUFFIX,
        }
    }

    /// Suffix appended to the consumer group name of this kind.
    pub fn consumer_suffix(self) -> &'static str {
        match self {
            Self::Invoke => "_INVOKE",
            Self::Notice => "_NOTICE",
            Self::DelayedNotice => "_DELAY_NOTICE",
            Self::OrderedNotice => "_ORDERED_NOTICE",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invoke => "invoke",
            Self::Notice => "notice",
            Self::DelayedNotice => "delayed_notice",
            Self::OrderedNotice => "ordered_notice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    fn bit(self) -> u8 {
        match self {
            Self::Invoke => 0b0001,
            Self::Notice => 0b0010,
            Self::DelayedNotice => 0b0100,
            Self::OrderedNotice => 0b1000,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of command kinds a handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const INVOKE: Capabilities = Capabilities(0b0001);
    pub const NOTICE: Capabilities = Capabilities(0b0010);
    pub const DELAYED_NOTICE: Capabilities = Capabilities(0b0100);
    pub const ORDERED_NOTICE: Capabilities = Capabilities(0b1000);
    pub const ALL_NOTICES: Capabilities = Capabilities(0b1110);
    pub const ALL: Capabilities = Capabilities(0b1111);

    pub fn of(kinds: &[CommandKind]) -> Self {
        kinds
            .iter()
            .fold(Self::NONE, |caps, kind| caps.with(*kind))
    }

    #[must_use]
    pub fn with(self, kind: CommandKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn supports(self, kind: CommandKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn kinds(self) -> impl Iterator<Item = CommandKind> {
        CommandKind::ALL
            .into_iter()
            .filter(move |kind| self.supports(*kind))
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        Capabilities(self.0 | rhs.0)
    }
}

/// Broker topic names only allow a restricted character set.
pub fn sanitize_topic(topic: &str) -> String {
    topic.replace('.', "_").replace('$', "-")
}

/// Wire topic for a logical (application supplied) topic and command kind.
pub fn wire_topic(topic: &str, kind: CommandKind) -> String {
    format!("{}{}", sanitize_topic(topic), kind.topic_suffix())
}

/// Recover the sanitized logical topic from a wire topic.
pub fn logical_topic(wire_topic: &str, kind: CommandKind) -> &str {
    wire_topic
        .strip_suffix(kind.topic_suffix())
        .unwrap_or(wire_topic)
}

pub fn response_topic(group_name: &str) -> String {
    format!("{}{RESPONSE_TOPIC_SUFFIX}", sanitize_topic(group_name))
}

pub fn response_tag(tag: &str) -> String {
    format!("{tag}{RESPONSE_TAG_SUFFIX}")
}

pub fn producer_group(group_name: &str) -> String {
    format!("{PRODUCER_PREFIX}{group_name}")
}

pub fn consumer_group(group_name: &str, kind: CommandKind) -> String {
    format!("{CONSUMER_PREFIX}{group_name}{}", kind.consumer_suffix())
}

pub fn response_consumer_group(group_name: &str) -> String {
    format!("{CONSUMER_PREFIX}{group_name}{RESPONSE_CONSUMER_SUFFIX}")
}

/// Subscription expression for a set of tags: `*` wins over explicit tags.
pub fn tag_expression<'a>(tags: impl IntoIterator<Item = &'a str>) -> String {
    let tags: Vec<&str> = tags.into_iter().collect();
    if tags.iter().any(|tag| *tag == ALL_TAGS) || tags.is_empty() {
        return ALL_TAGS.to_string();
    }
    tags.join(TAG_SEPARATOR)
}

/// Does `tag` match a subscription expression built by [`tag_expression`]?
pub fn tag_matches(expression: &str, tag: &str) -> bool {
    let expression = expression.trim();
    expression.is_empty()
        || expression == ALL_TAGS
        || expression
            .split(TAG_SEPARATOR)
            .any(|candidate| candidate.trim() == tag)
}

/// Header attached to every invoke request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub request_id: String,
    pub issue_time: i64,
    pub deadline: i64,
    pub response_topic: String,
    pub response_tag: String,
}

impl InvokeRequest {
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis > self.deadline
    }
}

/// Body of a response message. Exactly one of `body` / `error_detail` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace_nos: Vec<String>,
    pub issue_time: i64,
    pub response_time: i64,
}

impl InvokeResponse {
    pub fn success(request: &InvokeRequest, body: Vec<u8>, response_time: i64) -> Self {
        Self {
            request_id: request.request_id.clone(),
            body: Some(body),
            error_detail: None,
            trace_nos: Vec::new(),
            issue_time: request.issue_time,
            response_time,
        }
    }

    pub fn failure(request: &InvokeRequest, detail: String, response_time: i64) -> Self {
        Self {
            request_id: request.request_id.clone(),
            body: None,
            error_detail: Some(detail),
            trace_nos: Vec::new(),
            issue_time: request.issue_time,
            response_time,
        }
    }

    #[must_use]
    pub fn with_trace_nos(mut self, trace_nos: Vec<String>) -> Self {
        self.trace_nos = trace_nos;
        self
    }
}

/// Exact execution instant for delayed notices whose delay level is coarser
/// than the requested delay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DelayedNoticeRequest {
    pub target_execute_time: i64,
}

/// Delay levels offered by the broker, in level order (level 1 first).
pub fn default_delay_levels() -> Vec<Duration> {
    [
        1, 5, 10, 30, 60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 1200, 1800, 3600, 7200,
    ]
    .into_iter()
    .map(Duration::from_secs)
    .collect()
}

/// Result of mapping a requested delay onto discrete broker levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayLevel {
    /// 1-based broker level.
    pub level: u8,
    pub duration: Duration,
    pub exact: bool,
}

/// Pick the largest level that does not exceed `delay`.
///
/// Returns `None` when the delay is shorter than the smallest level.
pub fn delay_level_for(delay: Duration, levels: &[Duration]) -> Option<DelayLevel> {
    levels
        .iter()
        .enumerate()
        .filter(|(_, level)| **level <= delay)
        .max_by_key(|(_, level)| **level)
        .and_then(|(index, duration)| {
            let level = u8::try_from(index + 1).ok()?;
            Some(DelayLevel {
                level,
                duration: *duration,
                exact: *duration == delay,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_dots_and_dollars() {
        assert_eq!(sanitize_topic("com.acme.Orders$Api"), "com_acme_Orders-Api");
        assert_eq!(sanitize_topic("plain"), "plain");
    }

    #[test]
    fn wire_topics_per_kind() {
        assert_eq!(wire_topic("a.b", CommandKind::Invoke), "a_b_invoke");
        assert_eq!(wire_topic("a.b", CommandKind::Notice), "a_b_notice");
        assert_eq!(wire_topic("a.b", CommandKind::DelayedNotice), "a_b_notice");
        assert_eq!(
            wire_topic("a.b", CommandKind::OrderedNotice),
            "a_b_orderednotice"
        );
    }

    #[test]
    fn logical_topic_strips_only_the_kind_suffix() {
        assert_eq!(logical_topic("a_b_invoke", CommandKind::Invoke), "a_b");
        assert_eq!(
            logical_topic("a_b_orderednotice", CommandKind::OrderedNotice),
            "a_b"
        );
        assert_eq!(logical_topic("a_b", CommandKind::Notice), "a_b");
    }

    #[test]
    fn group_names_follow_prefix_and_kind_suffix() {
        assert_eq!(producer_group("orders"), "PRODUCER_orders");
        assert_eq!(
            consumer_group("orders", CommandKind::OrderedNotice),
            "CONSUMER_orders_ORDERED_NOTICE"
        );
        assert_eq!(
            response_consumer_group("orders"),
            "CONSUMER_orders_CALLER_INVOKE"
        );
        assert_eq!(response_topic("orders.v2"), "orders_v2_resp");
        assert_eq!(response_tag("m"), "m_resp");
    }

    #[test]
    fn tag_expression_prefers_wildcard() {
        assert_eq!(tag_expression(["a", "b"]), "a||b");
        assert_eq!(tag_expression(["a", ALL_TAGS]), ALL_TAGS);
        assert!(tag_matches("a||b", "b"));
        assert!(!tag_matches("a||b", "c"));
        assert!(tag_matches(ALL_TAGS, "anything"));
    }

    #[test]
    fn kinds_parse_from_their_wire_name() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::parse("broadcast"), None);
    }

    #[test]
    fn capabilities_track_kinds() {
        let caps = Capabilities::INVOKE | Capabilities::ORDERED_NOTICE;
        assert!(caps.supports(CommandKind::Invoke));
        assert!(caps.supports(CommandKind::OrderedNotice));
        assert!(!caps.supports(CommandKind::Notice));
        assert_eq!(
            caps.kinds().collect::<Vec<_>>(),
            vec![CommandKind::Invoke, CommandKind::OrderedNotice]
        );
        assert_eq!(
            Capabilities::of(&[CommandKind::Notice, CommandKind::DelayedNotice]),
            Capabilities::NOTICE | Capabilities::DELAYED_NOTICE
        );
    }

    #[test]
    fn delay_level_mapping_floors_to_supported_levels() {
        let levels = default_delay_levels();

        let exact = delay_level_for(Duration::from_secs(10), &levels).unwrap();
        assert_eq!(exact.level, 3);
        assert!(exact.exact);

        let coarse = delay_level_for(Duration::from_secs(45), &levels).unwrap();
        assert_eq!(coarse.level, 4);
        assert_eq!(coarse.duration, Duration::from_secs(30));
        assert!(!coarse.exact);

        let capped = delay_level_for(Duration::from_secs(10_000), &levels).unwrap();
        assert_eq!(capped.level, 18);
        assert!(!capped.exact);

        assert!(delay_level_for(Duration::from_millis(500), &levels).is_none());
    }

    #[test]
    fn invoke_request_expiry_is_strict() {
        let request = InvokeRequest {
            request_id: "r".into(),
            issue_time: 0,
            deadline: 100,
            response_topic: "g_resp".into(),
            response_tag: "m_resp".into(),
        };
        assert!(!request.is_expired_at(100));
        assert!(request.is_expired_at(101));
    }
}
