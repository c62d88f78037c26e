//! Application handlers and their registrations.

use crate::protocol::{Capabilities, CommandKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Everything a handler gets to see about one delivered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerParams {
    /// Sanitized logical topic.
    pub topic: String,
    pub tag: String,
    pub kind: CommandKind,
    pub body: Vec<u8>,
    pub trace_nos: Vec<String>,
    pub ext_params: BTreeMap<String, String>,
    pub message_id: String,
    /// Submission time of the command, epoch millis.
    pub issued_at: i64,
    pub reconsume_times: u32,
}

/// Handler output. Notice handlers usually return [`HandlerResult::empty`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandlerResult {
    pub body: Vec<u8>,
    pub trace_nos: Vec<String>,
}

impl HandlerResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            trace_nos: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_trace_nos(mut self, trace_nos: Vec<String>) -> Self {
        self.trace_nos = trace_nos;
        self
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, params: HandlerParams) -> anyhow::Result<HandlerResult>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerParams) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerResult>> + Send,
{
    async fn handle(&self, params: HandlerParams) -> anyhow::Result<HandlerResult> {
        (self.f)(params).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(HandlerParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerResult>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// No-op handler answering liveness probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeHandler;

#[async_trait]
impl Handler for ProbeHandler {
    async fn handle(&self, params: HandlerParams) -> anyhow::Result<HandlerResult> {
        Ok(HandlerResult::body(params.body))
    }
}

/// A handler bound to a topic, a tag and the command kinds it accepts.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub topic: String,
    pub tag: String,
    pub capabilities: Capabilities,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("topic", &self.topic)
            .field("tag", &self.tag)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl HandlerRegistration {
    pub fn new(
        topic: impl Into<String>,
        tag: impl Into<String>,
        capabilities: Capabilities,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            topic: topic.into(),
            tag: tag.into(),
            capabilities,
            handler,
        }
    }

    pub fn invoke(
        topic: impl Into<String>,
        tag: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self::new(topic, tag, Capabilities::INVOKE, handler)
    }

    pub fn notice(
        topic: impl Into<String>,
        tag: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self::new(topic, tag, Capabilities::ALL_NOTICES, handler)
    }

    /// Reason this registration cannot be routed, if any.
    pub fn problem(&self) -> Option<&'static str> {
        if self.topic.trim().is_empty() {
            Some("topic is empty")
        } else if self.tag.trim().is_empty() {
            Some("tag is empty")
        } else if self.capabilities.is_empty() {
            Some("no command kind supported")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(body: &[u8]) -> HandlerParams {
        HandlerParams {
            topic: "echo".into(),
            tag: "m".into(),
            kind: CommandKind::Invoke,
            body: body.to_vec(),
            trace_nos: Vec::new(),
            ext_params: BTreeMap::new(),
            message_id: "id".into(),
            issued_at: 0,
            reconsume_times: 0,
        }
    }

    #[tokio::test]
    async fn closures_adapt_to_handlers() {
        let handler = handler_fn(|params: HandlerParams| async move {
            let mut body = params.body;
            body.reverse();
            Ok(HandlerResult::body(body))
        });
        let result = handler.handle(params(b"abc")).await.unwrap();
        assert_eq!(result.body, b"cba");
    }

    #[tokio::test]
    async fn probe_echoes_its_input() {
        let result = ProbeHandler.handle(params(b"probe")).await.unwrap();
        assert_eq!(result.body, b"probe");
    }

    #[test]
    fn registrations_without_topic_or_tag_are_flagged() {
        let handler: Arc<dyn Handler> = Arc::new(ProbeHandler);
        assert_eq!(
            HandlerRegistration::invoke("", "m", handler.clone()).problem(),
            Some("topic is empty")
        );
        assert_eq!(
            HandlerRegistration::invoke("echo", " ", handler.clone()).problem(),
            Some("tag is empty")
        );
        assert_eq!(
            HandlerRegistration::new("echo", "m", Capabilities::NONE, handler.clone()).problem(),
            Some("no command kind supported")
        );
        assert!(HandlerRegistration::notice("echo", "m", handler).problem().is_none());
    }
}
