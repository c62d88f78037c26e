use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification carried by every [`CourierError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The broker cannot be reached or has no route for our topics.
    Connectivity,
    /// The broker rejected or could not accept a message.
    Send,
    /// A remote handler failed while executing the command.
    Execution,
    /// The caller gave up waiting.
    Timeout,
    /// No handler is registered for a topic/tag pair.
    RoutingMiss,
    /// The component is not in a state that allows the operation.
    Lifecycle,
    /// A wire header or payload could not be encoded or decoded.
    Codec,
}

/// Startup connectivity failures, classified the way operators triage them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("name server connection error: no route info for topic `{topic}`")]
    NoRouteInfo { topic: String },
    #[error("name server address is not configured")]
    NoNameServerAddress,
}

/// Errors reported by a broker implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no route info of topic `{topic}`")]
    NoRouteInfo { topic: String },
    #[error("no name server address configured")]
    NoNameServerAddress,
    #[error("broker rejected message for topic `{topic}`: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("queue {queue} does not exist on topic `{topic}` ({available} queues)")]
    NoSuchQueue {
        topic: String,
        queue: usize,
        available: usize,
    },
    #[error("consumer group `{group}` could not be started: {reason}")]
    ConsumerStart { group: String, reason: String },
    #[error("consumer group `{group}` is already running")]
    DuplicateConsumerGroup { group: String },
    #[error("{component} has been shut down")]
    Shutdown { component: String },
}

impl BrokerError {
    /// Map broker-level failures onto the startup connectivity taxonomy.
    pub fn connectivity(&self) -> Option<ConnectivityError> {
        match self {
            Self::NoRouteInfo { topic } => Some(ConnectivityError::NoRouteInfo {
                topic: topic.clone(),
            }),
            Self::NoNameServerAddress => Some(ConnectivityError::NoNameServerAddress),
            _ => None,
        }
    }
}

/// Errors surfaced to callers of the caller/client API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CourierError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error("send failed: {0}")]
    Send(BrokerError),
    #[error("remote execution failed: {detail}")]
    Execution { detail: String },
    #[error("invoke `{topic}`/`{tag}` timed out after {timeout_ms} ms")]
    Timeout {
        topic: String,
        tag: String,
        timeout_ms: u64,
    },
    #[error("request was cancelled before a response arrived")]
    Cancelled,
    #[error("no handler registered for topic `{topic}` tag `{tag}`")]
    RoutingMiss { topic: String, tag: String },
    #[error("{component} is not started")]
    NotStarted { component: &'static str },
    #[error("{component} failed to start: {reason}")]
    Startup {
        component: &'static str,
        reason: String,
    },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("service `{service}` has no method `{method}` supporting {kind}")]
    UnknownMethod {
        service: String,
        method: String,
        kind: String,
    },
}

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Send(_) => ErrorKind::Send,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Timeout { .. } | Self::Cancelled => ErrorKind::Timeout,
            Self::RoutingMiss { .. } | Self::UnknownMethod { .. } => ErrorKind::RoutingMiss,
            Self::NotStarted { .. } | Self::Startup { .. } => ErrorKind::Lifecycle,
            Self::Codec(_) => ErrorKind::Codec,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

impl From<BrokerError> for CourierError {
    fn from(error: BrokerError) -> Self {
        match error.connectivity() {
            Some(connectivity) => Self::Connectivity(connectivity),
            None => Self::Send(error),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec(error.to_string())
    }
}

pub type Result<T, E = CourierError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_route_errors_classify_as_connectivity() {
        let error: CourierError = BrokerError::NoRouteInfo {
            topic: "orders_resp".into(),
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::Connectivity);
        assert_eq!(
            error,
            CourierError::Connectivity(ConnectivityError::NoRouteInfo {
                topic: "orders_resp".into()
            })
        );

        let error: CourierError = BrokerError::NoNameServerAddress.into();
        assert_eq!(
            error,
            CourierError::Connectivity(ConnectivityError::NoNameServerAddress)
        );
    }

    #[test]
    fn rejected_sends_classify_as_send_errors() {
        let error: CourierError = BrokerError::Rejected {
            topic: "echo_invoke".into(),
            reason: "flush disk timeout".into(),
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::Send);
        assert!(error.to_string().contains("flush disk timeout"));
    }

    #[test]
    fn cancellation_is_a_timeout_kind() {
        assert!(CourierError::Cancelled.is_timeout());
        assert!(CourierError::Timeout {
            topic: "echo".into(),
            tag: "m".into(),
            timeout_ms: 10,
        }
        .is_timeout());
        assert!(!CourierError::Execution {
            detail: "boom".into()
        }
        .is_timeout());
    }
}
