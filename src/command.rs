//! Application-level commands and their results.

use crate::broker::DeliveredMessage;
use crate::protocol::{EXT_PARAM_PREFIX, TRACE_NOS_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

macro_rules! command_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            pub topic: String,
            pub tag: String,
            pub body: Vec<u8>,
            #[serde(default)]
            pub trace_nos: Vec<String>,
            #[serde(default)]
            pub ext_params: BTreeMap<String, String>,
        }

        impl $name {
            pub fn new(
                topic: impl Into<String>,
                tag: impl Into<String>,
                body: impl Into<Vec<u8>>,
            ) -> Self {
                Self {
                    topic: topic.into(),
                    tag: tag.into(),
                    body: body.into(),
                    trace_nos: Vec::new(),
                    ext_params: BTreeMap::new(),
                }
            }

            #[must_use]
            pub fn with_trace_no(mut self, trace_no: impl Into<String>) -> Self {
                self.trace_nos.push(trace_no.into());
                self
            }

            #[must_use]
            pub fn with_trace_nos(mut self, trace_nos: impl IntoIterator<Item = String>) -> Self {
                self.trace_nos.extend(trace_nos);
                self
            }

            #[must_use]
            pub fn with_ext_param(
                mut self,
                key: impl Into<String>,
                value: impl Into<String>,
            ) -> Self {
                self.ext_params.insert(key.into(), value.into());
                self
            }

            pub(crate) fn wire_properties(&self) -> BTreeMap<String, String> {
                wire_properties(&self.trace_nos, &self.ext_params)
            }
        }
    };
}

command_type!(
    /// Request/response command, answered by exactly one handler.
    InvokeCommand
);

command_type!(
    /// Fire-and-forget command. Also used for ordered and delayed notices.
    NoticeCommand
);

/// Successful outcome of an invoke.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvokeResult {
    pub body: Vec<u8>,
    #[serde(default)]
    pub trace_nos: Vec<String>,
}

impl InvokeResult {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            trace_nos: Vec::new(),
        }
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Broker acknowledgement of a notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeResult {
    /// Broker-assigned message id.
    pub id: String,
}

fn wire_properties(
    trace_nos: &[String],
    ext_params: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut properties: BTreeMap<String, String> = ext_params
        .iter()
        .map(|(key, value)| (format!("{EXT_PARAM_PREFIX}{key}"), value.clone()))
        .collect();
    if !trace_nos.is_empty() {
        let encoded = serde_json::Value::from(trace_nos.to_vec()).to_string();
        properties.insert(TRACE_NOS_KEY.to_string(), encoded);
    }
    properties
}

/// Trace numbers carried by a delivered message, stored as a JSON array.
pub(crate) fn trace_nos_of(message: &DeliveredMessage) -> Vec<String> {
    let Some(encoded) = message.property(TRACE_NOS_KEY) else {
        return Vec::new();
    };
    serde_json::from_str(encoded).unwrap_or_else(|error| {
        tracing::warn!(
            message_id = %message.message_id,
            error = %error,
            "Malformed trace numbers; ignored"
        );
        Vec::new()
    })
}

/// Extension parameters carried by a delivered message.
pub(crate) fn ext_params_of(message: &DeliveredMessage) -> BTreeMap<String, String> {
    message
        .properties
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(EXT_PARAM_PREFIX)
                .map(|key| (key.to_string(), value.clone()))
        })
        .collect()
}
