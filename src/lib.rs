#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

//! Request/reply and notice commands over a partitioned publish/subscribe
//! broker.
//!
//! A [`Caller`] sends invoke, notice, ordered notice and delayed notice
//! commands. A [`Client`] additionally serves them through registered
//! [`Handler`]s, one consumer group per command kind.

pub mod broker;
pub mod caller;
pub mod client;
pub(crate) mod clock;
pub mod codec;
pub mod command;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handler;
pub(crate) mod listener;
pub mod promise;
pub mod protocol;
pub mod routing;
pub mod service;

pub use broker::{Broker, InMemoryBroker, InMemoryBrokerOptions};
pub use caller::{Caller, CallerOptions, Lifecycle};
pub use client::{Client, ClientOptions, ClientStatus};
pub use codec::{default_codec, Codec, JsonCodec};
pub use command::{InvokeCommand, InvokeResult, NoticeCommand, NoticeResult};
pub use config::Config;
pub use correlation::CorrelationTable;
pub use error::{CourierError, ErrorKind, Result};
pub use handler::{handler_fn, Handler, HandlerParams, HandlerRegistration, HandlerResult};
pub use promise::{Promise, PromiseState, Settlement};
pub use protocol::{Capabilities, CommandKind};
pub use service::{typed_handler, ServiceDescriptor, ServiceStub};
