//! Typed service stubs over the caller.
//!
//! A [`ServiceDescriptor`] names a service (its topic) and the command kinds
//! each method (its tag) accepts. A [`ServiceStub`] checks calls against the
//! descriptor before anything is sent and moves typed values through the codec.

use crate::caller::Caller;
use crate::codec::Codec;
use crate::command::{InvokeCommand, NoticeCommand, NoticeResult};
use crate::error::{CourierError, Result};
use crate::handler::{handler_fn, Handler, HandlerParams, HandlerRegistration, HandlerResult};
use crate::protocol::{Capabilities, CommandKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: BTreeMap<String, Capabilities>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Declare a method. Declaring it again widens its capabilities.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, capabilities: Capabilities) -> Self {
        let entry = self.methods.entry(name.into()).or_default();
        *entry = *entry | capabilities;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, Capabilities)> {
        self.methods.iter().map(|(name, caps)| (name.as_str(), *caps))
    }

    pub fn supports(&self, method: &str, kind: CommandKind) -> bool {
        self.methods
            .get(method)
            .is_some_and(|capabilities| capabilities.supports(kind))
    }

    fn check(&self, method: &str, kind: CommandKind) -> Result<()> {
        if self.supports(method, kind) {
            Ok(())
        } else {
            Err(CourierError::UnknownMethod {
                service: self.name.clone(),
                method: method.to_string(),
                kind: kind.to_string(),
            })
        }
    }

    /// Registration serving `method` with the capabilities declared for it.
    pub fn registration(
        &self,
        method: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<HandlerRegistration> {
        let capabilities = self.methods.get(method).copied().ok_or_else(|| {
            CourierError::UnknownMethod {
                service: self.name.clone(),
                method: method.to_string(),
                kind: "any".to_string(),
            }
        })?;
        Ok(HandlerRegistration::new(
            self.name.clone(),
            method,
            capabilities,
            handler,
        ))
    }
}

/// Handler that decodes its parameters and encodes its return value with
/// `codec`. Notices ignore the return value.
pub fn typed_handler<P, R, F, Fut>(codec: Arc<dyn Codec>, f: F) -> Arc<dyn Handler>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    handler_fn(move |params: HandlerParams| {
        let codec = Arc::clone(&codec);
        let f = Arc::clone(&f);
        async move {
            let input: P = codec.decode(&params.body)?;
            let output = f(input).await?;
            Ok(HandlerResult::body(codec.encode(&output)?))
        }
    })
}

/// Typed calls against one service through a borrowed [`Caller`].
pub struct ServiceStub<'a> {
    caller: &'a Caller,
    descriptor: &'a ServiceDescriptor,
    timeout: Duration,
    trace_nos: Vec<String>,
    ext_params: BTreeMap<String, String>,
}

impl<'a> ServiceStub<'a> {
    pub fn new(caller: &'a Caller, descriptor: &'a ServiceDescriptor) -> Self {
        Self {
            caller,
            descriptor,
            timeout: caller.default_invoke_timeout(),
            trace_nos: Vec::new(),
            ext_params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_trace_no(mut self, trace_no: impl Into<String>) -> Self {
        self.trace_nos.push(trace_no.into());
        self
    }

    #[must_use]
    pub fn with_ext_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_params.insert(key.into(), value.into());
        self
    }

    pub async fn invoke<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.descriptor.check(method, CommandKind::Invoke)?;
        let body = self.caller.codec().encode(params)?;
        let mut command = InvokeCommand::new(self.descriptor.name(), method, body)
            .with_trace_nos(self.trace_nos.iter().cloned());
        for (key, value) in &self.ext_params {
            command = command.with_ext_param(key.clone(), value.clone());
        }
        let result = self.caller.invoke(command, self.timeout).await?;
        self.caller.codec().decode(&result.body)
    }

    pub async fn notice<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<NoticeResult> {
        let command = self.notice_command(method, CommandKind::Notice, params)?;
        self.caller.notice(command, None).await
    }

    pub async fn ordered_notice<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
        order_key: &str,
    ) -> Result<NoticeResult> {
        let command = self.notice_command(method, CommandKind::OrderedNotice, params)?;
        self.caller.notice(command, Some(order_key)).await
    }

    pub async fn delayed_notice<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
        delay: Duration,
    ) -> Result<NoticeResult> {
        let command = self.notice_command(method, CommandKind::DelayedNotice, params)?;
        self.caller.delayed_notice(command, delay).await
    }

    fn notice_command<P: Serialize + ?Sized>(
        &self,
        method: &str,
        kind: CommandKind,
        params: &P,
    ) -> Result<NoticeCommand> {
        self.descriptor.check(method, kind)?;
        let body = self.caller.codec().encode(params)?;
        let mut command = NoticeCommand::new(self.descriptor.name(), method, body)
            .with_trace_nos(self.trace_nos.iter().cloned());
        for (key, value) in &self.ext_params {
            command = command.with_ext_param(key.clone(), value.clone());
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::caller::CallerOptions;
    use crate::client::{Client, ClientOptions};
    use crate::codec::default_codec;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sum {
        a: i64,
        b: i64,
    }

    fn calculator() -> ServiceDescriptor {
        ServiceDescriptor::new("calculator")
            .method("add", Capabilities::INVOKE)
            .method("audit", Capabilities::NOTICE)
            .method("audit", Capabilities::ORDERED_NOTICE)
    }

    #[test]
    fn repeated_declarations_widen_capabilities() {
        let descriptor = calculator();
        assert!(descriptor.supports("audit", CommandKind::Notice));
        assert!(descriptor.supports("audit", CommandKind::OrderedNotice));
        assert!(!descriptor.supports("audit", CommandKind::Invoke));
        assert!(!descriptor.supports("missing", CommandKind::Invoke));
        assert_eq!(descriptor.methods().count(), 2);
    }

    #[tokio::test]
    async fn unknown_methods_fail_before_sending() {
        let caller = Caller::new(CallerOptions::new("svc"), Arc::new(InMemoryBroker::new()));
        let descriptor = calculator();
        let stub = ServiceStub::new(&caller, &descriptor);

        let error = stub.invoke::<_, i64>("audit", &1).await.unwrap_err();
        assert!(matches!(error, CourierError::UnknownMethod { .. }));
        let error = stub.delayed_notice("add", &1, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(error, CourierError::UnknownMethod { .. }));
    }

    #[tokio::test]
    async fn typed_invoke_round_trip() {
        let broker = InMemoryBroker::new();
        let client = Client::new(ClientOptions::new("calc"), Arc::new(broker));
        let descriptor = calculator();
        let add = typed_handler(default_codec(), |sum: Sum| async move { Ok(sum.a + sum.b) });
        client.register([descriptor.registration("add", add).unwrap()]);
        client.start().await.unwrap();

        let stub =
            ServiceStub::new(client.caller(), &descriptor).with_timeout(Duration::from_secs(5));
        let total: i64 = stub.invoke("add", &Sum { a: 2, b: 40 }).await.unwrap();
        assert_eq!(total, 42);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_params_become_execution_errors() {
        let broker = InMemoryBroker::new();
        let client = Client::new(ClientOptions::new("calc"), Arc::new(broker));
        let descriptor = calculator();
        let add = typed_handler(default_codec(), |sum: Sum| async move { Ok(sum.a + sum.b) });
        client.register([descriptor.registration("add", add).unwrap()]);
        client.start().await.unwrap();

        let stub =
            ServiceStub::new(client.caller(), &descriptor).with_timeout(Duration::from_secs(5));
        let error = stub.invoke::<_, i64>("add", "not a sum").await.unwrap_err();
        assert!(matches!(error, CourierError::Execution { .. }));

        client.shutdown().await;
    }
}
