//! The handler registry.
//!
//! Each method maps to one [`HandlerRecord`]: the scheduling class, the
//! invoker closure owning the payload deserialiser, and the optional
//! dynamic-registration hooks. Handlers receive the decoded payload by
//! value, a [`Client`] to talk back through, and a cancellation token; they
//! own nothing of the connection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::connection::Client;
use crate::msg::{internal_error, invalid_params, ResponseError};
use crate::scheduler::ProcessType;
use crate::{RegisterError, RpcResult};

/// Whether a handler answers requests or consumes notifications/events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// The handler answers requests.
    Request,
    /// The handler consumes notifications or events; it never replies.
    Notification,
}

/// Picks the scheduling class for a handler that did not choose one.
pub type Classifier = fn(HandlerKind, &str) -> ProcessType;

/// The default policy: notifications usually change state and run Serial;
/// requests are usually pure queries and run Parallel.
pub fn default_classifier(kind: HandlerKind, _method: &str) -> ProcessType {
    match kind {
        HandlerKind::Request => ProcessType::Parallel,
        HandlerKind::Notification => ProcessType::Serial,
    }
}

/// How a request invocation failed. The dispatcher replies with the carried
/// error either way; the split exists because the DAP legacy 500 code
/// applies to handler-originated failures only, never to decode rejections.
pub(crate) enum InvokeError {
    /// The params did not decode to the handler's payload type.
    Decode(ResponseError),
    /// The registered handler body failed.
    Handler(ResponseError),
}

type RequestInvoker = Box<
    dyn Fn(Client, JsonValue, CancellationToken) -> BoxFuture<'static, Result<JsonValue, InvokeError>>
        + Send
        + Sync,
>;
type NotifyInvoker =
    Box<dyn Fn(Client, JsonValue) -> BoxFuture<'static, RpcResult<()>> + Send + Sync>;

pub(crate) enum Invoker {
    Request(RequestInvoker),
    Notification(NotifyInvoker),
}

type RegisterOptionsFn = Box<dyn Fn() -> JsonValue + Send + Sync>;
type CapabilityFn = Box<dyn Fn(&JsonValue) + Send + Sync>;

/// Per-registration knobs beyond the handler itself.
#[derive(Default)]
pub struct HandlerOptions {
    /// Overrides the registry classifier for this handler.
    pub process: Option<ProcessType>,
    pub(crate) register_options: Option<RegisterOptionsFn>,
    pub(crate) set_capability: Option<CapabilityFn>,
}

impl HandlerOptions {
    /// Forces the handler to run serially.
    pub fn serial() -> Self {
        Self {
            process: Some(ProcessType::Serial),
            ..Default::default()
        }
    }

    /// Forces the handler to run in parallel.
    pub fn parallel() -> Self {
        Self {
            process: Some(ProcessType::Parallel),
            ..Default::default()
        }
    }

    /// Attaches a registration-options provider. A record carrying one is
    /// assigned a fresh GUID and contributes to `client/registerCapability`.
    pub fn with_register_options(
        mut self,
        provider: impl Fn() -> JsonValue + Send + Sync + 'static,
    ) -> Self {
        self.register_options = Some(Box::new(provider));
        self
    }

    /// Attaches a capability setter invoked when the initialize negotiation
    /// completes, with the peer's capability record.
    pub fn with_capability(mut self, setter: impl Fn(&JsonValue) + Send + Sync + 'static) -> Self {
        self.set_capability = Some(Box::new(setter));
        self
    }
}

/// One registered handler.
pub struct HandlerRecord {
    /// The method (command/event) name.
    pub method: String,
    /// Whether this answers requests or consumes notifications.
    pub kind: HandlerKind,
    /// The scheduling class of invocations.
    pub process: ProcessType,
    /// The id used in dynamic registration payloads; present iff the record
    /// carries registration options.
    pub registration_id: Option<String>,
    pub(crate) invoker: Invoker,
    pub(crate) register_options: Option<RegisterOptionsFn>,
    pub(crate) set_capability: Option<CapabilityFn>,
}

/// One entry of a `client/registerCapability` payload.
#[derive(Debug, Clone)]
pub struct DynamicRegistration {
    /// The fresh GUID assigned at registration.
    pub id: String,
    /// The method being registered.
    pub method: String,
    /// The options record, usually carrying a document selector.
    pub register_options: JsonValue,
}

/// The method → handler table shared by a connection.
///
/// One handler per method; a second registration for the same method fails.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    requests: Mutex<HashMap<String, Arc<HandlerRecord>>>,
    notifications: Mutex<HashMap<String, Arc<HandlerRecord>>>,
    classifier: Mutex<Classifier>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry with the default classifier.
    pub fn new() -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                requests: Mutex::new(HashMap::new()),
                notifications: Mutex::new(HashMap::new()),
                classifier: Mutex::new(default_classifier),
            }),
        }
    }

    /// Replaces the Serial/Parallel classifier used for handlers that do not
    /// choose a class themselves. Affects later registrations only.
    pub fn set_classifier(&self, classifier: Classifier) {
        *self.inner.classifier.lock() = classifier;
    }

    /// Registers an untyped request handler.
    pub fn register_raw_request<F, Fut>(
        &self,
        method: impl Into<String>,
        opts: HandlerOptions,
        handler: F,
    ) -> Result<RegistrationHandle, RegisterError>
    where
        F: Fn(Client, JsonValue, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<JsonValue>> + Send + 'static,
    {
        let invoker = Invoker::Request(Box::new(move |client, params, token| {
            handler(client, params, token)
                .map(|res| res.map_err(InvokeError::Handler))
                .boxed()
        }));
        self.insert(HandlerKind::Request, method.into(), opts, invoker)
    }

    /// Registers an untyped notification handler.
    pub fn register_raw_notification<F, Fut>(
        &self,
        method: impl Into<String>,
        opts: HandlerOptions,
        handler: F,
    ) -> Result<RegistrationHandle, RegisterError>
    where
        F: Fn(Client, JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<()>> + Send + 'static,
    {
        let invoker =
            Invoker::Notification(Box::new(move |client, params| handler(client, params).boxed()));
        self.insert(HandlerKind::Notification, method.into(), opts, invoker)
    }

    pub(crate) fn request(&self, method: &str) -> Option<Arc<HandlerRecord>> {
        self.inner.requests.lock().get(method).cloned()
    }

    pub(crate) fn notification(&self, method: &str) -> Option<Arc<HandlerRecord>> {
        self.inner.notifications.lock().get(method).cloned()
    }

    /// Feeds the peer's capability record to every capability setter.
    pub fn apply_capabilities(&self, capabilities: &JsonValue) {
        for map in [&self.inner.requests, &self.inner.notifications] {
            for record in map.lock().values() {
                if let Some(setter) = &record.set_capability {
                    setter(capabilities);
                }
            }
        }
    }

    /// Collects the dynamic registrations of every record carrying
    /// registration options, for a `client/registerCapability` request.
    pub fn dynamic_registrations(&self) -> Vec<DynamicRegistration> {
        let mut regs = Vec::new();
        for map in [&self.inner.requests, &self.inner.notifications] {
            for record in map.lock().values() {
                let (Some(id), Some(provider)) = (&record.registration_id, &record.register_options)
                else {
                    continue;
                };
                regs.push(DynamicRegistration {
                    id: id.clone(),
                    method: record.method.clone(),
                    register_options: provider(),
                });
            }
        }
        regs
    }

    fn insert(
        &self,
        kind: HandlerKind,
        method: String,
        opts: HandlerOptions,
        invoker: Invoker,
    ) -> Result<RegistrationHandle, RegisterError> {
        let process = match opts.process {
            Some(process) => process,
            None => {
                let classify = *self.inner.classifier.lock();
                classify(kind, &method)
            }
        };
        let registration_id = opts.register_options.is_some().then(fresh_registration_id);
        let record = Arc::new(HandlerRecord {
            method: method.clone(),
            kind,
            process,
            registration_id,
            invoker,
            register_options: opts.register_options,
            set_capability: opts.set_capability,
        });

        let map = match kind {
            HandlerKind::Request => &self.inner.requests,
            HandlerKind::Notification => &self.inner.notifications,
        };
        let mut map = map.lock();
        if map.contains_key(&method) {
            return Err(RegisterError::Duplicate(method));
        }
        map.insert(method.clone(), record);
        Ok(RegistrationHandle {
            method,
            kind,
            inner: Arc::downgrade(&self.inner),
        })
    }
}

#[cfg(feature = "lsp")]
impl Registry {
    /// Registers a typed LSP request handler with explicit options.
    pub fn register_request_with<R, F, Fut>(
        &self,
        opts: HandlerOptions,
        handler: F,
    ) -> Result<RegistrationHandle, RegisterError>
    where
        R: lsp_types::request::Request,
        R::Params: Send + 'static,
        F: Fn(Client, R::Params, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<R::Result>> + Send + 'static,
    {
        let invoker = Invoker::Request(Box::new(move |client, params, token| {
            let params = match from_json::<R::Params>(params) {
                Ok(params) => params,
                Err(err) => return futures::future::ready(Err(InvokeError::Decode(err))).boxed(),
            };
            let fut = handler(client, params, token);
            async move {
                let result = fut.await.map_err(InvokeError::Handler)?;
                serde_json::to_value(result).map_err(|err| InvokeError::Handler(internal_error(err)))
            }
            .boxed()
        }));
        self.insert(HandlerKind::Request, R::METHOD.to_owned(), opts, invoker)
    }

    /// Registers a typed LSP request handler.
    pub fn register_request<R, F, Fut>(&self, handler: F) -> Result<RegistrationHandle, RegisterError>
    where
        R: lsp_types::request::Request,
        R::Params: Send + 'static,
        F: Fn(Client, R::Params, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<R::Result>> + Send + 'static,
    {
        self.register_request_with::<R, F, Fut>(HandlerOptions::default(), handler)
    }

    /// Registers a typed LSP notification handler with explicit options.
    pub fn register_notification_with<N, F, Fut>(
        &self,
        opts: HandlerOptions,
        handler: F,
    ) -> Result<RegistrationHandle, RegisterError>
    where
        N: lsp_types::notification::Notification,
        N::Params: Send + 'static,
        F: Fn(Client, N::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<()>> + Send + 'static,
    {
        let invoker = Invoker::Notification(Box::new(move |client, params| {
            let params = match from_json::<N::Params>(params) {
                Ok(params) => params,
                Err(err) => return futures::future::ready(Err(err)).boxed(),
            };
            handler(client, params).boxed()
        }));
        self.insert(HandlerKind::Notification, N::METHOD.to_owned(), opts, invoker)
    }

    /// Registers a typed LSP notification handler.
    pub fn register_notification<N, F, Fut>(
        &self,
        handler: F,
    ) -> Result<RegistrationHandle, RegisterError>
    where
        N: lsp_types::notification::Notification,
        N::Params: Send + 'static,
        F: Fn(Client, N::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<()>> + Send + 'static,
    {
        self.register_notification_with::<N, F, Fut>(HandlerOptions::default(), handler)
    }
}

#[cfg(feature = "dap")]
impl Registry {
    /// Registers a typed DAP command handler with explicit options.
    pub fn register_command_with<R, F, Fut>(
        &self,
        opts: HandlerOptions,
        handler: F,
    ) -> Result<RegistrationHandle, RegisterError>
    where
        R: crate::dap::IRequest,
        R::Arguments: 'static,
        F: Fn(Client, R::Arguments, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<R::Response>> + Send + 'static,
    {
        let invoker = Invoker::Request(Box::new(move |client, arguments, token| {
            let arguments = match from_json::<R::Arguments>(arguments) {
                Ok(arguments) => arguments,
                Err(err) => return futures::future::ready(Err(InvokeError::Decode(err))).boxed(),
            };
            let fut = handler(client, arguments, token);
            async move {
                let result = fut.await.map_err(InvokeError::Handler)?;
                serde_json::to_value(result).map_err(|err| InvokeError::Handler(internal_error(err)))
            }
            .boxed()
        }));
        self.insert(HandlerKind::Request, R::COMMAND.to_owned(), opts, invoker)
    }

    /// Registers a typed DAP command handler.
    pub fn register_command<R, F, Fut>(&self, handler: F) -> Result<RegistrationHandle, RegisterError>
    where
        R: crate::dap::IRequest,
        R::Arguments: 'static,
        F: Fn(Client, R::Arguments, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<R::Response>> + Send + 'static,
    {
        self.register_command_with::<R, F, Fut>(HandlerOptions::default(), handler)
    }

    /// Registers a typed DAP event handler.
    pub fn register_event<E, F, Fut>(&self, handler: F) -> Result<RegistrationHandle, RegisterError>
    where
        E: crate::dap::IEvent,
        E::Body: 'static,
        F: Fn(Client, E::Body) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<()>> + Send + 'static,
    {
        let invoker = Invoker::Notification(Box::new(move |client, body| {
            let body = match from_json::<E::Body>(body) {
                Ok(body) => body,
                Err(err) => return futures::future::ready(Err(err)).boxed(),
            };
            handler(client, body).boxed()
        }));
        self.insert(HandlerKind::Notification, E::EVENT.to_owned(), HandlerOptions::default(), invoker)
    }
}

/// Removes its handler when released.
///
/// Dropping the handle without calling [`release`](Self::release) keeps the
/// handler registered for the life of the registry, so register-and-forget
/// is fine for handlers that live as long as the connection.
pub struct RegistrationHandle {
    method: String,
    kind: HandlerKind,
    inner: Weak<RegistryInner>,
}

impl RegistrationHandle {
    /// The method this handle controls.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Removes the handler from the registry.
    pub fn release(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let map = match self.kind {
            HandlerKind::Request => &inner.requests,
            HandlerKind::Notification => &inner.notifications,
        };
        map.lock().remove(&self.method);
    }
}

fn from_json<T: serde::de::DeserializeOwned>(json: JsonValue) -> RpcResult<T> {
    serde_json::from_value(json).map_err(invalid_params)
}

fn fresh_registration_id() -> String {
    let bits = fastrand::u128(..);
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (bits >> 96) as u32,
        (bits >> 80) as u16,
        (bits >> 64) as u16,
        (bits >> 48) as u16,
        bits & 0xffff_ffff_ffff
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{HandlerKind, HandlerOptions, Registry};
    use crate::scheduler::ProcessType;

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        let first = registry
            .register_raw_request("textDocument/hover", HandlerOptions::default(), |_, _, _| async {
                Ok(json!(null))
            })
            .unwrap();
        let second = registry.register_raw_request(
            "textDocument/hover",
            HandlerOptions::default(),
            |_, _, _| async { Ok(json!(null)) },
        );
        assert!(second.is_err());

        // Releasing frees the method for a new registration.
        first.release();
        let third = registry.register_raw_request(
            "textDocument/hover",
            HandlerOptions::default(),
            |_, _, _| async { Ok(json!(null)) },
        );
        assert!(third.is_ok());
    }

    #[test]
    fn classifier_defaults() {
        let registry = Registry::new();
        let req = registry
            .register_raw_request("q", HandlerOptions::default(), |_, _, _| async { Ok(json!(null)) })
            .unwrap();
        let not = registry
            .register_raw_notification("n", HandlerOptions::default(), |_, _| async { Ok(()) })
            .unwrap();

        assert_eq!(registry.request("q").unwrap().process, ProcessType::Parallel);
        assert_eq!(registry.notification("n").unwrap().process, ProcessType::Serial);
        assert_eq!(registry.request("q").unwrap().kind, HandlerKind::Request);
        let _ = (req, not);
    }

    #[test]
    fn registration_options_get_a_guid() {
        let registry = Registry::new();
        let opts = HandlerOptions::default()
            .with_register_options(|| json!({"documentSelector": [{"language": "xml"}]}));
        let _handle = registry
            .register_raw_request("textDocument/hover", opts, |_, _, _| async { Ok(json!(null)) })
            .unwrap();

        let regs = registry.dynamic_registrations();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].method, "textDocument/hover");
        assert_eq!(regs[0].id.len(), 36);
        assert!(regs[0].register_options.get("documentSelector").is_some());

        // A plain registration contributes nothing.
        let _other = registry
            .register_raw_request("other", HandlerOptions::default(), |_, _, _| async {
                Ok(json!(null))
            })
            .unwrap();
        assert_eq!(registry.dynamic_registrations().len(), 1);
    }

    #[test]
    fn capability_setters_observe_the_peer_record() {
        let registry = Registry::new();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        let opts = HandlerOptions::default()
            .with_capability(move |caps| *seen2.lock() = Some(caps.clone()));
        let _handle = registry
            .register_raw_request("textDocument/definition", opts, |_, _, _| async {
                Ok(json!(null))
            })
            .unwrap();

        registry.apply_capabilities(&json!({"definitionProvider": true}));
        assert_eq!(
            seen.lock().as_ref().unwrap().get("definitionProvider"),
            Some(&json!(true))
        );
    }
}
