//! The connection driver.
//!
//! A connection owns three long-lived tasks around a byte-stream pair: the
//! send worker draining the bounded outgoing queue, the receive loop framing
//! and classifying inbound bytes, and the dispatch loop feeding the
//! Serial/Parallel scheduler. Responses to our own requests are settled by
//! the receive loop directly; requests and notifications flow through the
//! dispatch loop and the handler registry.
//!
//! The [`Connection`] is the strong owner: dropping it (or calling
//! [`disconnect`](Connection::disconnect)) closes the outgoing queue and
//! settles every pending request. Handlers and embedders talk through the
//! cheap [`Client`] handle, which only holds weak references.

use std::future::Future;
use std::io::{self, BufRead, Write};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "dap")]
use crate::dap;
#[cfg(feature = "lsp")]
use crate::lsp;
#[cfg(feature = "dap")]
use crate::msg::invalid_params;
#[cfg(feature = "lsp")]
use crate::msg::{method_not_found, parse_error};
use crate::msg::{
    internal_error, invalid_request, not_initialized, request_cancelled, Message, MessageKind,
    RequestId, ResponseError,
};
use crate::receiver;
use crate::registry::{HandlerRecord, InvokeError, Invoker, Registry};
use crate::req_queue::ReqQueue;
use crate::scheduler::Scheduler;
#[cfg(feature = "dap")]
use crate::ErrorCode;
use crate::{ProtocolError, RequestError, RpcResult};

/// How long `disconnect(flush)` waits for the outgoing queue to drain.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long scheduler shutdown waits for in-flight handlers.
pub const DEFAULT_SCHEDULER_GRACE: Duration = Duration::from_secs(5);

const OUTGOING_QUEUE_CAPACITY: usize = 128;

/// Observability callbacks around handler execution.
///
/// The hook is injected at build time and travels with the connection; the
/// unit implementation logs through the `log` facade.
pub trait RpcHook: std::fmt::Debug + Send + Sync {
    /// An inbound request started executing.
    fn start_request(&self, req_id: &RequestId, method: &str);
    /// An inbound request was answered.
    fn stop_request(&self, req_id: &RequestId, method: &str, received_at: Instant);
    /// An inbound notification started executing.
    fn start_notification(&self, method: &str);
    /// An inbound notification finished.
    fn stop_notification(&self, method: &str, received_at: Instant, result: RpcResult<()>);
}

impl RpcHook for () {
    fn start_request(&self, req_id: &RequestId, method: &str) {
        log::info!("handling {method} - ({req_id})");
    }

    fn stop_request(&self, req_id: &RequestId, method: &str, received_at: Instant) {
        let duration = received_at.elapsed();
        log::info!("handled  {method} - ({req_id}) in {duration:0.2?}");
    }

    fn start_notification(&self, method: &str) {
        log::info!("notifying {method}");
    }

    fn stop_notification(&self, method: &str, received_at: Instant, result: RpcResult<()>) {
        let duration = received_at.elapsed();
        if let Err(err) = result {
            log::error!("notify {method} failed in {duration:0.2?}: {err:?}");
        } else {
            log::info!("notify {method} succeeded in {duration:0.2?}");
        }
    }
}

/// The transport state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Built but not started.
    New,
    /// The loops are running.
    Open,
    /// Disconnect in progress, draining the outgoing queue.
    Draining,
    /// Fully torn down.
    Closed,
}

/// The handshake overlay on top of [`ConnState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
}

/// Resolves once the matching response is ingested, the request is
/// cancelled, or the connection closes.
pub struct ResponseFuture {
    id: RequestId,
    rx: oneshot::Receiver<Result<JsonValue, RequestError>>,
}

impl ResponseFuture {
    /// The id the request went out with.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    fn settled(id: RequestId, outcome: Result<JsonValue, RequestError>) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        ResponseFuture { id, rx }
    }
}

impl Future for ResponseFuture {
    type Output = Result<JsonValue, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An in-flight handler invocation for a request received from the peer.
struct InboundExecution {
    method: String,
    received_at: Instant,
    cancel: CancellationToken,
}

/// The completion slot of a request sent to the peer. Settled exactly once;
/// the settled token stops the per-call cancel watcher.
struct PendingSlot {
    method: String,
    reply: oneshot::Sender<Result<JsonValue, RequestError>>,
    settled: CancellationToken,
}

enum Inbound {
    #[cfg(feature = "lsp")]
    Lsp(receiver::Classified),
    #[cfg(feature = "dap")]
    Dap(receiver::DapClassified),
}

pub(crate) struct ConnectionCore {
    kind: MessageKind,
    handle: tokio::runtime::Handle,
    hook: Arc<dyn RpcHook>,
    legacy_error_code: bool,
    flush_timeout: Duration,
    registry: Registry,
    req_queue: Mutex<ReqQueue<InboundExecution, PendingSlot>>,
    outgoing: Weak<Sender<Message>>,
    state: Mutex<ConnState>,
    lifecycle: Mutex<Lifecycle>,
    ready_tx: watch::Sender<bool>,
    deferred: Mutex<Vec<Message>>,
    root_cancel: CancellationToken,
    disconnected: CancellationToken,
}

impl ConnectionCore {
    fn client(self: &Arc<Self>) -> Client {
        Client {
            core: Arc::downgrade(self),
        }
    }

    fn alloc_seq(&self) -> i32 {
        self.req_queue.lock().outgoing.alloc_request_id()
    }

    fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Requests issued before the handshake completes are held back and
    /// flushed on ready, except the handshake itself and cancels.
    fn enqueue(&self, msg: Message) {
        if !self.is_ready() {
            if let Some(method) = request_method(&msg) {
                if !exempt_from_defer(self.kind, method) {
                    self.deferred.lock().push(msg);
                    return;
                }
            }
        }
        self.enqueue_now(msg);
    }

    fn enqueue_now(&self, msg: Message) {
        let Some(sender) = self.outgoing.upgrade() else {
            log::warn!("failed to send message: connection closed");
            return;
        };
        if let Err(err) = sender.send(msg) {
            log::warn!("failed to send message: {err:?}");
        }
    }

    fn send_request(
        self: &Arc<Self>,
        method: String,
        params: JsonValue,
        cancel: Option<CancellationToken>,
    ) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let settled = CancellationToken::new();
        let (id, msg) = {
            let mut queue = self.req_queue.lock();
            let raw = queue.outgoing.alloc_request_id();
            let id = RequestId::from(raw);
            queue.outgoing.register(
                id.clone(),
                PendingSlot {
                    method: method.clone(),
                    reply: tx,
                    settled: settled.clone(),
                },
            );
            let msg: Message = match self.kind {
                #[cfg(feature = "lsp")]
                MessageKind::Lsp => lsp::Request::new(id.clone(), method, params).into(),
                #[cfg(feature = "dap")]
                MessageKind::Dap => dap::Request::new(raw as i64, method, params).into(),
            };
            (id, msg)
        };

        if let Some(cancel) = cancel {
            let core = Arc::downgrade(self);
            let id = id.clone();
            self.handle.spawn(async move {
                tokio::select! {
                    _ = settled.cancelled() => {}
                    _ = cancel.cancelled() => {
                        if let Some(core) = core.upgrade() {
                            core.cancel_request(&id);
                        }
                    }
                }
            });
        }

        self.enqueue(msg);
        ResponseFuture { id, rx }
    }

    /// Settles a pending request with a cancel error and tells the peer,
    /// best effort, while the outgoing queue is still open.
    fn cancel_request(&self, id: &RequestId) {
        let slot = self.req_queue.lock().outgoing.complete(id.clone());
        let Some(slot) = slot else { return };
        slot.settled.cancel();
        if slot.reply.send(Err(RequestError::Cancelled)).is_err() {
            log::debug!("cancelled request ({id}) had no waiter");
        }

        match self.kind {
            #[cfg(feature = "lsp")]
            MessageKind::Lsp => {
                use lsp_types::notification::{Cancel, Notification as _};
                self.enqueue_now(
                    lsp::Notification::new(Cancel::METHOD.to_owned(), json!({ "id": id })).into(),
                );
            }
            #[cfg(feature = "dap")]
            MessageKind::Dap => {
                let Some(request_id) = id.as_int() else { return };
                // cancel is itself a request in DAP; its own response is
                // swallowed by a slot nobody waits on
                let (tx, _rx) = oneshot::channel();
                let mut queue = self.req_queue.lock();
                let seq = queue.outgoing.alloc_request_id();
                queue.outgoing.register(
                    RequestId::from(seq),
                    PendingSlot {
                        method: dap::command::CANCEL.to_owned(),
                        reply: tx,
                        settled: CancellationToken::new(),
                    },
                );
                drop(queue);
                self.enqueue_now(
                    dap::Request::new(
                        seq as i64,
                        dap::command::CANCEL.to_owned(),
                        json!({ "requestId": request_id }),
                    )
                    .into(),
                );
            }
        }
    }

    #[cfg(feature = "lsp")]
    fn settle_response(&self, resp: lsp::Response) {
        let Some(id) = resp.id else {
            log::warn!("dropping response with null id");
            return;
        };
        let Some(slot) = self.req_queue.lock().outgoing.complete(id.clone()) else {
            log::warn!("received response for unknown request ({id})");
            return;
        };
        slot.settled.cancel();
        let outcome = match resp.error {
            Some(error) => Err(RequestError::Response(error)),
            None => Ok(resp.result.unwrap_or(JsonValue::Null)),
        };
        if slot.reply.send(outcome).is_err() {
            log::debug!("response for request ({id}) dropped by caller");
        }
    }

    #[cfg(feature = "dap")]
    fn settle_dap_response(&self, resp: dap::Response) {
        let id = RequestId::from(resp.request_seq as i32);
        let Some(slot) = self.req_queue.lock().outgoing.complete(id.clone()) else {
            log::warn!("received response for unknown request ({id})");
            return;
        };
        slot.settled.cancel();
        let outcome = if resp.success {
            Ok(resp.body.unwrap_or(JsonValue::Null))
        } else {
            let code = resp
                .body
                .as_ref()
                .and_then(|body| body.pointer("/error/id"))
                .and_then(JsonValue::as_i64)
                .map(|id| id as i32)
                .unwrap_or(ErrorCode::UnknownErrorCode as i32);
            Err(RequestError::Response(ResponseError {
                code,
                message: resp.message.unwrap_or_else(|| "request failed".to_owned()),
                data: None,
            }))
        };
        if slot.reply.send(outcome).is_err() {
            log::debug!("response for request ({id}) dropped by caller");
        }
    }

    /// Answers an inbound request with a routing, validation or lifecycle
    /// outcome.
    fn respond(&self, id: RequestId, result: RpcResult<JsonValue>) {
        self.respond_with(id, result, false);
    }

    /// Answers an inbound request. Completing the incoming entry first makes
    /// the reply at-most-once even when a handler result races a cancel.
    /// `from_handler` marks failures originating in the registered handler
    /// body, the only category the DAP legacy 500 code applies to.
    fn respond_with(&self, id: RequestId, result: RpcResult<JsonValue>, from_handler: bool) {
        let Some(exec) = self.req_queue.lock().incoming.complete(&id) else {
            return;
        };
        self.hook.stop_request(&id, &exec.method, exec.received_at);

        let msg: Message = match self.kind {
            #[cfg(feature = "lsp")]
            MessageKind::Lsp => lsp::Response::new(id, result).into(),
            #[cfg(feature = "dap")]
            MessageKind::Dap => {
                let Some(request_seq) = id.as_int() else {
                    log::error!("non-integer request id on a DAP connection: {id}");
                    return;
                };
                let seq = self.alloc_seq() as i64;
                match result {
                    Ok(body) => {
                        dap::Response::success(seq, request_seq as i64, exec.method, body).into()
                    }
                    Err(error) => dap::Response::error(
                        seq,
                        request_seq as i64,
                        exec.method,
                        &error,
                        from_handler && self.legacy_error_code,
                    )
                    .into(),
                }
            }
        };
        self.enqueue_now(msg);
    }

    /// Trips the cancellation source of an in-flight inbound request.
    fn cancel_inbound(&self, id: &RequestId) {
        let queue = self.req_queue.lock();
        match queue.incoming.get(id) {
            Some(exec) => exec.cancel.cancel(),
            None => log::debug!("cancel for unknown or finished request ({id})"),
        }
    }

    fn reply_parse_error(&self, detail: impl std::fmt::Display) {
        match self.kind {
            #[cfg(feature = "lsp")]
            MessageKind::Lsp => {
                self.enqueue_now(lsp::Response::new_err(None, parse_error(detail)).into());
            }
            // DAP has no null-id response form; the frame is only logged.
            #[cfg(feature = "dap")]
            MessageKind::Dap => {
                let _ = detail;
            }
        }
    }

    fn mark_ready(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::ShuttingDown {
                return;
            }
            *lifecycle = Lifecycle::Ready;
        }
        self.ready_tx.send_replace(true);
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for msg in deferred {
            self.enqueue_now(msg);
        }
    }

    /// Settles every pending request and completes the disconnected future.
    fn on_transport_closed(&self) {
        let slots = self.req_queue.lock().outgoing.drain();
        for (id, slot) in slots {
            slot.settled.cancel();
            if slot.reply.send(Err(RequestError::Closed)).is_err() {
                log::debug!("pending request ({id}) had no waiter");
            }
        }
        self.disconnected.cancel();
    }
}

// Dispatch: one inbound item at a time, lifecycle-gated, then scheduled.
impl ConnectionCore {
    #[cfg(feature = "lsp")]
    fn dispatch_lsp(self: &Arc<Self>, item: receiver::Classified, scheduler: &Scheduler) -> bool {
        match item {
            receiver::Classified::Invalid { id, error } => {
                log::warn!("invalid message: {}", error.message);
                self.enqueue_now(lsp::Response::new_err(id, error).into());
                true
            }
            receiver::Classified::Request(req) => {
                self.on_lsp_request(req, scheduler);
                true
            }
            receiver::Classified::Notification(not) => self.on_lsp_notification(not, scheduler),
            // responses are settled by the receive loop
            receiver::Classified::Response(_) => true,
        }
    }

    #[cfg(feature = "lsp")]
    fn on_lsp_request(self: &Arc<Self>, req: lsp::Request, scheduler: &Scheduler) {
        use lsp_types::request::{Initialize, Request as _, Shutdown};

        let cancel = self.root_cancel.child_token();
        self.hook.start_request(&req.id, &req.method);
        self.req_queue.lock().incoming.register(
            req.id.clone(),
            InboundExecution {
                method: req.method.clone(),
                received_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );

        let lifecycle = *self.lifecycle.lock();
        let is_initialize = req.method == Initialize::METHOD;
        match (lifecycle, is_initialize) {
            (Lifecycle::Uninitialized, true) => {
                *self.lifecycle.lock() = Lifecycle::Initializing;
                if let Some(capabilities) = req.params.get("capabilities") {
                    self.registry.apply_capabilities(capabilities);
                }
                self.route_request(req, cancel, scheduler);
            }
            (Lifecycle::Uninitialized | Lifecycle::Initializing, false) => {
                self.respond(req.id, Err(not_initialized()));
            }
            (_, true) => {
                self.respond(req.id, Err(invalid_request("server is already initialized")));
            }
            (Lifecycle::ShuttingDown, false) => {
                self.respond(req.id, Err(invalid_request("server is shutting down")));
            }
            (Lifecycle::Ready, false) => {
                let is_shutdown = req.method == Shutdown::METHOD;
                self.route_request(req, cancel, scheduler);
                if is_shutdown {
                    *self.lifecycle.lock() = Lifecycle::ShuttingDown;
                }
            }
        }
    }

    #[cfg(feature = "lsp")]
    fn route_request(
        self: &Arc<Self>,
        req: lsp::Request,
        cancel: CancellationToken,
        scheduler: &Scheduler,
    ) {
        let Some(record) = self.registry.request(&req.method) else {
            log::warn!("unhandled request: {}", req.method);
            self.respond(req.id, Err(method_not_found()));
            return;
        };
        self.invoke_request(record, req.id, req.params, cancel, scheduler, |_, _| {});
    }

    #[cfg(feature = "lsp")]
    fn on_lsp_notification(self: &Arc<Self>, not: lsp::Notification, scheduler: &Scheduler) -> bool {
        use lsp_types::notification::{Cancel, Exit, Initialized, Notification as _};

        let method = not.method.as_str();
        if method == Cancel::METHOD {
            match not.params.get("id").and_then(cancel_target) {
                Some(id) => self.cancel_inbound(&id),
                None => log::warn!("malformed cancel notification"),
            }
            return true;
        }

        if method == Initialized::METHOD {
            if *self.lifecycle.lock() != Lifecycle::Initializing {
                log::warn!("unexpected initialized notification");
            }
            self.mark_ready();
        }

        let is_exit = method == Exit::METHOD;
        let gate = *self.lifecycle.lock();
        match gate {
            Lifecycle::Ready => {
                self.route_notification(not.method, not.params, scheduler);
            }
            state => {
                if is_exit {
                    self.route_notification(not.method, not.params, scheduler);
                } else {
                    log::warn!("dropping notification {method} in state {state:?}");
                }
            }
        }
        !is_exit
    }

    #[cfg(feature = "dap")]
    fn dispatch_dap(self: &Arc<Self>, item: receiver::DapClassified, scheduler: &Scheduler) -> bool {
        match item {
            receiver::DapClassified::Invalid { seq, error } => {
                match seq {
                    Some(request_seq) => {
                        let resp_seq = self.alloc_seq() as i64;
                        // a validation error, never eligible for the legacy
                        // handler-failure code
                        self.enqueue_now(
                            dap::Response::error(resp_seq, request_seq, String::new(), &error, false)
                                .into(),
                        );
                    }
                    None => log::error!("dropping invalid message: {}", error.message),
                }
                true
            }
            receiver::DapClassified::Request(req) => {
                self.on_dap_request(req, scheduler);
                true
            }
            receiver::DapClassified::Event(evt) => {
                self.on_dap_event(evt, scheduler);
                true
            }
            // responses are settled by the receive loop
            receiver::DapClassified::Response(_) => true,
        }
    }

    #[cfg(feature = "dap")]
    fn on_dap_request(self: &Arc<Self>, req: dap::Request, scheduler: &Scheduler) {
        let req_id = RequestId::from(req.seq as i32);
        let cancel = self.root_cancel.child_token();
        self.hook.start_request(&req_id, &req.command);
        self.req_queue.lock().incoming.register(
            req_id.clone(),
            InboundExecution {
                method: req.command.clone(),
                received_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );

        // Answered inline so a cancel can never queue behind the very work
        // it is trying to cancel.
        if req.command == dap::command::CANCEL {
            match req.arguments.get("requestId").and_then(JsonValue::as_i64) {
                Some(target) => {
                    self.cancel_inbound(&RequestId::from(target as i32));
                    self.respond(req_id, Ok(JsonValue::Null));
                }
                None => self.respond(req_id, Err(invalid_params("missing requestId"))),
            }
            return;
        }

        let lifecycle = *self.lifecycle.lock();
        let is_initialize = req.command == dap::command::INITIALIZE;
        match (lifecycle, is_initialize) {
            (Lifecycle::Uninitialized, true) => {
                *self.lifecycle.lock() = Lifecycle::Initializing;
                self.registry.apply_capabilities(&req.arguments);
                // the adapter announces readiness right after a successful
                // initialize response; ready flips first so a request sent
                // on seeing the event is never gated out
                self.route_dap_request(req, req_id, cancel, scheduler, |core, ok| {
                    if ok {
                        core.mark_ready();
                        let seq = core.alloc_seq() as i64;
                        core.enqueue_now(
                            dap::Event::new(
                                seq,
                                dap::event::INITIALIZED.to_owned(),
                                JsonValue::Null,
                            )
                            .into(),
                        );
                    }
                });
            }
            (Lifecycle::Uninitialized | Lifecycle::Initializing, false) => {
                self.respond(req_id, Err(not_initialized()));
            }
            (_, true) => {
                self.respond(req_id, Err(invalid_request("adapter is already initialized")));
            }
            (Lifecycle::ShuttingDown, false) => {
                self.respond(req_id, Err(invalid_request("adapter is shutting down")));
            }
            (Lifecycle::Ready, false) => {
                let is_disconnect = req.command == dap::command::DISCONNECT;
                self.route_dap_request(req, req_id, cancel, scheduler, |_, _| {});
                if is_disconnect {
                    *self.lifecycle.lock() = Lifecycle::ShuttingDown;
                }
            }
        }
    }

    #[cfg(feature = "dap")]
    fn route_dap_request(
        self: &Arc<Self>,
        req: dap::Request,
        id: RequestId,
        cancel: CancellationToken,
        scheduler: &Scheduler,
        after: impl FnOnce(&Arc<ConnectionCore>, bool) + Send + 'static,
    ) {
        let Some(record) = self.registry.request(&req.command) else {
            log::warn!("unhandled command: {}", req.command);
            let error = ResponseError {
                code: ErrorCode::MethodNotFound as i32,
                message: format!("command not found: {}", req.command),
                data: None,
            };
            self.respond(id, Err(error));
            return;
        };
        self.invoke_request(record, id, req.arguments, cancel, scheduler, after);
    }

    #[cfg(feature = "dap")]
    fn on_dap_event(self: &Arc<Self>, evt: dap::Event, scheduler: &Scheduler) {
        let name = evt.event.as_str();
        if name == dap::event::INITIALIZED {
            // the adapter is ready; this side may be a client that never saw
            // an initialize request
            self.mark_ready();
        }

        match *self.lifecycle.lock() {
            Lifecycle::Ready => self.route_notification(evt.event, evt.body, scheduler),
            state => log::warn!("dropping event {name} in state {state:?}"),
        }
    }

    fn invoke_request(
        self: &Arc<Self>,
        record: Arc<HandlerRecord>,
        id: RequestId,
        params: JsonValue,
        cancel: CancellationToken,
        scheduler: &Scheduler,
        after: impl FnOnce(&Arc<ConnectionCore>, bool) + Send + 'static,
    ) {
        let core = self.clone();
        let client = self.client();
        let process = record.process;
        let fut = async move {
            let Invoker::Request(invoke) = &record.invoker else {
                core.respond(id, Err(internal_error("handler kind mismatch")));
                return;
            };
            let handler = std::panic::AssertUnwindSafe(invoke(client, params, cancel.clone()))
                .catch_unwind();
            let (result, from_handler) = tokio::select! {
                biased;
                res = handler => match res {
                    Ok(Ok(value)) => (Ok(value), true),
                    Ok(Err(InvokeError::Handler(err))) => (Err(err), true),
                    Ok(Err(InvokeError::Decode(err))) => (Err(err), false),
                    Err(payload) => (Err(panicked(payload)), true),
                },
                _ = cancel.cancelled() => (Err(request_cancelled()), false),
            };
            let ok = result.is_ok();
            core.respond_with(id, result, from_handler);
            after(&core, ok);
        };
        if !scheduler.dispatch(process, fut) {
            log::warn!("scheduler closed, dropping request");
        }
    }

    fn route_notification(self: &Arc<Self>, method: String, params: JsonValue, scheduler: &Scheduler) {
        let Some(record) = self.registry.notification(&method) else {
            if !(method.starts_with("$/") || method == "initialized" || method == "exit") {
                log::warn!("unhandled notification: {method}");
            }
            return;
        };
        self.hook.start_notification(&method);
        let received_at = Instant::now();
        let core = self.clone();
        let client = self.client();
        let root = self.root_cancel.clone();
        let process = record.process;
        let fut = async move {
            let Invoker::Notification(invoke) = &record.invoker else {
                log::error!("handler kind mismatch for {method}");
                return;
            };
            let handler = std::panic::AssertUnwindSafe(invoke(client, params)).catch_unwind();
            let result = tokio::select! {
                biased;
                res = handler => res.unwrap_or_else(|payload| Err(panicked(payload))),
                _ = root.cancelled() => Err(request_cancelled()),
            };
            core.hook.stop_notification(&method, received_at, result);
        };
        if !scheduler.dispatch(process, fut) {
            log::warn!("scheduler closed, dropping notification");
        }
    }
}

fn panicked(payload: Box<dyn std::any::Any + Send>) -> ResponseError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    let mut error = internal_error("handler panicked");
    error.data = Some(JsonValue::String(detail));
    error
}

#[cfg(feature = "lsp")]
fn cancel_target(value: &JsonValue) -> Option<RequestId> {
    match value {
        JsonValue::Number(num) => Some(RequestId::from(num.as_i64()? as i32)),
        JsonValue::String(s) => Some(RequestId::from(s.clone())),
        _ => None,
    }
}

fn request_method(msg: &Message) -> Option<&str> {
    match msg {
        #[cfg(feature = "lsp")]
        Message::Lsp(lsp::Message::Request(req)) => Some(&req.method),
        #[cfg(feature = "dap")]
        Message::Dap(dap::Message::Request(req)) => Some(&req.command),
        _ => None,
    }
}

fn exempt_from_defer(kind: MessageKind, method: &str) -> bool {
    match kind {
        #[cfg(feature = "lsp")]
        MessageKind::Lsp => {
            use lsp_types::request::{Initialize, Request as _, Shutdown};
            method == Initialize::METHOD || method == Shutdown::METHOD
        }
        #[cfg(feature = "dap")]
        MessageKind::Dap => {
            method == dap::command::INITIALIZE
                || method == dap::command::CANCEL
                || method == dap::command::DISCONNECT
        }
    }
}

/// The cheap handle handlers and embedders use to talk to the peer.
///
/// Holds only weak references; once the connection is gone every send is
/// logged and dropped, mirroring a closed channel.
#[derive(Debug, Clone)]
pub struct Client {
    core: Weak<ConnectionCore>,
}

impl Client {
    /// Sends an untyped request to the peer.
    pub fn send_request_(
        &self,
        method: &str,
        params: JsonValue,
        cancel: Option<CancellationToken>,
    ) -> ResponseFuture {
        let Some(core) = self.core.upgrade() else {
            log::warn!("failed to send request ({method}): connection closed");
            return ResponseFuture::settled(RequestId::from(0), Err(RequestError::Closed));
        };
        core.send_request(method.to_owned(), params, cancel)
    }

    /// Sends an untyped notification (LSP) or event (DAP) to the peer.
    pub fn send_notification_(&self, method: &str, params: JsonValue) {
        let Some(core) = self.core.upgrade() else {
            log::warn!("failed to send notification ({method}): connection closed");
            return;
        };
        let msg: Message = match core.kind {
            #[cfg(feature = "lsp")]
            MessageKind::Lsp => lsp::Notification::new(method.to_owned(), params).into(),
            #[cfg(feature = "dap")]
            MessageKind::Dap => {
                dap::Event::new(core.alloc_seq() as i64, method.to_owned(), params).into()
            }
        };
        core.enqueue(msg);
    }

    /// The handler registry, while the connection is alive.
    pub fn registry(&self) -> Option<Registry> {
        self.core.upgrade().map(|core| core.registry.clone())
    }

    /// Whether the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.core.upgrade().is_some_and(|core| core.is_ready())
    }
}

#[cfg(feature = "lsp")]
impl Client {
    /// Sends a typed LSP request.
    pub fn send_request<R: lsp_types::request::Request>(
        &self,
        params: R::Params,
        cancel: Option<CancellationToken>,
    ) -> impl Future<Output = Result<R::Result, RequestError>> + Send + use<R> {
        let fut = self.send_request_(
            R::METHOD,
            serde_json::to_value(params).unwrap(),
            cancel,
        );
        async move {
            let value = fut.await?;
            serde_json::from_value(value).map_err(|err| {
                RequestError::Response(internal_error(format!("failed to decode response: {err}")))
            })
        }
    }

    /// Sends a typed LSP notification.
    pub fn send_notification<N: lsp_types::notification::Notification>(&self, params: &N::Params) {
        self.send_notification_(N::METHOD, serde_json::to_value(params).unwrap());
    }
}

#[cfg(feature = "dap")]
impl Client {
    /// Sends a typed DAP request.
    pub fn send_command<R: crate::dap::IRequest>(
        &self,
        arguments: R::Arguments,
        cancel: Option<CancellationToken>,
    ) -> impl Future<Output = Result<R::Response, RequestError>> + Send + use<R> {
        let fut = self.send_request_(
            R::COMMAND,
            serde_json::to_value(arguments).unwrap(),
            cancel,
        );
        async move {
            let value = fut.await?;
            serde_json::from_value(value).map_err(|err| {
                RequestError::Response(internal_error(format!("failed to decode response: {err}")))
            })
        }
    }

    /// Sends a typed DAP event.
    pub fn send_event<E: crate::dap::IEvent>(&self, body: E::Body) {
        self.send_notification_(E::EVENT, serde_json::to_value(body).unwrap());
    }
}

/// The surface a handler sees of its connection.
///
/// Breaking the reference cycle between the connection, the registry and the
/// handlers: handlers receive this seam instead of the connection itself.
pub trait Peer: Send + Sync {
    /// Sends a request to the peer.
    fn send_request_(
        &self,
        method: &str,
        params: JsonValue,
        cancel: Option<CancellationToken>,
    ) -> ResponseFuture;
    /// Sends a notification (LSP) or event (DAP) to the peer.
    fn send_notification_(&self, method: &str, params: JsonValue);
    /// The handler registry of the connection, while it is alive.
    fn registry(&self) -> Option<Registry>;
}

impl Peer for Client {
    fn send_request_(
        &self,
        method: &str,
        params: JsonValue,
        cancel: Option<CancellationToken>,
    ) -> ResponseFuture {
        Client::send_request_(self, method, params, cancel)
    }

    fn send_notification_(&self, method: &str, params: JsonValue) {
        Client::send_notification_(self, method, params)
    }

    fn registry(&self) -> Option<Registry> {
        Client::registry(self)
    }
}

/// Configures and builds a [`Connection`].
pub struct ConnectionBuilder {
    kind: MessageKind,
    handle: tokio::runtime::Handle,
    flush_timeout: Duration,
    scheduler_grace: Duration,
    hook: Arc<dyn RpcHook>,
    legacy_error_code: bool,
    registry: Registry,
}

impl ConnectionBuilder {
    /// Creates a builder for the given protocol.
    ///
    /// The runtime behind `handle` executes handler futures and must have
    /// its timer enabled.
    pub fn new(kind: MessageKind, handle: tokio::runtime::Handle) -> ConnectionBuilder {
        ConnectionBuilder {
            kind,
            handle,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            scheduler_grace: DEFAULT_SCHEDULER_GRACE,
            hook: Arc::new(()),
            legacy_error_code: false,
            registry: Registry::new(),
        }
    }

    /// Creates a builder for an LSP connection.
    #[cfg(feature = "lsp")]
    pub fn lsp(handle: tokio::runtime::Handle) -> ConnectionBuilder {
        Self::new(MessageKind::Lsp, handle)
    }

    /// Creates a builder for a DAP connection.
    #[cfg(feature = "dap")]
    pub fn dap(handle: tokio::runtime::Handle) -> ConnectionBuilder {
        Self::new(MessageKind::Dap, handle)
    }

    /// Bounds how long `disconnect(flush)` waits for the outgoing queue.
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Bounds how long scheduler shutdown waits for in-flight handlers.
    pub fn scheduler_grace(mut self, grace: Duration) -> Self {
        self.scheduler_grace = grace;
        self
    }

    /// Injects an observability hook.
    pub fn with_hook(mut self, hook: Arc<dyn RpcHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Makes DAP handler failures carry the original serialiser's error code
    /// 500 instead of the JSON-RPC code.
    pub fn legacy_error_code(mut self, on: bool) -> Self {
        self.legacy_error_code = on;
        self
    }

    /// The registry, for registrations before the connection starts.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Builds the connection over a byte-stream pair. Stdio and pipe pairs
    /// both satisfy this contract; see [`crate::transport`].
    pub fn build(
        self,
        reader: impl BufRead + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Connection {
        let (outgoing_tx, outgoing_rx) = crossbeam_channel::bounded::<Message>(OUTGOING_QUEUE_CAPACITY);
        let outgoing_tx = Arc::new(outgoing_tx);
        let (ready_tx, _) = watch::channel(false);

        let core = Arc::new(ConnectionCore {
            kind: self.kind,
            handle: self.handle,
            hook: self.hook,
            legacy_error_code: self.legacy_error_code,
            flush_timeout: self.flush_timeout,
            registry: self.registry,
            req_queue: Mutex::new(ReqQueue::default()),
            outgoing: Arc::downgrade(&outgoing_tx),
            state: Mutex::new(ConnState::New),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            ready_tx,
            deferred: Mutex::new(Vec::new()),
            root_cancel: CancellationToken::new(),
            disconnected: CancellationToken::new(),
        });

        Connection {
            core,
            outgoing: Some(outgoing_tx),
            outgoing_rx: Some(outgoing_rx),
            io: Some((Box::new(reader), Box::new(writer))),
            scheduler_grace: self.scheduler_grace,
            loops: None,
        }
    }
}

struct Loops {
    shutdown_tx: Sender<()>,
    dispatch: thread::JoinHandle<()>,
    writer: thread::JoinHandle<()>,
}

/// A bidirectional LSP or DAP connection over a byte-stream pair.
pub struct Connection {
    core: Arc<ConnectionCore>,
    outgoing: Option<Arc<Sender<Message>>>,
    outgoing_rx: Option<Receiver<Message>>,
    io: Option<(Box<dyn BufRead + Send>, Box<dyn Write + Send>)>,
    scheduler_grace: Duration,
    loops: Option<Loops>,
}

impl Connection {
    /// Starts the send, receive and dispatch loops, moving New to Open.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.core.state.lock();
            if *state != ConnState::New {
                return Err(ProtocolError::new("connection already started"));
            }
            *state = ConnState::Open;
        }
        let (Some((reader, writer)), Some(outgoing_rx)) = (self.io.take(), self.outgoing_rx.take())
        else {
            return Err(ProtocolError::new("connection already started"));
        };

        let (incoming_tx, incoming_rx) = crossbeam_channel::bounded::<Inbound>(0);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let core = self.core.clone();
        let writer_thread = thread::spawn(move || send_loop(outgoing_rx, writer, core));

        let core = self.core.clone();
        // the receive loop is not joined: it exits when the peer closes the
        // stream, and a blocking read cannot be interrupted portably
        thread::spawn(move || receive_loop(core, reader, incoming_tx));

        let scheduler = Scheduler::new(self.core.handle.clone(), self.scheduler_grace);
        let core = self.core.clone();
        let dispatch_thread =
            thread::spawn(move || dispatch_loop(core, incoming_rx, shutdown_rx, scheduler));

        self.loops = Some(Loops {
            shutdown_tx,
            dispatch: dispatch_thread,
            writer: writer_thread,
        });
        Ok(())
    }

    /// Tears the connection down, moving Open to Draining to Closed.
    ///
    /// With `flush` set, waits up to the flush timeout for the outgoing
    /// queue to drain first. Every pending request settles with
    /// [`RequestError::Closed`]. Idempotent.
    pub fn disconnect(&mut self, flush: bool) {
        {
            let mut state = self.core.state.lock();
            match *state {
                ConnState::Open => *state = ConnState::Draining,
                ConnState::New => {
                    *state = ConnState::Closed;
                    self.core.on_transport_closed();
                    return;
                }
                ConnState::Draining | ConnState::Closed => return,
            }
        }
        *self.core.lifecycle.lock() = Lifecycle::ShuttingDown;

        if flush {
            if let Some(outgoing) = &self.outgoing {
                let deadline = Instant::now() + self.core.flush_timeout;
                while !outgoing.is_empty() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        self.core.root_cancel.cancel();
        let loops = self.loops.take();
        if let Some(loops) = loops {
            // wake the dispatch loop, then let the scheduler drain with its
            // grace period before the writer goes away
            drop(loops.shutdown_tx);
            if loops.dispatch.join().is_err() {
                log::error!("dispatch loop panicked");
            }
            self.core.on_transport_closed();
            self.outgoing.take();
            if loops.writer.join().is_err() {
                log::error!("send loop panicked");
            }
        } else {
            self.core.on_transport_closed();
            self.outgoing.take();
        }

        *self.core.state.lock() = ConnState::Closed;
        log::info!("connection closed");
    }

    /// The transport state.
    pub fn state(&self) -> ConnState {
        *self.core.state.lock()
    }

    /// A cheap handle for handlers and embedders.
    pub fn client(&self) -> Client {
        self.core.client()
    }

    /// The handler registry.
    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    /// Whether the initialisation handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Resolves once the initialisation handshake has completed.
    pub async fn ready(&self) {
        let mut rx = self.core.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Resolves once a transport loop terminated or the connection was torn
    /// down; every pending request has been settled by then.
    pub async fn disconnected(&self) {
        self.core.disconnected.clone().cancelled_owned().await;
    }

    /// Runs the client side of the initialisation handshake.
    ///
    /// LSP: sends `initialize`, applies the result capabilities, fires
    /// `initialized` and marks the connection ready. DAP: sends the
    /// `initialize` request; ready flips when the adapter's `initialized`
    /// event arrives.
    pub async fn initialize(&self, params: JsonValue) -> Result<JsonValue, RequestError> {
        let client = self.client();
        match self.core.kind {
            #[cfg(feature = "lsp")]
            MessageKind::Lsp => {
                use lsp_types::notification::{Initialized, Notification as _};
                use lsp_types::request::{Initialize, Request as _};

                let result = client.send_request_(Initialize::METHOD, params, None).await?;
                if let Some(capabilities) = result.get("capabilities") {
                    self.core.registry.apply_capabilities(capabilities);
                }
                client.send_notification_(Initialized::METHOD, json!({}));
                self.core.mark_ready();
                Ok(result)
            }
            #[cfg(feature = "dap")]
            MessageKind::Dap => {
                let result = client
                    .send_request_(dap::command::INITIALIZE, params, None)
                    .await?;
                self.core.registry.apply_capabilities(&result);
                Ok(result)
            }
        }
    }

    /// Sends `client/registerCapability` with every dynamic registration in
    /// the registry.
    #[cfg(feature = "lsp")]
    pub fn register_capability(&self) -> ResponseFuture {
        use lsp_types::request::{RegisterCapability, Request as _};
        let registrations: Vec<JsonValue> = self
            .core
            .registry
            .dynamic_registrations()
            .into_iter()
            .map(|reg| {
                json!({
                    "id": reg.id,
                    "method": reg.method,
                    "registerOptions": reg.register_options,
                })
            })
            .collect();
        self.client().send_request_(
            RegisterCapability::METHOD,
            json!({ "registrations": registrations }),
            None,
        )
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect(false);
    }
}

fn send_loop(rx: Receiver<Message>, mut writer: Box<dyn Write + Send>, core: Arc<ConnectionCore>) {
    for msg in rx.iter() {
        if let Err(err) = msg.write(&mut writer) {
            if matches!(err.kind(), io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput) {
                log::error!("failed to serialise message: {err}");
                continue;
            }
            log::error!("failed to write message: {err}");
            break;
        }
    }
    log::info!("send loop finished");
    core.on_transport_closed();
}

fn receive_loop(
    core: Arc<ConnectionCore>,
    mut reader: Box<dyn BufRead + Send>,
    incoming_tx: Sender<Inbound>,
) {
    'recv: loop {
        if core.root_cancel.is_cancelled() {
            break;
        }
        let frame = match crate::msg::read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("input stream closed");
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                log::error!("dropping malformed frame: {err}");
                continue;
            }
            Err(err) => {
                log::error!("failed to read frame: {err}");
                break;
            }
        };
        let value: JsonValue = match serde_json::from_str(&frame) {
            Ok(value) => value,
            Err(err) => {
                log::error!("payload is not JSON: {err}");
                core.reply_parse_error(err);
                continue;
            }
        };
        match core.kind {
            #[cfg(feature = "lsp")]
            MessageKind::Lsp => {
                for item in receiver::classify(value) {
                    match item {
                        receiver::Classified::Response(resp) => core.settle_response(resp),
                        item => {
                            if incoming_tx.send(Inbound::Lsp(item)).is_err() {
                                break 'recv;
                            }
                        }
                    }
                }
            }
            #[cfg(feature = "dap")]
            MessageKind::Dap => match receiver::classify_dap(value) {
                receiver::DapClassified::Response(resp) => core.settle_dap_response(resp),
                item => {
                    if incoming_tx.send(Inbound::Dap(item)).is_err() {
                        break 'recv;
                    }
                }
            },
        }
    }
    log::info!("receive loop finished");
    core.on_transport_closed();
}

fn dispatch_loop(
    core: Arc<ConnectionCore>,
    incoming_rx: Receiver<Inbound>,
    shutdown_rx: Receiver<()>,
    mut scheduler: Scheduler,
) {
    loop {
        crossbeam_channel::select! {
            recv(incoming_rx) -> item => {
                let Ok(item) = item else { break };
                let keep_going = match item {
                    #[cfg(feature = "lsp")]
                    Inbound::Lsp(item) => core.dispatch_lsp(item, &scheduler),
                    #[cfg(feature = "dap")]
                    Inbound::Dap(item) => core.dispatch_dap(item, &scheduler),
                };
                if !keep_going {
                    log::info!("peer requested exit");
                    break;
                }
            }
            recv(shutdown_rx) -> _ => break,
        }
    }
    scheduler.shutdown();
    log::info!("dispatch loop finished");
}
