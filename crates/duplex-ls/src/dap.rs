//! The Debug Adapter Protocol message model.
//!
//! DAP wraps every message in an envelope carrying a `seq` number and a
//! `type` tag; requests are matched to responses through `request_seq`.
//! Payloads stay opaque JSON here; typed handlers describe their shapes
//! through [`IRequest`] and [`IEvent`].

use std::io::{self, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::msg::write_frame;
use crate::{ExtractError, ResponseError};

/// Well-known request commands interpreted by the connection driver.
pub mod command {
    /// The handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Cancels an in-flight request; carries `{"requestId": seq}`.
    pub const CANCEL: &str = "cancel";
    /// Ends the debug session.
    pub const DISCONNECT: &str = "disconnect";
}

/// Well-known event names interpreted by the connection driver.
pub mod event {
    /// Emitted by the adapter once it is ready to accept requests.
    pub const INITIALIZED: &str = "initialized";
}

/// A message in the Debug Adapter Protocol.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum Message {
    /// Request messages
    #[serde(rename = "request")]
    Request(Request),
    /// Response messages
    #[serde(rename = "response")]
    Response(Response),
    /// Event messages
    #[serde(rename = "event")]
    Event(Event),
}

/// A request sent to or by the adapter.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Request {
    /// The sequence number of the message.
    pub seq: i64,
    /// The command to execute.
    pub command: String,
    /// Command arguments.
    #[serde(default = "serde_json::Value::default")]
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub arguments: serde_json::Value,
}

/// An event pushed by one side without a matching request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    /// The sequence number of the message.
    pub seq: i64,
    /// The event name.
    pub event: String,
    /// The event body.
    #[serde(default = "serde_json::Value::default")]
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,
}

/// The answer to a previously received request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Response {
    /// The sequence number of the message, drawn from the same counter as
    /// request sequence numbers.
    pub seq: i64,
    /// The `seq` of the request this responds to.
    pub request_seq: i64,
    /// Whether the request succeeded.
    pub success: bool,
    /// The command of the request this responds to.
    pub command: String,
    /// The error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The result body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

impl Message {
    /// Writes the DAP message to the writer.
    pub fn write(self, w: &mut dyn Write) -> io::Result<()> {
        let text = serde_json::to_string(&self)?;
        write_frame(w, &text)
    }
}

impl Request {
    /// Creates a request with the given sequence number.
    pub fn new<A: Serialize>(seq: i64, command: String, arguments: A) -> Request {
        Request {
            seq,
            command,
            arguments: serde_json::to_value(arguments).unwrap(),
        }
    }

    /// Extracts typed arguments, checking the command name.
    pub fn extract<A: DeserializeOwned>(self, command: &str) -> Result<(i64, A), ExtractError<Request>> {
        if self.command != command {
            return Err(ExtractError::MethodMismatch(self));
        }
        match serde_json::from_value(self.arguments) {
            Ok(arguments) => Ok((self.seq, arguments)),
            Err(error) => Err(ExtractError::JsonError {
                method: self.command,
                error,
            }),
        }
    }
}

impl Event {
    /// Creates an event with the given sequence number.
    pub fn new<B: Serialize>(seq: i64, event: String, body: B) -> Event {
        Event {
            seq,
            event,
            body: serde_json::to_value(body).unwrap(),
        }
    }
}

impl Response {
    /// Creates a success response.
    pub fn success(seq: i64, request_seq: i64, command: String, body: serde_json::Value) -> Response {
        Response {
            seq,
            request_seq,
            success: true,
            command,
            message: None,
            body: (!body.is_null()).then_some(body),
        }
    }

    /// Creates an error response.
    ///
    /// The error body carries the numeric code of `error`; when `legacy_code`
    /// is set the original serialiser's fixed 500 is used instead.
    pub fn error(
        seq: i64,
        request_seq: i64,
        command: String,
        error: &ResponseError,
        legacy_code: bool,
    ) -> Response {
        let id = if legacy_code { 500 } else { error.code as i64 };
        Response {
            seq,
            request_seq,
            success: false,
            command,
            message: Some(error.message.clone()),
            body: Some(serde_json::json!({
                "error": { "id": id, "format": error.message }
            })),
        }
    }
}

impl TryFrom<crate::Message> for Message {
    type Error = anyhow::Error;

    fn try_from(msg: crate::Message) -> anyhow::Result<Self> {
        match msg {
            #[cfg(feature = "lsp")]
            crate::Message::Lsp(msg) => anyhow::bail!("unexpected LSP message: {msg:?}"),
            crate::Message::Dap(msg) => Ok(msg),
        }
    }
}

impl From<Request> for crate::Message {
    fn from(request: Request) -> crate::Message {
        crate::Message::Dap(request.into())
    }
}

impl From<Response> for crate::Message {
    fn from(response: Response) -> crate::Message {
        crate::Message::Dap(response.into())
    }
}

impl From<Event> for crate::Message {
    fn from(event: Event) -> crate::Message {
        crate::Message::Dap(event.into())
    }
}

/// The shape of a DAP request, mirroring how LSP handlers describe
/// themselves through `lsp_types::request::Request`.
pub trait IRequest {
    /// The command name.
    const COMMAND: &'static str;
    /// The argument type.
    type Arguments: DeserializeOwned + Serialize + Send;
    /// The response body type.
    type Response: DeserializeOwned + Serialize + 'static;
}

/// The shape of a DAP event.
pub trait IEvent {
    /// The event name.
    const EVENT: &'static str;
    /// The body type.
    type Body: DeserializeOwned + Serialize + Send;
}

#[cfg(test)]
mod tests {
    use super::{Event, Message, Request};

    #[test]
    fn classify_by_type_tag() {
        let text = "{\"seq\":7,\"type\":\"event\",\"event\":\"initialized\"}";
        let msg: Message = serde_json::from_str(text).unwrap();
        assert!(matches!(msg, Message::Event(evt) if evt.event == "initialized" && evt.seq == 7));

        let text = "{\"seq\":1,\"type\":\"request\",\"command\":\"initialize\",\"arguments\":{}}";
        let msg: Message = serde_json::from_str(text).unwrap();
        assert!(matches!(msg, Message::Request(req) if req.command == "initialize"));
    }

    #[test]
    fn serialize_response_without_body() {
        let resp = super::Response::success(3, 2, "cancel".into(), serde_json::Value::Null);
        let text = serde_json::to_string(&Message::from(resp)).unwrap();
        assert_eq!(
            text,
            "{\"type\":\"response\",\"seq\":3,\"request_seq\":2,\"success\":true,\"command\":\"cancel\"}"
        );
    }

    #[test]
    fn serialize_event_without_body() {
        let evt = Event::new(9, "initialized".into(), serde_json::Value::Null);
        let text = serde_json::to_string(&Message::from(evt)).unwrap();
        assert_eq!(text, "{\"type\":\"event\",\"seq\":9,\"event\":\"initialized\"}");
    }

    #[test]
    fn request_extract_checks_command() {
        let req = Request::new(1, "cancel".into(), serde_json::json!({"requestId": 4}));
        let err = req.clone().extract::<serde_json::Value>("disconnect");
        assert!(err.is_err());

        #[derive(serde::Deserialize)]
        struct CancelArgs {
            #[serde(rename = "requestId")]
            request_id: i64,
        }
        let (seq, args) = req.extract::<CancelArgs>("cancel").unwrap();
        assert_eq!(seq, 1);
        assert_eq!(args.request_id, 4);
    }
}
