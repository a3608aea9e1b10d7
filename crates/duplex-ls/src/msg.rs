//! Common wire vocabulary and the `Content-Length` framing codec.

use std::{
    fmt,
    io::{self, BufRead, Write},
};

use serde::{Deserialize, Serialize};

#[cfg(feature = "dap")]
use crate::dap;
#[cfg(feature = "lsp")]
use crate::lsp;

/// A request ID on a connection.
///
/// LSP allows integer and string ids; DAP sequence numbers are integers and
/// are stored in the integer representation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RequestId(IdRepr);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
enum IdRepr {
    I32(i32),
    String(String),
}

impl RequestId {
    /// Returns the integer value of the id, if it is an integer.
    pub fn as_int(&self) -> Option<i32> {
        match &self.0 {
            IdRepr::I32(it) => Some(*it),
            IdRepr::String(_) => None,
        }
    }
}

impl From<i32> for RequestId {
    fn from(id: i32) -> RequestId {
        RequestId(IdRepr::I32(id))
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> RequestId {
        RequestId(IdRepr::String(id))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            IdRepr::I32(it) => fmt::Display::fmt(it, f),
            // Use debug here, to make it clear that `92` and `"92"` are
            // different, and to reduce WTF factor if the peer uses `" "` as
            // an id.
            IdRepr::String(it) => fmt::Debug::fmt(it, f),
        }
    }
}

/// The error object carried by an error response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResponseError {
    /// The error code.
    pub code: i32,
    /// The error message.
    pub message: String,
    /// Additional data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The error codes defined by JSON RPC and the LSP.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum ErrorCode {
    // Defined by JSON RPC:
    /// Invalid JSON was received.
    ParseError = -32700,
    /// The JSON sent is not a valid request object.
    InvalidRequest = -32600,
    /// The method does not exist / is not available.
    MethodNotFound = -32601,
    /// Invalid method parameter(s).
    InvalidParams = -32602,
    /// Internal JSON-RPC error.
    InternalError = -32603,

    /// A request was received before the `initialize` exchange completed.
    ServerNotInitialized = -32002,
    /// A request is missing a required property.
    UnknownErrorCode = -32001,

    // Defined by the protocol:
    /// The peer has cancelled a request and the cancel was detected.
    RequestCanceled = -32800,
    /// The content of a document got modified outside normal conditions.
    ContentModified = -32801,
    /// The server cancelled a request that supports server cancellation.
    ServerCancelled = -32802,
    /// A syntactically correct request failed; the message carries the
    /// human-readable reason.
    RequestFailed = -32803,
}

/// Creates an invalid params error.
pub fn invalid_params(msg: impl fmt::Display) -> ResponseError {
    resp_err(ErrorCode::InvalidParams, msg)
}

/// Creates an internal error.
pub fn internal_error(msg: impl fmt::Display) -> ResponseError {
    resp_err(ErrorCode::InternalError, msg)
}

/// Creates a not initialized error.
pub fn not_initialized() -> ResponseError {
    resp_err(ErrorCode::ServerNotInitialized, "not initialized yet")
}

/// Creates a method not found error.
pub fn method_not_found() -> ResponseError {
    resp_err(ErrorCode::MethodNotFound, "method not found")
}

/// Creates an invalid request error.
pub fn invalid_request(msg: impl fmt::Display) -> ResponseError {
    resp_err(ErrorCode::InvalidRequest, msg)
}

/// Creates a parse error.
pub fn parse_error(msg: impl fmt::Display) -> ResponseError {
    resp_err(ErrorCode::ParseError, msg)
}

/// Creates a request cancelled error.
pub fn request_cancelled() -> ResponseError {
    resp_err(ErrorCode::RequestCanceled, "request cancelled")
}

fn resp_err(code: ErrorCode, msg: impl fmt::Display) -> ResponseError {
    ResponseError {
        code: code as i32,
        message: msg.to_string(),
        data: None,
    }
}

/// The protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// The Language Server Protocol.
    #[cfg(feature = "lsp")]
    Lsp,
    /// The Debug Adapter Protocol.
    #[cfg(feature = "dap")]
    Dap,
}

/// The common message type for either protocol.
#[derive(Debug, Clone)]
pub enum Message {
    /// A message in the LSP protocol.
    #[cfg(feature = "lsp")]
    Lsp(lsp::Message),
    /// A message in the DAP protocol.
    #[cfg(feature = "dap")]
    Dap(dap::Message),
}

impl Message {
    /// Writes the message to the given writer.
    pub fn write<W: Write>(self, writer: &mut W) -> io::Result<()> {
        match self {
            #[cfg(feature = "lsp")]
            Message::Lsp(msg) => msg.write(writer),
            #[cfg(feature = "dap")]
            Message::Dap(msg) => msg.write(writer),
        }
    }

    /// Returns the method (or command/event) name of the message, if any.
    pub fn method(&self) -> Option<&str> {
        match self {
            #[cfg(feature = "lsp")]
            Message::Lsp(lsp::Message::Request(req)) => Some(&req.method),
            #[cfg(feature = "lsp")]
            Message::Lsp(lsp::Message::Notification(not)) => Some(&not.method),
            #[cfg(feature = "lsp")]
            Message::Lsp(lsp::Message::Response(_)) => None,
            #[cfg(feature = "dap")]
            Message::Dap(dap::Message::Request(req)) => Some(&req.command),
            #[cfg(feature = "dap")]
            Message::Dap(dap::Message::Event(evt)) => Some(&evt.event),
            #[cfg(feature = "dap")]
            Message::Dap(dap::Message::Response(_)) => None,
        }
    }
}

/// Reads one framed payload from the input.
///
/// Returns `Ok(None)` when the stream is closed at a message boundary.
/// Malformed headers and a missing or unparseable `Content-Length` surface as
/// [`io::ErrorKind::InvalidData`], which the receive loop logs and skips;
/// other errors are fatal. The payload is decoded as UTF-8 regardless of any
/// `Content-Type` charset parameter.
pub(crate) fn read_frame(inp: &mut dyn BufRead) -> io::Result<Option<String>> {
    let mut size = None;
    let mut buf = String::new();
    loop {
        buf.clear();
        if inp.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        if !buf.ends_with("\r\n") {
            return Err(invalid_data_fmt!("malformed header: {buf:?}"));
        }
        let buf = &buf[..buf.len() - 2];
        if buf.is_empty() {
            break;
        }
        let mut parts = buf.splitn(2, ": ");
        let header_name = parts.next().unwrap();
        let header_value = parts
            .next()
            .ok_or_else(|| invalid_data_fmt!("malformed header: {buf:?}"))?;
        if header_name.eq_ignore_ascii_case("Content-Length") {
            size = Some(header_value.parse::<usize>().map_err(invalid_data)?);
        }
    }
    let size: usize = size.ok_or_else(|| invalid_data_fmt!("no Content-Length"))?;
    let mut buf = buf.into_bytes();
    buf.resize(size, 0);
    inp.read_exact(&mut buf)?;
    let buf = String::from_utf8(buf).map_err(invalid_data)?;
    log::debug!("< {buf}");
    Ok(Some(buf))
}

/// Writes one framed payload and flushes before the next message begins.
pub(crate) fn write_frame(out: &mut dyn Write, msg: &str) -> io::Result<()> {
    log::debug!("> {msg}");
    write!(out, "Content-Length: {}\r\n\r\n", msg.len())?;
    out.write_all(msg.as_bytes())?;
    out.flush()?;
    Ok(())
}

pub(crate) fn invalid_data(
    error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

macro_rules! invalid_data_fmt {
    ($($tt:tt)*) => ($crate::msg::invalid_data(format!($($tt)*)))
}
pub(crate) use invalid_data_fmt;

#[cfg(test)]
mod tests {
    use std::io::BufReader;

    use super::{read_frame, write_frame};

    #[test]
    fn frame_round_trip() {
        let payload = "{\"jsonrpc\":\"2.0\",\"method\":\"exit\"}";
        let mut wire = Vec::new();
        write_frame(&mut wire, payload).unwrap();

        let mut reader = BufReader::new(wire.as_slice());
        let read = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(read, payload);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn frame_round_trip_multibyte() {
        let payload = "{\"method\":\"héllo…\"}";
        let mut wire = Vec::new();
        write_frame(&mut wire, payload).unwrap();
        assert!(
            String::from_utf8_lossy(&wire)
                .starts_with(&format!("Content-Length: {}\r\n", payload.len()))
        );

        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), payload);
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let wire = b"content-length: 2\r\n\r\n{}";
        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), "{}");
    }

    #[test]
    fn other_headers_are_ignored() {
        let wire =
            b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: 2\r\n\r\n{}";
        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), "{}");
    }

    #[test]
    fn missing_content_length_is_invalid_data() {
        let wire = b"Content-Type: application/json\r\n\r\n";
        let mut reader = BufReader::new(wire.as_slice());
        let err = read_frame(&mut reader).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn two_messages_in_one_buffer() {
        let mut wire = Vec::new();
        write_frame(&mut wire, "{\"a\":1}").unwrap();
        write_frame(&mut wire, "{\"b\":2}").unwrap();

        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), "{\"b\":2}");
        assert!(read_frame(&mut reader).unwrap().is_none());
    }
}
