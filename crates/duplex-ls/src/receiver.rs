//! Classifies parsed JSON values into requests, notifications, responses and
//! invalid items.
//!
//! The serde models in [`crate::lsp`] and [`crate::dap`] decode well-formed
//! messages; this module implements the validation rules the wire demands:
//! protocol-version checks, batch handling, and granular invalid-request
//! reporting that keeps the offending id recoverable for the error reply.

#[cfg(feature = "lsp")]
use serde_json::Map;
use serde_json::Value as JsonValue;

use crate::msg::invalid_request;
#[cfg(feature = "lsp")]
use crate::RequestId;
use crate::ResponseError;

#[cfg(feature = "dap")]
use crate::dap;
#[cfg(feature = "lsp")]
use crate::lsp;

/// A classified LSP wire item.
#[cfg(feature = "lsp")]
#[derive(Debug, Clone)]
pub enum Classified {
    /// A request carrying an id and a method.
    Request(lsp::Request),
    /// A notification carrying a method but no id.
    Notification(lsp::Notification),
    /// A response to a previously sent request.
    Response(lsp::Response),
    /// A value that is not a valid JSON-RPC 2.0 message.
    Invalid {
        /// The id of the offending item, when it could be recovered.
        id: Option<RequestId>,
        /// The error to reply with.
        error: ResponseError,
    },
}

/// Classifies a parsed LSP payload.
///
/// A top-level array is a batch; each element is classified independently
/// and returned in order. An empty batch is invalid.
#[cfg(feature = "lsp")]
pub fn classify(value: JsonValue) -> Vec<Classified> {
    match value {
        JsonValue::Array(items) => {
            if items.is_empty() {
                return vec![Classified::Invalid {
                    id: None,
                    error: invalid_request("Empty batch"),
                }];
            }
            items.into_iter().map(classify_one).collect()
        }
        value => vec![classify_one(value)],
    }
}

#[cfg(feature = "lsp")]
fn classify_one(value: JsonValue) -> Classified {
    let JsonValue::Object(mut obj) = value else {
        return Classified::Invalid {
            id: None,
            error: invalid_request("Invalid request"),
        };
    };

    // Recover the id first so that every later rejection can reference it.
    let has_id = obj.contains_key("id");
    let id = obj.get("id").and_then(parse_id);

    if obj.get("jsonrpc").and_then(JsonValue::as_str) != Some("2.0") {
        return Classified::Invalid {
            id,
            error: invalid_request("Unexpected protocol"),
        };
    }

    if has_id && (obj.contains_key("result") || obj.contains_key("error")) {
        return classify_response(id, &mut obj);
    }

    let method = match obj.get("method").and_then(JsonValue::as_str) {
        Some(method) if !method.trim().is_empty() => method.to_owned(),
        _ => {
            return Classified::Invalid {
                id,
                error: invalid_request("Method not set"),
            };
        }
    };

    let params = obj.remove("params").unwrap_or(JsonValue::Null);
    if !matches!(params, JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_)) {
        return Classified::Invalid {
            id,
            error: invalid_request("Invalid params"),
        };
    }

    match id {
        Some(id) => Classified::Request(lsp::Request { id, method, params }),
        None => Classified::Notification(lsp::Notification { method, params }),
    }
}

#[cfg(feature = "lsp")]
fn classify_response(id: Option<RequestId>, obj: &mut Map<String, JsonValue>) -> Classified {
    let error = match obj.remove("error") {
        Some(JsonValue::Null) | None => None,
        Some(value) => match serde_json::from_value::<ResponseError>(value) {
            Ok(error) => Some(error),
            Err(err) => {
                return Classified::Invalid {
                    id,
                    error: invalid_request(format!("Invalid error object: {err}")),
                };
            }
        },
    };
    Classified::Response(lsp::Response {
        id,
        result: obj.remove("result"),
        error,
    })
}

/// A classified DAP wire item.
#[cfg(feature = "dap")]
#[derive(Debug, Clone)]
pub enum DapClassified {
    /// A request carrying a command.
    Request(dap::Request),
    /// An event pushed without a matching request.
    Event(dap::Event),
    /// A response to a previously sent request.
    Response(dap::Response),
    /// A value that is not a valid DAP envelope.
    Invalid {
        /// The `seq` of the offending item, when it could be recovered.
        seq: Option<i64>,
        /// The error to reply with.
        error: ResponseError,
    },
}

/// Classifies a parsed DAP payload by its `type` property.
#[cfg(feature = "dap")]
pub fn classify_dap(value: JsonValue) -> DapClassified {
    let seq = value.get("seq").and_then(JsonValue::as_i64);
    let invalid = |error: ResponseError| DapClassified::Invalid { seq, error };

    let Some(ty) = value.get("type").and_then(JsonValue::as_str) else {
        return invalid(invalid_request("Unexpected protocol"));
    };
    match ty {
        "request" => match serde_json::from_value::<dap::Request>(value) {
            Ok(req) => DapClassified::Request(req),
            Err(err) => invalid(invalid_request(format!("Invalid request: {err}"))),
        },
        "event" => match serde_json::from_value::<dap::Event>(value) {
            Ok(evt) => DapClassified::Event(evt),
            Err(err) => invalid(invalid_request(format!("Invalid event: {err}"))),
        },
        "response" => match serde_json::from_value::<dap::Response>(value) {
            Ok(resp) => DapClassified::Response(resp),
            Err(err) => invalid(invalid_request(format!("Invalid response: {err}"))),
        },
        other => invalid(invalid_request(format!("Unknown message type: {other}"))),
    }
}

#[cfg(feature = "lsp")]
fn parse_id(value: &JsonValue) -> Option<RequestId> {
    match value {
        JsonValue::Number(num) => {
            let num = num.as_i64()?;
            Some(RequestId::from(num as i32))
        }
        JsonValue::String(s) => Some(RequestId::from(s.clone())),
        _ => None,
    }
}

#[cfg(all(test, feature = "lsp"))]
mod tests {
    use serde_json::json;

    use super::{classify, Classified};

    fn classify_str(text: &str) -> Vec<Classified> {
        classify(serde_json::from_str(text).unwrap())
    }

    #[test]
    fn empty_object_is_unexpected_protocol() {
        let items = classify_str("{}");
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            Classified::Invalid { id: None, error } if error.message == "Unexpected protocol"
        ));
    }

    #[test]
    fn empty_batch_is_invalid() {
        let items = classify_str("[]");
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Classified::Invalid { .. }));
    }

    #[test]
    fn scalar_is_invalid() {
        let items = classify_str("42");
        assert!(matches!(&items[0], Classified::Invalid { .. }));
    }

    #[test]
    fn blank_method_is_rejected() {
        let items = classify(json!({"jsonrpc": "2.0", "id": 1, "method": ""}));
        assert!(matches!(
            &items[0],
            Classified::Invalid { id: Some(id), error }
                if *id == 1.into() && error.message == "Method not set"
        ));
    }

    #[test]
    fn scalar_params_are_rejected() {
        let items = classify(json!({"jsonrpc": "2.0", "id": 1, "method": "m", "params": 3}));
        assert!(matches!(
            &items[0],
            Classified::Invalid { error, .. } if error.message == "Invalid params"
        ));
    }

    #[test]
    fn null_params_are_accepted() {
        let items = classify(json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": null}));
        assert!(matches!(&items[0], Classified::Request(req) if req.method == "ping"));
    }

    #[test]
    fn response_with_error_object() {
        let items =
            classify(json!({"jsonrpc": "2.0", "id": 42, "error": {"code": -32601, "message": "unknown"}}));
        match &items[0] {
            Classified::Response(resp) => {
                assert_eq!(resp.id, Some(42.into()));
                assert_eq!(resp.error.as_ref().unwrap().code, -32601);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    // The specification batch example: sum, notify_hello, subtract,
    // {"foo":"boo"}, foo.get, get_data.
    #[test]
    fn jsonrpc_spec_batch() {
        let items = classify_str(
            r#"[
                {"jsonrpc": "2.0", "method": "sum", "params": [1,2,4], "id": "1"},
                {"jsonrpc": "2.0", "method": "notify_hello", "params": [7]},
                {"jsonrpc": "2.0", "method": "subtract", "params": [42,23], "id": "2"},
                {"foo": "boo"},
                {"jsonrpc": "2.0", "method": "foo.get", "params": {"name": "myself"}, "id": "5"},
                {"jsonrpc": "2.0", "method": "get_data", "id": "9"}
            ]"#,
        );
        assert_eq!(items.len(), 6);
        assert!(matches!(&items[0], Classified::Request(req) if req.method == "sum"));
        assert!(matches!(&items[1], Classified::Notification(not) if not.method == "notify_hello"));
        assert!(matches!(&items[2], Classified::Request(req) if req.method == "subtract"));
        assert!(matches!(
            &items[3],
            Classified::Invalid { error, .. } if error.message == "Unexpected protocol"
        ));
        assert!(matches!(&items[4], Classified::Request(req) if req.method == "foo.get"));
        assert!(matches!(&items[5], Classified::Request(req) if req.method == "get_data"));
    }
}
