use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// RPC methods the client issues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish,
    Ping,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Publish => "publish",
            Method::Ping => "ping",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectParams {
    pub token: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelParams {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishParams {
    pub channel: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingParams {}

/// Method-specific request parameters.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Params {
    Connect(ConnectParams),
    Subscribe(ChannelParams),
    Unsubscribe(ChannelParams),
    Publish(PublishParams),
    Ping(PingParams),
}

impl Params {
    pub fn method(&self) -> Method {
        match self {
            Params::Connect(_) => Method::Connect,
            Params::Subscribe(_) => Method::Subscribe,
            Params::Unsubscribe(_) => Method::Unsubscribe,
            Params::Publish(_) => Method::Publish,
            Params::Ping(_) => Method::Ping,
        }
    }
}

/// Outbound request envelope: `{"id", "method", "params"}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    pub params: Params,
}

impl Request {
    pub fn new(id: u64, params: Params) -> Self {
        Self {
            id,
            method: params.method(),
            params,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One inbound protocol object: either a reply correlated by `id` or a push.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<String>,
}

impl Reply {
    /// Correlation id, treating `0` as absent.
    pub fn correlation_id(&self) -> Option<u64> {
        self.id.filter(|id| *id != 0)
    }

    /// Body of the reply: `result`, falling back to `params`.
    pub fn body(&self) -> Option<&Value> {
        self.result.as_ref().or(self.params.as_ref())
    }

    /// Splits the reply into its result or its server error.
    ///
    /// Errors are recognised both at the envelope level and nested inside
    /// `result.error`.
    pub fn into_outcome(self) -> Result<Value, ServerError> {
        if let Some(error) = self.error.as_ref().filter(|error| !error.is_null()) {
            return Err(ServerError::from_value(error));
        }
        let result = self.result.or(self.params).unwrap_or(Value::Null);
        if let Some(error) = result.get("error").filter(|error| !error.is_null()) {
            return Err(ServerError::from_value(error));
        }
        Ok(result)
    }

    /// Classifies a reply without correlation history.
    pub fn push_kind(&self) -> PushKind {
        match self.method.as_deref() {
            None | Some("message") | Some("publication") => PushKind::Publication,
            Some("disconnect") => PushKind::Disconnect,
            Some(other) => PushKind::Unknown(other.to_string()),
        }
    }
}

/// Routing category for asynchronous server pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Publication,
    Disconnect,
    Unknown(String),
}

/// Error object reported by the server.
///
/// The server may send either a bare string or an object with `code` and
/// `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u64>,
    pub message: String,
}

impl ServerError {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self {
                code: None,
                message: message.clone(),
            },
            Value::Object(map) => Self {
                code: map.get("code").and_then(Value::as_u64),
                message: map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string()),
            },
            other => Self {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Message published to a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Publication {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

/// Result body of a `connect` reply.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ConnectResult {
    #[serde(default)]
    pub client: Option<String>,
}

/// Result body of a `subscribe` reply.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SubscribeResult {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub messages: Vec<Publication>,
}

/// Server instruction carried by a disconnect push or a close frame reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectDirective {
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

impl Default for DisconnectDirective {
    fn default() -> Self {
        Self {
            reason: String::new(),
            reconnect: true,
        }
    }
}

impl DisconnectDirective {
    /// Parses a close-frame reason; anything that is not a JSON directive
    /// keeps the text as the reason and allows reconnecting.
    pub fn from_close_reason(reason: Option<&str>) -> Self {
        let Some(text) = reason.map(str::trim).filter(|text| !text.is_empty()) else {
            return Self::default();
        };
        serde_json::from_str(text).unwrap_or_else(|_| Self {
            reason: text.to_string(),
            reconnect: true,
        })
    }
}

fn default_reconnect() -> bool {
    true
}

/// Failure to decode an inbound frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected an object or an array of objects, got {0}")]
    UnexpectedShape(&'static str),
}

/// Decodes one transport frame into protocol objects, preserving array order.
///
/// Array elements that do not have the reply shape are dropped with a
/// diagnostic; the remaining elements are still returned.
pub fn decode_frame(text: &str) -> Result<Vec<Reply>, FrameError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(vec![serde_json::from_value(Value::Object(map))?]),
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value::<Reply>(item) {
                Ok(reply) => Some(reply),
                Err(err) => {
                    warn!(event = "batch_element_dropped", index, error = %err);
                    None
                }
            })
            .collect()),
        Value::Null => Err(FrameError::UnexpectedShape("null")),
        Value::Bool(_) => Err(FrameError::UnexpectedShape("bool")),
        Value::Number(_) => Err(FrameError::UnexpectedShape("number")),
        Value::String(_) => Err(FrameError::UnexpectedShape("string")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_envelope_uses_wire_field_names() {
        let request = Request::new(
            3,
            Params::Publish(PublishParams {
                channel: "news".to_string(),
                data: json!({"text": "hi"}),
            }),
        );
        let value: Value = serde_json::from_str(&request.to_text().expect("encode")).unwrap();
        assert_eq!(
            value,
            json!({"id": 3, "method": "publish", "params": {"channel": "news", "data": {"text": "hi"}}})
        );
    }

    #[test]
    fn ping_request_carries_empty_params() {
        let request = Request::new(9, Params::Ping(PingParams::default()));
        let value: Value = serde_json::from_str(&request.to_text().expect("encode")).unwrap();
        assert_eq!(value, json!({"id": 9, "method": "ping", "params": {}}));
    }

    #[test]
    fn connect_request_carries_token_and_data() {
        let request = Request::new(
            1,
            Params::Connect(ConnectParams {
                token: "jwt".to_string(),
                data: json!({}),
            }),
        );
        let value: Value = serde_json::from_str(&request.to_text().expect("encode")).unwrap();
        assert_eq!(value["method"], "connect");
        assert_eq!(value["params"]["token"], "jwt");
        assert_eq!(value["params"]["data"], json!({}));
    }

    #[test]
    fn single_object_and_batch_decode_in_order() {
        let single = decode_frame(r#"{"id":1,"result":{"client":"abc"}}"#).expect("single");
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].correlation_id(), Some(1));

        let batch = decode_frame(
            r#"[{"id":2,"result":{}},{"result":{"channel":"a","data":1}},{"id":3,"result":{}}]"#,
        )
        .expect("batch");
        let ids: Vec<Option<u64>> = batch.iter().map(Reply::correlation_id).collect();
        assert_eq!(ids, vec![Some(2), None, Some(3)]);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(decode_frame("{not json"), Err(FrameError::Json(_))));
        assert!(matches!(
            decode_frame("42"),
            Err(FrameError::UnexpectedShape("number"))
        ));
        assert!(matches!(
            decode_frame(r#"{"id":"seven"}"#),
            Err(FrameError::Json(_))
        ));
    }

    #[test]
    fn malformed_batch_elements_are_skipped() {
        let batch = decode_frame(r#"[{"id":1}, 5, {"id":"x"}, {"id":2}]"#).expect("batch");
        let ids: Vec<Option<u64>> = batch.iter().map(Reply::correlation_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }

    #[test]
    fn zero_id_is_treated_as_push() {
        let reply = decode_frame(r#"{"id":0,"result":{"channel":"c"}}"#).unwrap().remove(0);
        assert_eq!(reply.correlation_id(), None);
        assert_eq!(reply.push_kind(), PushKind::Publication);
    }

    #[test]
    fn outcome_recognises_envelope_and_nested_errors() {
        let envelope: Reply =
            serde_json::from_value(json!({"id": 1, "error": {"code": 103, "message": "permission denied"}}))
                .unwrap();
        let err = envelope.into_outcome().expect_err("envelope error");
        assert_eq!(err.code, Some(103));
        assert_eq!(err.to_string(), "103: permission denied");

        let nested: Reply =
            serde_json::from_value(json!({"id": 1, "result": {"client": null, "error": "bad token"}}))
                .unwrap();
        let err = nested.into_outcome().expect_err("nested error");
        assert_eq!(err, ServerError { code: None, message: "bad token".to_string() });

        let ok: Reply = serde_json::from_value(json!({"id": 1, "result": {"status": true}})).unwrap();
        assert_eq!(ok.into_outcome().expect("ok"), json!({"status": true}));
    }

    #[test]
    fn push_kind_routes_by_method() {
        let disconnect: Reply =
            serde_json::from_value(json!({"method": "disconnect", "result": {"reason": "shutdown"}}))
                .unwrap();
        assert_eq!(disconnect.push_kind(), PushKind::Disconnect);

        let odd: Reply = serde_json::from_value(json!({"method": "join"})).unwrap();
        assert_eq!(odd.push_kind(), PushKind::Unknown("join".to_string()));
    }

    #[test]
    fn disconnect_directive_defaults_to_reconnect() {
        let directive: DisconnectDirective = serde_json::from_value(json!({"reason": "shutdown"})).unwrap();
        assert!(directive.reconnect);

        let parsed = DisconnectDirective::from_close_reason(Some(r#"{"reason":"banned","reconnect":false}"#));
        assert_eq!(parsed.reason, "banned");
        assert!(!parsed.reconnect);

        let plain = DisconnectDirective::from_close_reason(Some("going away"));
        assert_eq!(plain.reason, "going away");
        assert!(plain.reconnect);

        assert_eq!(DisconnectDirective::from_close_reason(None), DisconnectDirective::default());
    }

    #[test]
    fn subscribe_result_fills_missing_message_fields() {
        let result: SubscribeResult = serde_json::from_value(json!({
            "channel": "news",
            "messages": [{"uid": "m1", "data": {"n": 1}}, {"data": 2}]
        }))
        .unwrap();
        assert_eq!(result.channel.as_deref(), Some("news"));
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].uid.as_deref(), Some("m1"));
        assert_eq!(result.messages[1].channel, "");
    }
}
