//! Engine.IO v4 / Socket.IO v4 text framing.

use serde::Deserialize;
use serde_json::Value;

use super::ControlError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub sid: String,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Noop,
}

impl EnginePacket {
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ControlError::Protocol("empty engine packet".to_string()))?;
        let body = chars.as_str();
        match kind {
            '0' => Ok(Self::Open(serde_json::from_str(body)?)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(body.to_string())),
            '3' => Ok(Self::Pong(body.to_string())),
            '4' => Ok(Self::Message(body.to_string())),
            '6' => Ok(Self::Noop),
            other => Err(ControlError::Protocol(format!(
                "unknown engine packet type {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl SocketPacket {
    /// Parse the payload of an engine `4` message.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let mut rest = text;
        let kind = rest
            .chars()
            .next()
            .ok_or_else(|| ControlError::Protocol("empty socket packet".to_string()))?;
        rest = &rest[kind.len_utf8()..];

        // `/namespace,` prefix for anything but the main namespace
        if rest.starts_with('/') {
            rest = match rest.find(',') {
                Some(idx) => &rest[idx + 1..],
                None => "",
            };
        }

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| ControlError::Protocol(format!("bad packet id: {}", e)))?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let payload = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(rest)?)
        };

        match kind {
            '0' => Ok(Self::Connect(payload)),
            '1' => Ok(Self::Disconnect),
            '2' => {
                let mut args = into_array(payload)?;
                if args.is_empty() {
                    return Err(ControlError::Protocol("event without a name".to_string()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(ControlError::Protocol(format!(
                            "event name is not a string: {}",
                            other
                        )))
                    }
                };
                Ok(Self::Event { id, name, args })
            }
            '3' => {
                let id = id.ok_or_else(|| ControlError::Protocol("ack without id".to_string()))?;
                Ok(Self::Ack {
                    id,
                    args: into_array(payload)?,
                })
            }
            '4' => Ok(Self::ConnectError(payload.unwrap_or(Value::Null))),
            other => Err(ControlError::Protocol(format!(
                "unsupported socket packet type {:?}",
                other
            ))),
        }
    }
}

fn into_array(payload: Option<Value>) -> Result<Vec<Value>, ControlError> {
    match payload {
        Some(Value::Array(values)) => Ok(values),
        None => Ok(Vec::new()),
        Some(other) => Err(ControlError::Protocol(format!(
            "expected an array payload, got {}",
            other
        ))),
    }
}

/// `40{"token":...}`
pub fn encode_connect(token: &str) -> String {
    format!("40{}", serde_json::json!({ "token": token }))
}

pub fn encode_disconnect() -> String {
    "41".to_string()
}

/// `42<id>["name",data]`, or `42<id>["name"]` without data.
pub fn encode_event(id: u64, name: &str, data: Option<&Value>) -> Result<String, ControlError> {
    let body = match data {
        Some(data) => serde_json::to_string(&serde_json::json!([name, data]))?,
        None => serde_json::to_string(&serde_json::json!([name]))?,
    };
    Ok(format!("42{}{}", id, body))
}

/// Outcome of an acknowledged request.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Success(Value),
    /// The coordinator answered without error but with a falsy result.
    Kicked,
    Failure(String),
}

impl Ack {
    /// The coordinator acks with one `[err, result]` argument. Servers that
    /// spread the pair into two arguments are accepted too.
    pub fn from_args(mut args: Vec<Value>) -> Self {
        let pair = match args.len() {
            1 if args[0].is_array() => match args.remove(0) {
                Value::Array(pair) => pair,
                _ => Vec::new(),
            },
            _ => args,
        };
        let mut pair = pair.into_iter();
        let err = pair.next().unwrap_or(Value::Null);
        let result = pair.next().unwrap_or(Value::Null);

        if !err.is_null() {
            return Self::Failure(error_message(&err));
        }
        match result {
            Value::Null | Value::Bool(false) => Self::Kicked,
            value => Self::Success(value),
        }
    }
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(message) => message.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}
