//! Conclave wire message schemas and their canonical JSON encoding.
//!
//! Every non-heartbeat frame is an object with exactly one top-level key
//! naming the message type; the value under that key is the message body.
//! A heartbeat has no JSON body at all, only the bare frame delimiter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol version advertised in `login`.
pub const PROTOCOL_VERSION: u32 = 2;

// =============================================================================
// Message bodies
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(rename = "bufferSize")]
    pub buffer_size: u32,
    /// Server heartbeat cadence in seconds.
    pub heartbeat: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Login {
    pub channel_id: String,
    pub access_token: String,
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<bool>,
    #[serde(rename = "protocol", default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub session_id: i64,
    pub seq: u32,
    pub channel_id: String,
    pub generation: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub session_id: i64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leave {
    pub session_id: i64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_device_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Say {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Public {
    pub seq: u32,
    pub session_id: i64,
    pub event: String,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Private {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    pub session_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub event: String,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Whisper {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    pub event: String,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Whispered {
    pub session_ids: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-reported protocol error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

// =============================================================================
// Message union
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum ConclaveMessage {
    /// Bare-delimiter liveness frame; never carries a JSON body.
    Heartbeat,
    Hello(Hello),
    Login(Login),
    Welcome(Welcome),
    Join(Join),
    Leave(Leave),
    Bye,
    Who,
    Say(Say),
    Public(Public),
    Private(Private),
    Whisper(Whisper),
    Whispered(Whispered),
    Ping(Ping),
    Echo(Echo),
    Error(ErrorBody),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageKind {
    Hello,
    Login,
    Welcome,
    Join,
    Leave,
    Bye,
    Who,
    Say,
    Public,
    Private,
    Whisper,
    Whispered,
    Ping,
    Echo,
    Error,
}

impl MessageKind {
    const ALL: [MessageKind; 15] = [
        MessageKind::Hello,
        MessageKind::Login,
        MessageKind::Welcome,
        MessageKind::Join,
        MessageKind::Leave,
        MessageKind::Bye,
        MessageKind::Who,
        MessageKind::Say,
        MessageKind::Public,
        MessageKind::Private,
        MessageKind::Whisper,
        MessageKind::Whispered,
        MessageKind::Ping,
        MessageKind::Echo,
        MessageKind::Error,
    ];

    fn key(self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::Login => "login",
            MessageKind::Welcome => "welcome",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Bye => "bye",
            MessageKind::Who => "who",
            MessageKind::Say => "say",
            MessageKind::Public => "public",
            MessageKind::Private => "private",
            MessageKind::Whisper => "whisper",
            MessageKind::Whispered => "whispered",
            MessageKind::Ping => "ping",
            MessageKind::Echo => "echo",
            MessageKind::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageDecodeError {
    #[error("unrecognized message kind: {key}")]
    UnknownKind { key: String },
    #[error("malformed {kind} body: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn decode_body<T: serde::de::DeserializeOwned>(
    kind: MessageKind,
    body: &Value,
) -> Result<T, MessageDecodeError> {
    serde_json::from_value(body.clone()).map_err(|source| MessageDecodeError::Malformed {
        kind: kind.key(),
        source,
    })
}

impl ConclaveMessage {
    /// Wire key of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConclaveMessage::Heartbeat => "heartbeat",
            ConclaveMessage::Hello(_) => MessageKind::Hello.key(),
            ConclaveMessage::Login(_) => MessageKind::Login.key(),
            ConclaveMessage::Welcome(_) => MessageKind::Welcome.key(),
            ConclaveMessage::Join(_) => MessageKind::Join.key(),
            ConclaveMessage::Leave(_) => MessageKind::Leave.key(),
            ConclaveMessage::Bye => MessageKind::Bye.key(),
            ConclaveMessage::Who => MessageKind::Who.key(),
            ConclaveMessage::Say(_) => MessageKind::Say.key(),
            ConclaveMessage::Public(_) => MessageKind::Public.key(),
            ConclaveMessage::Private(_) => MessageKind::Private.key(),
            ConclaveMessage::Whisper(_) => MessageKind::Whisper.key(),
            ConclaveMessage::Whispered(_) => MessageKind::Whispered.key(),
            ConclaveMessage::Ping(_) => MessageKind::Ping.key(),
            ConclaveMessage::Echo(_) => MessageKind::Echo.key(),
            ConclaveMessage::Error(_) => MessageKind::Error.key(),
        }
    }

    /// Canonical JSON encoding; `None` means the bare-delimiter heartbeat.
    pub fn encode(&self) -> Result<Option<Value>, serde_json::Error> {
        fn keyed(kind: MessageKind, body: Value) -> Option<Value> {
            let mut map = Map::new();
            map.insert(kind.key().to_string(), body);
            Some(Value::Object(map))
        }

        fn wrap<T: Serialize>(
            kind: MessageKind,
            body: &T,
        ) -> Result<Option<Value>, serde_json::Error> {
            Ok(keyed(kind, serde_json::to_value(body)?))
        }

        match self {
            ConclaveMessage::Heartbeat => Ok(None),
            ConclaveMessage::Hello(body) => wrap(MessageKind::Hello, body),
            ConclaveMessage::Login(body) => wrap(MessageKind::Login, body),
            ConclaveMessage::Welcome(body) => wrap(MessageKind::Welcome, body),
            ConclaveMessage::Join(body) => wrap(MessageKind::Join, body),
            ConclaveMessage::Leave(body) => wrap(MessageKind::Leave, body),
            ConclaveMessage::Bye => Ok(keyed(MessageKind::Bye, Value::Object(Map::new()))),
            ConclaveMessage::Who => Ok(keyed(MessageKind::Who, Value::Object(Map::new()))),
            ConclaveMessage::Say(body) => wrap(MessageKind::Say, body),
            ConclaveMessage::Public(body) => wrap(MessageKind::Public, body),
            ConclaveMessage::Private(body) => wrap(MessageKind::Private, body),
            ConclaveMessage::Whisper(body) => wrap(MessageKind::Whisper, body),
            ConclaveMessage::Whispered(body) => wrap(MessageKind::Whispered, body),
            ConclaveMessage::Ping(body) => wrap(MessageKind::Ping, body),
            ConclaveMessage::Echo(body) => wrap(MessageKind::Echo, body),
            ConclaveMessage::Error(body) => wrap(MessageKind::Error, body),
        }
    }

    /// Decode one JSON document into a message.
    ///
    /// A linear first-match scan over known message keys; an empty or
    /// non-object document decodes to [`ConclaveMessage::Heartbeat`].
    pub fn decode(value: &Value) -> Result<ConclaveMessage, MessageDecodeError> {
        let Some(map) = value.as_object() else {
            return Ok(ConclaveMessage::Heartbeat);
        };
        if map.is_empty() {
            return Ok(ConclaveMessage::Heartbeat);
        }

        for kind in MessageKind::ALL {
            let Some(body) = map.get(kind.key()) else {
                continue;
            };
            return Self::decode_kind(kind, body);
        }

        Err(MessageDecodeError::UnknownKind {
            key: first_key(map),
        })
    }

    fn decode_kind(kind: MessageKind, body: &Value) -> Result<ConclaveMessage, MessageDecodeError> {
        Ok(match kind {
            MessageKind::Hello => ConclaveMessage::Hello(decode_body(kind, body)?),
            MessageKind::Login => ConclaveMessage::Login(decode_body(kind, body)?),
            MessageKind::Welcome => ConclaveMessage::Welcome(decode_body(kind, body)?),
            MessageKind::Join => ConclaveMessage::Join(decode_body(kind, body)?),
            MessageKind::Leave => ConclaveMessage::Leave(decode_body(kind, body)?),
            MessageKind::Bye => ConclaveMessage::Bye,
            MessageKind::Who => ConclaveMessage::Who,
            MessageKind::Say => ConclaveMessage::Say(decode_body(kind, body)?),
            MessageKind::Public => ConclaveMessage::Public(decode_body(kind, body)?),
            MessageKind::Private => ConclaveMessage::Private(decode_body(kind, body)?),
            MessageKind::Whisper => ConclaveMessage::Whisper(decode_body(kind, body)?),
            MessageKind::Whispered => ConclaveMessage::Whispered(decode_body(kind, body)?),
            MessageKind::Ping => ConclaveMessage::Ping(decode_body(kind, body)?),
            MessageKind::Echo => ConclaveMessage::Echo(decode_body(kind, body)?),
            MessageKind::Error => ConclaveMessage::Error(decode_body(kind, body)?),
        })
    }
}

fn first_key(map: &Map<String, Value>) -> String {
    map.keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "<none>".to_string())
}
