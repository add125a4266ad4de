//! Wire framing for the bucket channel protocol.
//!
//! Frames are UTF-8 text. Bucket commands travel on channel `0` and carry a
//! `0:<command>:` prefix; heartbeats carry no channel prefix. JSON field
//! names are the short names the server expects (`sv`, `ev`, `o`, `v`, ...).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Prefix of every bucket command on the single channel this client uses.
pub const CHANNEL_PREFIX: &str = "0:";
/// Protocol API version sent in the init frame.
pub const API_VERSION: &str = "1.1";
/// Library name sent in the init frame.
pub const LIBRARY_NAME: &str = "simsync";
/// Default upper bound on entries per index page.
pub const DEFAULT_INDEX_PAGE_SIZE: usize = 500;

/// Errors that can occur while decoding a server frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame is shorter than its command prefix: '{0}'")]
    Truncated(String),

    #[error("unrecognized frame: '{0}'")]
    Unrecognized(String),

    #[error("invalid heartbeat counter in '{0}'")]
    Heartbeat(String),

    #[error("invalid entity key '{0}'")]
    EntityKey(String),

    #[error("invalid field operation: {0}")]
    FieldOp(String),

    #[error("invalid {what} payload: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    fn json(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| DecodeError::Json { what, source }
    }
}

/// Kind of mutation a change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "M")]
    Modify,
    #[serde(rename = "-")]
    Delete,
}

/// A single field mutation inside a `Modify` change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFieldOp", into = "RawFieldOp")]
pub enum FieldOp {
    /// `+`: set the field to a literal value.
    Literal(Value),
    /// `-`: remove the field.
    Remove,
    /// `d`: apply a text delta to the current string value.
    Delta(String),
    /// Any other op code. Carried through untouched.
    Unsupported { op: String, value: Option<Value> },
}

#[derive(Serialize, Deserialize)]
struct RawFieldOp {
    o: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<Value>,
}

impl TryFrom<RawFieldOp> for FieldOp {
    type Error = DecodeError;

    fn try_from(raw: RawFieldOp) -> Result<Self, Self::Error> {
        match raw.o.as_str() {
            "+" => Ok(FieldOp::Literal(raw.v.unwrap_or(Value::Null))),
            "-" => Ok(FieldOp::Remove),
            "d" => match raw.v {
                Some(Value::String(delta)) => Ok(FieldOp::Delta(delta)),
                other => Err(DecodeError::FieldOp(format!(
                    "delta operation needs a string value, got {:?}",
                    other
                ))),
            },
            "" => Err(DecodeError::FieldOp("empty op code".to_string())),
            _ => Ok(FieldOp::Unsupported {
                op: raw.o,
                value: raw.v,
            }),
        }
    }
}

impl From<FieldOp> for RawFieldOp {
    fn from(op: FieldOp) -> Self {
        match op {
            FieldOp::Literal(value) => RawFieldOp {
                o: "+".to_string(),
                v: Some(value),
            },
            FieldOp::Remove => RawFieldOp {
                o: "-".to_string(),
                v: None,
            },
            FieldOp::Delta(delta) => RawFieldOp {
                o: "d".to_string(),
                v: Some(Value::String(delta)),
            },
            FieldOp::Unsupported { op, value } => RawFieldOp { o: op, v: value },
        }
    }
}

/// A change record, either submitted by this client or broadcast by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "clientid", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "cv", default, skip_serializing_if = "Option::is_none")]
    pub change_version: Option<String>,
    #[serde(rename = "sv", default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<u64>,
    #[serde(rename = "ev", default, skip_serializing_if = "Option::is_none")]
    pub end_version: Option<u64>,
    #[serde(rename = "id")]
    pub target_id: String,
    #[serde(rename = "o")]
    pub operation: Operation,
    #[serde(rename = "v", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, FieldOp>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ccid: String,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Change {
    /// A `Modify` change with a fresh ccid.
    pub fn modify(target_id: impl Into<String>, values: BTreeMap<String, FieldOp>) -> Self {
        Self {
            client_id: None,
            change_version: None,
            source_version: None,
            end_version: None,
            target_id: target_id.into(),
            operation: Operation::Modify,
            values,
            ccid: generate_ccid(),
            data: None,
        }
    }

    /// A `Delete` change with a fresh ccid.
    pub fn delete(target_id: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            ..Self::modify(target_id, BTreeMap::new())
        }
    }

    /// Sets the version the change was computed against.
    pub fn with_source_version(mut self, version: u64) -> Self {
        self.source_version = Some(version);
        self
    }
}

/// Server notice that a submitted change was not accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeRejection {
    pub error: u16,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ccids: Vec<String>,
}

/// One element of a change broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    Change(Change),
    Rejected(ChangeRejection),
}

/// Reply to the authentication part of the init frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthReply {
    /// Token accepted; carries the user the token belongs to.
    Accepted(String),
    /// Token rejected; carries the server's message.
    Rejected(String),
}

#[derive(Deserialize)]
struct AuthFailure {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    code: Option<u16>,
}

/// One entry of the bucket index.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    #[serde(rename = "v")]
    pub version: u64,
}

/// One page of the bucket index.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexPage {
    #[serde(default)]
    pub current: String,
    #[serde(default)]
    pub index: Vec<IndexEntry>,
    /// Present when more pages follow.
    #[serde(default)]
    pub mark: Option<String>,
}

/// Reply to a single entity request.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReply {
    pub id: String,
    pub version: u64,
    /// `None` when the server does not know the entity.
    pub data: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct EntityBody {
    data: Map<String, Value>,
}

/// Handshake payload of the init frame.
#[derive(Debug, Clone, Serialize)]
pub struct InitRequest {
    pub name: String,
    #[serde(rename = "clientid")]
    pub client_id: String,
    pub api: String,
    pub token: String,
    pub app_id: String,
    pub library: String,
    pub version: String,
}

/// Frames sent by the client.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Init(InitRequest),
    /// Index page request; `mark` continues a previous page.
    Index {
        mark: Option<String>,
        page_size: usize,
    },
    Entity {
        id: String,
        version: u64,
    },
    Change(Change),
    Heartbeat(u64),
}

impl ClientFrame {
    /// Encode the frame as wire text.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(match self {
            ClientFrame::Init(init) => {
                format!("{}init:{}", CHANNEL_PREFIX, serde_json::to_string(init)?)
            }
            ClientFrame::Index { mark, page_size } => format!(
                "{}i::{}::{}",
                CHANNEL_PREFIX,
                mark.as_deref().unwrap_or(""),
                page_size
            ),
            ClientFrame::Entity { id, version } => {
                format!("{}e:{}.{}", CHANNEL_PREFIX, id, version)
            }
            ClientFrame::Change(change) => {
                format!("{}c:{}", CHANNEL_PREFIX, serde_json::to_string(change)?)
            }
            ClientFrame::Heartbeat(count) => format!("h:{}", count),
        })
    }
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Heartbeat(u64),
    Auth(AuthReply),
    Index(IndexPage),
    Entity(EntityReply),
    Changes(Vec<Broadcast>),
}

impl ServerFrame {
    /// Decode one wire frame. Unknown commands are errors, never dropped.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        if let Some(counter) = frame.strip_prefix("h:") {
            return counter
                .trim()
                .parse()
                .map(ServerFrame::Heartbeat)
                .map_err(|_| DecodeError::Heartbeat(frame.to_string()));
        }

        let body = frame
            .strip_prefix(CHANNEL_PREFIX)
            .ok_or_else(|| DecodeError::Unrecognized(frame.to_string()))?;
        let (command, payload) = body
            .split_once(':')
            .ok_or_else(|| DecodeError::Truncated(frame.to_string()))?;
        if payload.is_empty() {
            return Err(DecodeError::Truncated(frame.to_string()));
        }

        match command {
            "auth" => Ok(ServerFrame::Auth(decode_auth(payload)?)),
            "i" => serde_json::from_str(payload)
                .map(ServerFrame::Index)
                .map_err(DecodeError::json("index")),
            "e" => Ok(ServerFrame::Entity(decode_entity(payload)?)),
            "c" => Ok(ServerFrame::Changes(decode_changes(payload)?)),
            _ => Err(DecodeError::Unrecognized(frame.to_string())),
        }
    }
}

fn decode_auth(payload: &str) -> Result<AuthReply, DecodeError> {
    if !payload.starts_with('{') {
        return Ok(AuthReply::Accepted(payload.to_string()));
    }
    let failure: AuthFailure = serde_json::from_str(payload).map_err(DecodeError::json("auth"))?;
    let message = match failure.code {
        Some(code) => format!("{} ({})", failure.msg, code),
        None => failure.msg,
    };
    Ok(AuthReply::Rejected(message))
}

fn decode_entity(payload: &str) -> Result<EntityReply, DecodeError> {
    let (key, body) = payload
        .split_once('\n')
        .ok_or_else(|| DecodeError::Truncated(payload.to_string()))?;
    let (id, version) = key
        .rsplit_once('.')
        .ok_or_else(|| DecodeError::EntityKey(key.to_string()))?;
    let version = version
        .parse()
        .map_err(|_| DecodeError::EntityKey(key.to_string()))?;

    let data = if body.trim() == "?" {
        None
    } else {
        let body: EntityBody = serde_json::from_str(body).map_err(DecodeError::json("entity"))?;
        Some(body.data)
    };

    Ok(EntityReply {
        id: id.to_string(),
        version,
        data,
    })
}

fn decode_changes(payload: &str) -> Result<Vec<Broadcast>, DecodeError> {
    let items = match serde_json::from_str(payload).map_err(DecodeError::json("change"))? {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        other => {
            return Err(DecodeError::FieldOp(format!(
                "change broadcast must be an object or array, got {}",
                other
            )))
        }
    };

    items
        .into_iter()
        .map(|item| {
            if item.get("error").is_some() {
                serde_json::from_value(item)
                    .map(Broadcast::Rejected)
                    .map_err(DecodeError::json("change rejection"))
            } else {
                serde_json::from_value(item)
                    .map(Broadcast::Change)
                    .map_err(DecodeError::json("change"))
            }
        })
        .collect()
}

/// Generate a client change id (ccid) for an outgoing change.
pub fn generate_ccid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate an id for an entity created by this client.
pub fn generate_entity_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
