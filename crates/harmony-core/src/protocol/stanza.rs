//! Stanzas exchanged with a hub over an authenticated session link.
//!
//! The transport envelope (XMPP `iq`/`message` framing) belongs to the link
//! implementation.  Sessions only deal with three shapes:
//!
//! ```text
//! session ──► hub   Request  { id, command, body }   body is wire-codec text
//! hub ──► session   Response { id, body }             id echoes the request
//! hub ──► session   Event    { kind, body }           unsolicited notification
//! ```

use serde_json::Value;

use super::codec::{self, WireMap};

/// Mime prefix for engine commands; the command name follows the `?`.
pub const ENGINE_MIME: &str = "vnd.logitech.harmony/vnd.logitech.harmony.engine";

/// Event kind carrying the hub's activity state digest.
pub const STATE_DIGEST_NOTIFY: &str = "connect.stateDigest?notify";

/// Engine commands used by sessions.
pub mod command {
    pub const CONFIG: &str = "config";
    pub const GET_CURRENT_ACTIVITY: &str = "getCurrentActivity";
    pub const START_ACTIVITY: &str = "startactivity";
    pub const HOLD_ACTION: &str = "holdAction";
}

/// One unit of traffic on a session link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    /// Outbound engine command.
    Request {
        id: String,
        command: String,
        body: String,
    },
    /// Reply to a request, correlated by `id`.
    Response { id: String, body: String },
    /// Unsolicited notification such as [`STATE_DIGEST_NOTIFY`].
    Event { kind: String, body: String },
}

impl Stanza {
    /// Builds a request stanza with a wire-encoded body.
    pub fn request(id: impl Into<String>, command: &str, body: &WireMap) -> Self {
        Stanza::Request {
            id: id.into(),
            command: command.to_string(),
            body: codec::encode(body),
        }
    }

    /// Returns the correlation id for requests and responses.
    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Request { id, .. } | Stanza::Response { id, .. } => Some(id),
            Stanza::Event { .. } => None,
        }
    }

    /// Full mime string for a request, e.g. `...harmony.engine?config`.
    pub fn mime(&self) -> Option<String> {
        match self {
            Stanza::Request { command, .. } => Some(format!("{ENGINE_MIME}?{command}")),
            _ => None,
        }
    }
}

/// Parsed body of a response stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// JSON payloads, e.g. the `config` reply.
    Json(Value),
    /// Wire-codec payloads, e.g. `result=12345`.
    Fields(WireMap),
    /// Nothing decodable was returned.
    Empty,
}

impl ResponseBody {
    /// Parses a response body: JSON first, then the wire codec.
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return ResponseBody::Empty;
        }
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            if json.is_object() || json.is_array() {
                return ResponseBody::Json(json);
            }
        }
        match codec::decode(trimmed) {
            Some(fields) => ResponseBody::Fields(fields),
            None => {
                tracing::debug!(len = trimmed.len(), "response body not decodable");
                ResponseBody::Empty
            }
        }
    }

    /// Looks up a scalar field in either representation.
    pub fn field(&self, name: &str) -> Option<String> {
        match self {
            ResponseBody::Json(json) => json.get(name).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            ResponseBody::Fields(fields) => {
                fields.get(name).and_then(|v| v.as_str()).map(str::to_string)
            }
            ResponseBody::Empty => None,
        }
    }
}
