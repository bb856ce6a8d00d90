//! Wire message types and command normalization.
//!
//! # Message shapes
//!
//! | Shape | Direction | Purpose |
//! |-------|-----------|---------|
//! | [`OutboundCommand`] | Gateway → Extension | Bridged command |
//! | reply (`{"id", "response"/"error"}`) | Extension → Gateway | Correlated reply |
//! | identify (`{"action":"identify"}`) | Extension → Gateway | Peer identification |
//! | event (`{"event", ...}`) | Extension → Gateway | Unsolicited notification |
//!
//! HTTP callers send loosely-shaped bodies; [`CommandRequest`] resolves the
//! `action`/`name` and `params`/`payload`/`arguments` fallbacks into the
//! single outbound shape by ordered preference, rejecting bodies that name
//! no action at all.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;

// ============================================================================
// Constants
// ============================================================================

/// Prefix stripped from `name`-style actions (`browser_getTabs` → `getTabs`).
const ACTION_NAME_PREFIX: &str = "browser_";

// ============================================================================
// OutboundCommand
// ============================================================================

/// A bridged command on its way to the browser peer.
///
/// # Format
///
/// ```json
/// { "action": "getTabs", "id": "uuid", "payload": {} }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundCommand {
    /// Action name understood by the extension.
    pub action: String,

    /// Correlation id echoed back in the reply.
    pub id: CorrelationId,

    /// Action arguments.
    pub payload: Value,
}

impl OutboundCommand {
    /// Creates an outbound command with a freshly generated correlation id.
    #[inline]
    #[must_use]
    pub fn new(action: String, payload: Value) -> Self {
        Self {
            action,
            id: CorrelationId::generate(),
            payload,
        }
    }
}

// ============================================================================
// CommandRequest
// ============================================================================

/// Loosely-shaped `POST /command` body.
///
/// Callers differ in which field names they use; resolution order is fixed
/// and explicit rather than guessed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    /// Explicit action name; wins over `name`.
    #[serde(default)]
    pub action: Option<String>,

    /// Tool-style name, optionally carrying the `browser_` prefix.
    #[serde(default)]
    pub name: Option<String>,

    /// Preferred arguments field.
    #[serde(default)]
    pub params: Option<Value>,

    /// Second-choice arguments field.
    #[serde(default)]
    pub payload: Option<Value>,

    /// Third-choice arguments field.
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl CommandRequest {
    /// Parses a request body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed JSON.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Resolves the body into an [`OutboundCommand`] by ordered preference.
    ///
    /// `action` is taken verbatim when present; otherwise `name` is used
    /// with a leading `browser_` stripped. The payload is the first present
    /// of `params`, `payload`, `arguments`, defaulting to `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCommand`] when neither `action` nor `name`
    /// is present.
    pub fn resolve(self) -> Result<OutboundCommand> {
        let action = match (self.action, self.name) {
            (Some(action), _) => action,
            (None, Some(name)) => name
                .strip_prefix(ACTION_NAME_PREFIX)
                .unwrap_or(&name)
                .to_string(),
            (None, None) => {
                return Err(Error::invalid_command(
                    "request names no action (missing both `action` and `name`)",
                ));
            }
        };

        let payload = self
            .params
            .or(self.payload)
            .or(self.arguments)
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(OutboundCommand::new(action, payload))
    }
}

// ============================================================================
// InboundMessage
// ============================================================================

/// Classification of a JSON message received from a browser peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Carries a top-level string `id`: a candidate correlated reply.
    Reply {
        /// The echoed correlation id, as sent on the wire.
        id: String,
    },
    /// `{"action": "identify", "browserName"?: ...}` peer identification.
    Identify {
        /// Self-reported browser name, if any.
        browser_name: Option<String>,
    },
    /// Anything else: an unsolicited event for the delegate.
    Event,
}

impl InboundMessage {
    /// Classifies a decoded peer message.
    #[must_use]
    pub fn classify(message: &Value) -> Self {
        if let Some(id) = message.get("id").and_then(Value::as_str) {
            return Self::Reply { id: id.to_string() };
        }

        if message.get("action").and_then(Value::as_str) == Some("identify") {
            return Self::Identify {
                browser_name: message
                    .get("browserName")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
        }

        Self::Event
    }
}

// ============================================================================
// Reply Body
// ============================================================================

/// Builds the HTTP response body for a correlated reply.
///
/// Preference order: the `error` field (wrapped as `{"error": ...}`), then
/// the `response` field (flattened when it is an object, wrapped as
/// `{"result": ...}` otherwise), then the whole message minus its `id`.
#[must_use]
pub fn correlated_reply_body(message: &Value) -> Value {
    if let Some(error) = message.get("error") {
        return serde_json::json!({ "error": error });
    }

    if let Some(response) = message.get("response") {
        return match response {
            Value::Object(_) => response.clone(),
            other => serde_json::json!({ "result": other }),
        };
    }

    match message {
        Value::Object(map) => {
            let remainder: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "id")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(remainder)
        }
        other => other.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
