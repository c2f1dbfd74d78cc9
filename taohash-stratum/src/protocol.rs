use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Stratum error code for a message that is illegal in the session's
/// current protocol state.
pub const ERR_INVALID_STATE: i64 = 20;

/// Stratum JSON-RPC request or notification (notifications carry a null id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Stratum JSON-RPC response.
///
/// All three fields are serialized unconditionally so that responses written
/// to the wire carry an explicit `"error": null`, which is what ASIC firmware
/// expects from a V1 pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// A single line of Stratum traffic, classified by shape.
///
/// Requests are tried first: anything carrying a `method` key is a request or
/// notification, everything else is a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StratumMessage {
    Request(StratumRequest),
    Response(StratumResponse),
}

/// Stratum V1 method names
pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const CONFIGURE: &str = "mining.configure";
    pub const NOTIFY: &str = "mining.notify";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
    pub const SET_EXTRANONCE: &str = "mining.set_extranonce";
    pub const SUGGEST_DIFFICULTY: &str = "mining.suggest_difficulty";
    pub const SUGGEST_TARGET: &str = "mining.suggest_target";
    pub const EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";
}

/// Parse one line of traffic into a classified message.
pub fn parse_line(line: &str) -> serde_json::Result<StratumMessage> {
    serde_json::from_str(line)
}

impl StratumMessage {
    /// Serialize back to a single wire line (no trailing newline; the codec
    /// appends it).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Method name, when this is a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            StratumMessage::Request(req) => Some(&req.method),
            StratumMessage::Response(_) => None,
        }
    }

    /// Message id, if present and non-null.
    pub fn id(&self) -> Option<&Value> {
        match self {
            StratumMessage::Request(req) => req.id.as_ref(),
            StratumMessage::Response(resp) => resp.id.as_ref(),
        }
    }
}

impl StratumRequest {
    /// Build a `mining.subscribe` with a user-agent identifier and a null
    /// session token.
    pub fn subscribe(id: u64, user_agent: &str) -> Self {
        Self {
            id: Some(id.into()),
            method: methods::SUBSCRIBE.to_string(),
            params: vec![Value::String(user_agent.to_string()), Value::Null],
        }
    }

    /// Build a `mining.authorize` with account credentials.
    pub fn authorize(id: u64, username: &str, password: &str) -> Self {
        Self {
            id: Some(id.into()),
            method: methods::AUTHORIZE.to_string(),
            params: vec![
                Value::String(username.to_string()),
                Value::String(password.to_string()),
            ],
        }
    }

    /// Build a `mining.set_difficulty` notification.
    pub fn set_difficulty(difficulty: f64) -> Self {
        Self {
            id: None,
            method: methods::SET_DIFFICULTY.to_string(),
            params: vec![json!(difficulty)],
        }
    }
}

impl StratumResponse {
    /// Build a success response.
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response carrying the Stratum error triple
    /// `[code, message, null]`.
    pub fn error(id: Option<Value>, code: i64, message: &str) -> Self {
        Self {
            id,
            result: None,
            error: Some(json!([code, message, Value::Null])),
        }
    }

    /// A share response counts as accepted when the result is boolean true
    /// and the error field is null.
    pub fn is_accepted(&self) -> bool {
        self.result.as_ref().and_then(Value::as_bool) == Some(true) && self.error.is_none()
    }
}

impl fmt::Display for StratumRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id={:?})", self.method, self.id)
    }
}
