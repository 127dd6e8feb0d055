use serde_json::{Value, json};

/// A participant's published presence: either currently online, or the
/// server timestamp (milliseconds) at which they were last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    LastSeen(i64),
}

impl PresenceState {
    /// Wire form: the string `"online"` or a millisecond timestamp.
    pub fn to_value(self) -> Value {
        match self {
            Self::Online => json!("online"),
            Self::LastSeen(ms) => json!(ms),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s == "online" => Some(Self::Online),
            Value::Number(n) => n.as_i64().map(Self::LastSeen),
            _ => None,
        }
    }

    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}
