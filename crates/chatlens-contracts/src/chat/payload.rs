use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which conversational lane a bubble belongs to.
///
/// `Left` is the other party, `Right` is the bot's own previously sent text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    #[default]
    Unknown,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
            Side::Unknown => "unknown",
        }
    }

    /// Lenient read of a declared side: anything that is not one of the three
    /// labels (after trimming and lower-casing) is `Unknown`.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::String(raw)) = value else {
            return Side::Unknown;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "left" => Side::Left,
            "right" => Side::Right,
            _ => Side::Unknown,
        }
    }

    pub fn default_user(self) -> &'static str {
        match self {
            Side::Left => "player",
            Side::Right => "ai",
            Side::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub side: Side,
    pub user: String,
    pub message: String,
}

impl CanonicalMessage {
    pub fn new(side: Side, user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            side,
            user: user.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatPayload {
    pub chat_region_detected: bool,
    pub messages: Vec<CanonicalMessage>,
}

impl ChatPayload {
    /// Payload whose detection flag reflects whether anything survived.
    pub fn from_messages(messages: Vec<CanonicalMessage>) -> Self {
        Self {
            chat_region_detected: !messages.is_empty(),
            messages,
        }
    }
}

pub(crate) fn coerce_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.trim().to_string(),
        _ => String::new(),
    }
}

/// Reads a normalized `[0, 1]` coordinate. Numbers and numeric strings are
/// accepted; anything else, or a value out of range, is absent.
pub fn coerce_norm(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(raw) => raw.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    if (0.0..=1.0).contains(&number) {
        Some(number)
    } else {
        None
    }
}

pub(crate) fn value_is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(raw)) => *raw,
        Some(Value::Number(raw)) => raw.as_f64().map(|number| number != 0.0).unwrap_or(false),
        Some(Value::String(raw)) => !raw.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}
