use serde_json::{Map, Value};

use super::payload::{coerce_norm, coerce_text, value_is_truthy, CanonicalMessage, ChatPayload, Side};

/// Literal system toasts that show up in the bot's own lane.
const UI_NOISE_MESSAGES: &[&str] = &["baboo!"];

/// A bubble edge within this distance of a panel border counts as touching it.
const BORDER_TOUCH_MAX: f64 = 0.12;
const RIGHT_CENTER_MIN: f64 = 0.58;
/// `user` values longer than this are treated as misplaced bubble text.
const MISPLACED_TEXT_MIN_CHARS: usize = 16;

/// Parse vision-model output into the canonical payload.
///
/// Never fails: strict JSON is tried first, then a trailing-comma repair pass,
/// and anything still unparseable is read as one message per non-empty line.
pub fn parse_chat_payload(raw: &str) -> ChatPayload {
    parse_with(raw, SidePolicy::Geometry)
}

/// Like [`parse_chat_payload`], for a payload whose `side` fields were already
/// settled by the pixel classifier. The declared side is kept as-is instead of
/// being re-derived from the bubble geometry.
pub fn parse_classified_payload(raw: &str) -> ChatPayload {
    parse_with(raw, SidePolicy::Declared)
}

/// Normalize one raw bubble. Returns `None` for non-objects, bubbles with no
/// recoverable text, and known UI noise.
pub fn normalize_bubble(bubble: &Value) -> Option<CanonicalMessage> {
    bubble
        .as_object()
        .and_then(|bubble| normalize_bubble_object(bubble, SidePolicy::Geometry))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SidePolicy {
    Geometry,
    Declared,
}

fn parse_with(raw: &str, policy: SidePolicy) -> ChatPayload {
    let normalize = |bubble: &Value| {
        bubble
            .as_object()
            .and_then(|bubble| normalize_bubble_object(bubble, policy))
    };
    match load_json_with_repair(raw) {
        Some(Value::Object(object)) if object.contains_key("messages") => {
            let messages = match object.get("messages") {
                Some(Value::Array(items)) => items.iter().filter_map(normalize).collect(),
                _ => Vec::new(),
            };
            ChatPayload {
                chat_region_detected: value_is_truthy(object.get("chat_region_detected")),
                messages,
            }
        }
        // Legacy single-message object.
        Some(Value::Object(object)) => ChatPayload::from_messages(
            normalize_bubble_object(&object, policy).into_iter().collect(),
        ),
        Some(Value::Array(items)) => {
            ChatPayload::from_messages(items.iter().filter_map(normalize).collect())
        }
        _ => freeform_payload(raw),
    }
}

fn normalize_bubble_object(
    bubble: &Map<String, Value>,
    policy: SidePolicy,
) -> Option<CanonicalMessage> {
    let mut text = coerce_text(bubble.get("message"));
    let declared = Side::from_value(bubble.get("side"));
    let side = match policy {
        SidePolicy::Geometry => infer_side_from_geometry(bubble, declared),
        SidePolicy::Declared => declared,
    };
    let mut user = coerce_text(bubble.get("user"));

    // The vision model sometimes leaves `message` empty and puts the bubble in `user`.
    if text.is_empty()
        && !user.is_empty()
        && (user.contains(' ') || user.chars().count() > MISPLACED_TEXT_MIN_CHARS)
    {
        text = std::mem::replace(&mut user, "unknown".to_string());
    }

    if text.is_empty() {
        return None;
    }

    if side == Side::Right {
        let lowered = text.to_lowercase();
        if UI_NOISE_MESSAGES.iter().any(|noise| *noise == lowered) {
            return None;
        }
    }

    if user.is_empty() {
        user = side.default_user().to_string();
    }

    Some(CanonicalMessage::new(side, user, text))
}

/// Border contact beats center position: wide bubbles drag their centers
/// toward the middle of the panel.
pub fn infer_side_from_geometry(bubble: &Map<String, Value>, fallback: Side) -> Side {
    let x_min = coerce_norm(bubble.get("x_min"));
    let x_max = coerce_norm(bubble.get("x_max"));
    if let (Some(x_min), Some(x_max)) = (x_min, x_max) {
        let left_touch = x_min;
        let right_touch = 1.0 - x_max;
        if right_touch <= BORDER_TOUCH_MAX && right_touch < left_touch {
            return Side::Right;
        }
        if left_touch <= BORDER_TOUCH_MAX && left_touch < right_touch {
            return Side::Left;
        }
    }

    if let Some(x_center) = coerce_norm(bubble.get("x_center")) {
        return if x_center >= RIGHT_CENTER_MIN {
            Side::Right
        } else {
            Side::Left
        };
    }

    fallback
}

fn freeform_payload(raw: &str) -> ChatPayload {
    let messages = raw
        .split(is_line_break)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| CanonicalMessage::new(Side::Unknown, "unknown", line))
        .collect();
    ChatPayload::from_messages(messages)
}

/// ASCII and Unicode line terminators, including a lone `\r`.
fn is_line_break(ch: char) -> bool {
    matches!(
        ch,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

fn load_json_with_repair(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    serde_json::from_str::<Value>(&strip_trailing_commas(raw)).ok()
}

/// Drop commas whose next non-whitespace character closes an object or array.
/// Commas inside string literals are left alone.
fn strip_trailing_commas(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next = chars[idx + 1..].iter().find(|next| !next.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}
