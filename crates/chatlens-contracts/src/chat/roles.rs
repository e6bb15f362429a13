use serde::{Deserialize, Serialize};

use super::payload::{ChatPayload, Side};

const ROLE_NAME_MAX_CHARS: usize = 64;
const PLACEHOLDER_USERS: &[&str] = &["player", "unknown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of a chat-completion `messages` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RoleMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}

/// Map the visible conversation onto completion roles: the bot's own lane is
/// `assistant`, everything else is `user`.
pub fn build_role_messages(payload: &ChatPayload) -> Vec<RoleMessage> {
    payload
        .messages
        .iter()
        .filter(|message| !message.message.is_empty())
        .map(|message| match message.side {
            Side::Right => RoleMessage::new(Role::Assistant, message.message.clone()),
            Side::Left | Side::Unknown => {
                let name = sanitize_role_name(&message.user);
                let name = if name.is_empty() || PLACEHOLDER_USERS.contains(&name.as_str()) {
                    None
                } else {
                    Some(name)
                };
                RoleMessage::new(Role::User, message.message.clone()).with_name(name)
            }
        })
        .collect()
}

/// Collapse each run of characters outside `[A-Za-z0-9_-]` into one `_`, trim
/// underscores from both ends and cap the length.
pub fn sanitize_role_name(user: &str) -> String {
    let mut compact = String::with_capacity(user.len());
    let mut in_run = false;
    for ch in user.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            compact.push(ch);
            in_run = false;
        } else if !in_run {
            compact.push('_');
            in_run = true;
        }
    }
    compact
        .trim_matches('_')
        .chars()
        .take(ROLE_NAME_MAX_CHARS)
        .collect()
}

/// Full completion request body: the system context followed by the visible
/// history. With no history the single inbound `prompt` is sent as the user turn.
pub fn build_completion_messages(
    system_context: &str,
    history: &[RoleMessage],
    prompt: &str,
) -> Vec<RoleMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(RoleMessage::new(Role::System, system_context.trim()));
    if history.is_empty() {
        messages.push(RoleMessage::new(Role::User, prompt));
    } else {
        messages.extend(history.iter().cloned());
    }
    messages
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{build_completion_messages, build_role_messages, sanitize_role_name, Role, RoleMessage};
    use crate::chat::{CanonicalMessage, ChatPayload, Side};

    #[test]
    fn builds_user_and_assistant_roles() {
        let parsed = ChatPayload::from_messages(vec![
            CanonicalMessage::new(Side::Left, "Irin", "hello"),
            CanonicalMessage::new(Side::Right, "unknown", "yo"),
        ]);
        let roles = build_role_messages(&parsed);
        assert_eq!(
            serde_json::to_value(&roles).unwrap(),
            json!([
                {"role": "user", "name": "Irin", "content": "hello"},
                {"role": "assistant", "content": "yo"},
            ])
        );
    }

    #[test]
    fn sanitizes_user_names() {
        assert_eq!(sanitize_role_name("A B!"), "A_B");
        assert_eq!(sanitize_role_name("  ~~Irin~~  "), "Irin");
        assert_eq!(sanitize_role_name("x-y_z"), "x-y_z");
        assert_eq!(sanitize_role_name("!!!"), "");
        assert_eq!(sanitize_role_name(&"n".repeat(80)).len(), 64);
    }

    #[test]
    fn omits_placeholder_and_empty_names() {
        let parsed = ChatPayload::from_messages(vec![
            CanonicalMessage::new(Side::Left, "player", "a"),
            CanonicalMessage::new(Side::Unknown, "unknown", "b"),
            CanonicalMessage::new(Side::Left, "???", "c"),
            CanonicalMessage::new(Side::Unknown, "Mika", "d"),
        ]);
        let roles = build_role_messages(&parsed);
        assert_eq!(roles[0].name, None);
        assert_eq!(roles[1].name, None);
        assert_eq!(roles[2].name, None);
        assert_eq!(roles[3].name.as_deref(), Some("Mika"));
        assert!(roles.iter().all(|message| message.role == Role::User));
    }

    #[test]
    fn completion_messages_lead_with_system_context() {
        let history = vec![RoleMessage::new(Role::User, "hey").with_name(Some("Irin".into()))];
        let messages = build_completion_messages(" be brief ", &history, "unused");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], RoleMessage::new(Role::System, "be brief"));
        assert_eq!(messages[1], history[0]);
    }

    #[test]
    fn completion_messages_fall_back_to_prompt() {
        let messages = build_completion_messages("ctx", &[], "hi there");
        assert_eq!(messages[1], RoleMessage::new(Role::User, "hi there"));
    }
}
