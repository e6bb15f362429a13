use std::collections::HashSet;

use super::payload::{CanonicalMessage, ChatPayload, Side};

/// Packet size used by the paste-based sender; history keys are built per packet.
pub const PACKET_CHARS: usize = 40;

/// History key for a piece of text: trimmed and lower-cased.
pub fn normalize_text_for_history(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Split `text` into packets of at most `size` characters. Empty input still
/// yields one (empty) packet so the sender always has something to frame.
pub fn chunk_message(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Messages on the other party's side, in visual order.
pub fn extract_inbound(payload: &ChatPayload) -> Vec<CanonicalMessage> {
    payload
        .messages
        .iter()
        .filter(|message| message.side == Side::Left && !message.message.is_empty())
        .map(|message| {
            let user = if message.user.is_empty() {
                Side::Left.default_user().to_string()
            } else {
                message.user.clone()
            };
            CanonicalMessage::new(Side::Left, user, message.message.clone())
        })
        .collect()
}

/// Every message whose text the bot has not itself sent, whatever side it was
/// tagged with.
pub fn filter_against_history(
    payload: &ChatPayload,
    history: &AiMessageHistory,
) -> Vec<CanonicalMessage> {
    payload
        .messages
        .iter()
        .filter(|message| !message.message.is_empty() && !history.contains(&message.message))
        .map(|message| {
            let mut kept = message.clone();
            if kept.user.is_empty() {
                kept.user = "player".to_string();
            }
            kept
        })
        .collect()
}

/// Normalized packets the bot has sent this session. Only ever grows.
#[derive(Debug, Clone, Default)]
pub struct AiMessageHistory {
    entries: HashSet<String>,
}

impl AiMessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-sent texts, e.g. one packet per line of a history file.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut history = Self::new();
        for text in texts {
            history.insert(text.as_ref());
        }
        history
    }

    /// Returns true when a new key was added.
    pub fn insert(&mut self, text: &str) -> bool {
        let normalized = normalize_text_for_history(text);
        if normalized.is_empty() {
            return false;
        }
        self.entries.insert(normalized)
    }

    /// Record a reply the way the sender frames it.
    pub fn record_reply(&mut self, reply: &str) {
        for packet in chunk_message(reply, PACKET_CHARS) {
            self.insert(&packet);
        }
    }

    pub fn contains(&self, text: &str) -> bool {
        self.entries.contains(&normalize_text_for_history(text))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

/// `(user, text)` pairs that have already been answered.
#[derive(Debug, Clone, Default)]
pub struct SeenMessages {
    pairs: HashSet<(String, String)>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a pair is seen.
    pub fn mark(&mut self, user: &str, text: &str) -> bool {
        self.pairs.insert((user.to_string(), text.to_string()))
    }

    pub fn contains(&self, user: &str, text: &str) -> bool {
        self.pairs.contains(&(user.to_string(), text.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Dedup state owned by a polling loop. Not synchronized: a loop that polls
/// from several threads must wrap it in its own lock.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub seen: SeenMessages,
    pub ai_history: AiMessageHistory,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbound messages that still need a reply, marking each as seen.
    pub fn fresh_inbound(&mut self, payload: &ChatPayload) -> Vec<CanonicalMessage> {
        if !payload.chat_region_detected {
            return Vec::new();
        }
        extract_inbound(payload)
            .into_iter()
            .filter(|message| !self.ai_history.contains(&message.message))
            .filter(|message| self.seen.mark(&message.user, &message.message))
            .collect()
    }

    pub fn record_reply(&mut self, reply: &str) {
        self.ai_history.record_reply(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        chunk_message, extract_inbound, filter_against_history, normalize_text_for_history,
        AiMessageHistory, ConversationState, PACKET_CHARS,
    };
    use crate::chat::{CanonicalMessage, ChatPayload, Side};

    fn payload(messages: Vec<CanonicalMessage>) -> ChatPayload {
        ChatPayload::from_messages(messages)
    }

    #[test]
    fn normalization_is_idempotent_and_case_insensitive() {
        let once = normalize_text_for_history("  MEOW there ");
        assert_eq!(once, "meow there");
        assert_eq!(normalize_text_for_history(&once), once);
        assert_eq!(
            normalize_text_for_history("MEOW"),
            normalize_text_for_history("meow")
        );
    }

    #[test]
    fn inbound_filters_left_only() {
        let parsed = payload(vec![
            CanonicalMessage::new(Side::Left, "A", "hi"),
            CanonicalMessage::new(Side::Right, "B", "yo"),
            CanonicalMessage::new(Side::Unknown, "C", "??"),
        ]);
        assert_eq!(
            extract_inbound(&parsed),
            vec![CanonicalMessage::new(Side::Left, "A", "hi")]
        );
    }

    #[test]
    fn inbound_defaults_missing_user() {
        let parsed = payload(vec![CanonicalMessage::new(Side::Left, "", "hi")]);
        assert_eq!(extract_inbound(&parsed)[0].user, "player");
    }

    #[test]
    fn filters_messages_already_sent_by_ai() {
        let parsed = payload(vec![
            CanonicalMessage::new(Side::Right, "unknown", "MEOW"),
            CanonicalMessage::new(Side::Left, "Irin", "hello"),
            CanonicalMessage::new(Side::Unknown, "unknown", "hello there"),
        ]);
        let history = AiMessageHistory::from_texts(["meow"]);
        assert_eq!(
            filter_against_history(&parsed, &history),
            vec![
                CanonicalMessage::new(Side::Left, "Irin", "hello"),
                CanonicalMessage::new(Side::Unknown, "unknown", "hello there"),
            ]
        );
    }

    #[test]
    fn history_match_is_case_insensitive() {
        let parsed = payload(vec![
            CanonicalMessage::new(Side::Right, "unknown", "mEoW"),
            CanonicalMessage::new(Side::Left, "A", "Yo"),
        ]);
        let history = AiMessageHistory::from_texts(["MEOW"]);
        assert_eq!(
            filter_against_history(&parsed, &history),
            vec![CanonicalMessage::new(Side::Left, "A", "Yo")]
        );
    }

    #[test]
    fn chunking_uses_character_packets() {
        assert_eq!(chunk_message("", PACKET_CHARS), vec![String::new()]);
        assert_eq!(chunk_message("abcdef", 4), vec!["abcd", "ef"]);
        let emoji = "é".repeat(41);
        let packets = chunk_message(&emoji, PACKET_CHARS);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].chars().count(), 40);
        assert_eq!(packets[1], "é");
    }

    #[test]
    fn record_reply_adds_each_packet() {
        let mut history = AiMessageHistory::new();
        let reply = format!("{}{}", "a".repeat(40), "  Tail ");
        history.record_reply(&reply);
        assert_eq!(history.len(), 2);
        assert!(history.contains(&"A".repeat(40)));
        assert!(history.contains("tail"));
        history.record_reply("   ");
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn fresh_inbound_skips_seen_and_self_sent() {
        let mut state = ConversationState::new();
        state.record_reply("lol same");
        let parsed = payload(vec![
            CanonicalMessage::new(Side::Left, "Irin", "hello"),
            CanonicalMessage::new(Side::Left, "Irin", "LOL SAME"),
            CanonicalMessage::new(Side::Right, "ai", "hey"),
        ]);

        let first = state.fresh_inbound(&parsed);
        assert_eq!(first, vec![CanonicalMessage::new(Side::Left, "Irin", "hello")]);
        assert!(state.fresh_inbound(&parsed).is_empty());
        assert!(state.seen.contains("Irin", "hello"));
    }

    #[test]
    fn fresh_inbound_ignores_undetected_region() {
        let mut state = ConversationState::new();
        let parsed = ChatPayload {
            chat_region_detected: false,
            messages: vec![CanonicalMessage::new(Side::Left, "Irin", "hello")],
        };
        assert!(state.fresh_inbound(&parsed).is_empty());
        assert!(state.seen.is_empty());
    }
}
