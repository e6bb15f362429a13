mod history;
mod parser;
mod payload;
mod roles;

pub use history::{
    chunk_message, extract_inbound, filter_against_history, normalize_text_for_history,
    AiMessageHistory, ConversationState, SeenMessages, PACKET_CHARS,
};
pub use parser::{
    infer_side_from_geometry, normalize_bubble, parse_chat_payload, parse_classified_payload,
};
pub use payload::{coerce_norm, CanonicalMessage, ChatPayload, Side};
pub use roles::{
    build_completion_messages, build_role_messages, sanitize_role_name, Role, RoleMessage,
};
