pub mod anchors;
pub mod chat;
pub mod events;
