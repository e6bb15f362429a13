//! Polling-cycle log: one JSON object per line, stamped with the session and
//! the time it was written.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::chat::{chunk_message, PACKET_CHARS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    /// A screenshot went through crop, side correction and parsing.
    ChatPerceived {
        screenshot: String,
        /// Anchor profile key; `None` when the fallback layout was used.
        profile: Option<String>,
        chat_region_detected: bool,
        messages: usize,
        inbound: usize,
        fresh: usize,
    },
    /// A reply went out and its packets joined the bot history.
    ReplyRecorded {
        packets: Vec<String>,
        history_size: usize,
    },
}

impl CycleEvent {
    pub fn reply_recorded(reply: &str, history_size: usize) -> Self {
        Self::ReplyRecorded {
            packets: chunk_message(reply, PACKET_CHARS),
            history_size,
        }
    }
}

/// Append-only `events.jsonl` for one polling session.
#[derive(Debug, Clone)]
pub struct CycleLog {
    path: PathBuf,
    session_id: String,
}

impl CycleLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write `event` as one line and return the object that was written.
    pub fn append(&self, event: &CycleEvent) -> anyhow::Result<Value> {
        let Value::Object(fields) = serde_json::to_value(event)? else {
            anyhow::bail!("cycle event did not serialize to an object");
        };
        let mut line = Map::new();
        line.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        line.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        line.extend(fields);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(&line)?)?;

        Ok(Value::Object(line))
    }
}
