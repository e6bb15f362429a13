//! Read-only access to resolution-keyed chat layout profiles.
//!
//! Profiles are written by the anchor editor as
//! `{"profiles": {"1920x1080": {"panel": {...}, "message_list": {...}, "lanes": {...}, "classifier": {...}}}}`
//! with every coordinate in full-screenshot pixels.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_ANCHORS_PATH: &str = "tools/anchor_editor/anchors.json";
pub const ANCHORS_PATH_ENV: &str = "CHATLENS_ANCHORS";

/// Largest coordinate magnitude a profile may carry.
const MAX_COORDINATE: i64 = i32::MAX as i64;

#[derive(Debug, Error, PartialEq)]
pub enum AnchorError {
    #[error("profile has no message_list rectangle")]
    MissingMessageList,
    #[error("profile message_list is degenerate ({width}x{height})")]
    DegenerateMessageList { width: i64, height: i64 },
    #[error("profile field {field} is not a usable pixel coordinate")]
    InvalidCoordinate { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl PixelRect {
    /// Missing keys are 0; present keys must be coordinates.
    fn from_object(section: &str, object: &Map<String, Value>) -> Result<Self, AnchorError> {
        let field = |key: &str| coordinate(section, object, key).map(|value| value.unwrap_or(0));
        Ok(Self {
            x: field("x")?,
            y: field("y")?,
            width: field("width")?,
            height: field("height")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaneAnchors {
    pub left_x: Option<i64>,
    pub right_x: Option<i64>,
}

/// Typed view of one profile entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorProfile {
    pub panel: Option<PixelRect>,
    pub message_list: PixelRect,
    /// `None` when the profile carries a malformed `lanes` entry; classifier
    /// hints are then not derived.
    pub lanes: Option<LaneAnchors>,
    pub split_x: Option<i64>,
}

impl AnchorProfile {
    pub fn from_value(value: &Value) -> Result<Self, AnchorError> {
        let message_list = value
            .get("message_list")
            .and_then(Value::as_object)
            .ok_or(AnchorError::MissingMessageList)
            .and_then(|rect| PixelRect::from_object("message_list", rect))?;
        if message_list.width <= 1 || message_list.height <= 1 {
            return Err(AnchorError::DegenerateMessageList {
                width: message_list.width,
                height: message_list.height,
            });
        }

        // Cropping never reads the panel, so a broken one is dropped rather than fatal.
        let panel = value
            .get("panel")
            .and_then(Value::as_object)
            .and_then(|rect| PixelRect::from_object("panel", rect).ok());
        let (lanes, split_x) = match value.get("lanes") {
            None => (Some(LaneAnchors::default()), split_from(value)?),
            Some(Value::Object(lanes)) => (
                Some(LaneAnchors {
                    left_x: coordinate("lanes", lanes, "left_x")?,
                    right_x: coordinate("lanes", lanes, "right_x")?,
                }),
                split_from(value)?,
            ),
            // No hints, so the split is never consulted.
            Some(_) => (None, None),
        };

        Ok(Self {
            panel,
            message_list,
            lanes,
            split_x,
        })
    }
}

/// Profiles keyed by `"{width}x{height}"`, in file order.
#[derive(Debug, Clone, Default)]
pub struct AnchorStore {
    path: Option<PathBuf>,
    profiles: IndexMap<String, Value>,
}

impl AnchorStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load profiles from `path`. A missing or malformed file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let profiles = read_profiles(&path).unwrap_or_default();
        tracing::debug!(
            path = %path.display(),
            profiles = profiles.len(),
            "loaded anchor profiles"
        );
        Self {
            path: Some(path),
            profiles,
        }
    }

    pub fn from_profiles(profiles: IndexMap<String, Value>) -> Self {
        Self {
            path: None,
            profiles,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn resolution_key(width: u32, height: u32) -> String {
        format!("{width}x{height}")
    }

    /// Raw profile for an exact resolution, if it is a JSON object.
    pub fn profile_for(&self, width: u32, height: u32) -> Option<&Value> {
        self.profiles
            .get(&Self::resolution_key(width, height))
            .filter(|profile| profile.is_object())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.profiles.get(key)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn read_profiles(path: &Path) -> Option<IndexMap<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    let profiles = parsed.get("profiles")?.as_object()?;
    Some(
        profiles
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}

fn split_from(profile: &Value) -> Result<Option<i64>, AnchorError> {
    match profile.get("classifier") {
        Some(Value::Object(classifier)) => coordinate("classifier", classifier, "split_x"),
        _ => Ok(None),
    }
}

/// `Ok(None)` when `key` is absent. Numbers truncate toward zero and strings
/// must hold an integer; anything else, or a value past [`MAX_COORDINATE`], is
/// an error.
fn coordinate(
    section: &str,
    object: &Map<String, Value>,
    key: &str,
) -> Result<Option<i64>, AnchorError> {
    let Some(value) = object.get(key) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Number(raw) => raw.as_i64().or_else(|| {
            raw.as_f64()
                .filter(|number| number.is_finite() && number.abs() <= MAX_COORDINATE as f64)
                .map(|number| number.trunc() as i64)
        }),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(number) if number.abs() <= MAX_COORDINATE => Ok(Some(number)),
        _ => Err(AnchorError::InvalidCoordinate {
            field: format!("{section}.{key}"),
        }),
    }
}
