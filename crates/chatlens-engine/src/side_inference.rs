use std::ops::Range;

use chatlens_contracts::chat::{coerce_norm, infer_side_from_geometry, Side};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::preprocess::ClassifierHints;

/// Tuned constants of the pixel-evidence step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SideInferenceConfig {
    /// A pixel is dark when every channel is below this.
    pub dark_threshold: u8,
    /// Rows sampled above and below the bubble center.
    pub band_half_height: u32,
    /// Columns sampled on each side of a lane position.
    pub lane_half_width: u32,
    /// Where the left edge strip ends, as a fraction of the crop width. Used
    /// when no lanes are known.
    pub left_edge: f64,
    /// Where the right edge strip starts, as a fraction of the crop width.
    pub right_edge: f64,
    /// One side must out-score the other by this factor to win.
    pub dominance_ratio: f64,
    /// Minimum dark-pixel count for evidence to count at all.
    pub evidence_floor: u32,
}

impl Default for SideInferenceConfig {
    fn default() -> Self {
        Self {
            dark_threshold: 120,
            band_half_height: 10,
            lane_half_width: 6,
            left_edge: 0.07,
            right_edge: 0.93,
            dominance_ratio: 1.25,
            evidence_floor: 12,
        }
    }
}

/// Re-derive the `side` of every message in a raw vision payload.
///
/// Returns the input untouched when it is not a JSON object with object-typed
/// messages. Everything except `side` passes through. The sides written are
/// final: parse the result with `parse_classified_payload`.
pub fn correct_message_sides(
    raw_payload: &str,
    cropped: &RgbImage,
    hints: Option<&ClassifierHints>,
) -> String {
    correct_message_sides_with(raw_payload, cropped, hints, &SideInferenceConfig::default())
}

pub fn correct_message_sides_with(
    raw_payload: &str,
    cropped: &RgbImage,
    hints: Option<&ClassifierHints>,
    config: &SideInferenceConfig,
) -> String {
    classify_message_sides(raw_payload, cropped, hints, config)
        .unwrap_or_else(|| raw_payload.to_string())
}

/// Corrected payload, or `None` when the input was left as it was.
pub fn classify_message_sides(
    raw_payload: &str,
    cropped: &RgbImage,
    hints: Option<&ClassifierHints>,
    config: &SideInferenceConfig,
) -> Option<String> {
    let Ok(Value::Object(mut payload)) = serde_json::from_str::<Value>(raw_payload) else {
        return None;
    };
    let messages: Vec<Map<String, Value>> = match payload.get("messages") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        _ => Vec::new(),
    };
    if messages.is_empty() {
        return None;
    }

    let corrected = messages
        .into_iter()
        .enumerate()
        .map(|(idx, mut message)| {
            let side = infer_side(&message, cropped, hints, config);
            debug!(index = idx, side = side.as_str(), "classified message side");
            message.insert("side".to_string(), Value::String(side.as_str().to_string()));
            Value::Object(message)
        })
        .collect();
    payload.insert("messages".to_string(), Value::Array(corrected));

    serde_json::to_string(&Value::Object(payload)).ok()
}

fn infer_side(
    message: &Map<String, Value>,
    cropped: &RgbImage,
    hints: Option<&ClassifierHints>,
    config: &SideInferenceConfig,
) -> Side {
    // Border contact and center position first, as the parser would.
    let mut side = infer_side_from_geometry(message, Side::from_value(message.get("side")));

    if let Some(split_norm) = hints.and_then(|hints| valid_norm(hints.split_norm)) {
        if let Some(split_side) = classify_with_split(message, split_norm) {
            side = split_side;
        }
    }

    // Dark pixels at a lane are direct evidence of a bubble edge or avatar,
    // so they outrank the split geometry.
    if let Some(y_center) = coerce_norm(message.get("y_center")) {
        let lanes = hints.and_then(|hints| {
            Some((
                valid_norm(hints.left_lane_norm)?,
                valid_norm(hints.right_lane_norm)?,
            ))
        });
        let scores = match lanes {
            Some((left_lane, right_lane)) => {
                lane_scores(cropped, y_center, left_lane, right_lane, config)
            }
            None => edge_scores(cropped, y_center, config),
        };
        if let Some(evidence_side) = dominant_side(scores, config) {
            if evidence_side != side {
                debug!(
                    left = scores.0,
                    right = scores.1,
                    from = side.as_str(),
                    to = evidence_side.as_str(),
                    "pixel evidence overrides side"
                );
            }
            side = evidence_side;
        }
    }

    side
}

fn valid_norm(value: f64) -> Option<f64> {
    (0.0..=1.0).contains(&value).then_some(value)
}

fn classify_with_split(message: &Map<String, Value>, split_norm: f64) -> Option<Side> {
    let x_min = coerce_norm(message.get("x_min"));
    let x_max = coerce_norm(message.get("x_max"));

    if let (Some(x_min), Some(x_max)) = (x_min, x_max) {
        if x_max <= split_norm {
            return Some(Side::Left);
        }
        if x_min >= split_norm {
            return Some(Side::Right);
        }
        // Straddling bubble: whichever side holds more of it.
        let left_span = (split_norm - x_min).max(0.0);
        let right_span = (x_max - split_norm).max(0.0);
        return Some(if right_span >= left_span {
            Side::Right
        } else {
            Side::Left
        });
    }

    let x_center = coerce_norm(message.get("x_center"))?;
    Some(if x_center >= split_norm {
        Side::Right
    } else {
        Side::Left
    })
}

fn dominant_side((left, right): (u32, u32), config: &SideInferenceConfig) -> Option<Side> {
    let (left_f, right_f) = (f64::from(left), f64::from(right));
    if right_f > left_f * config.dominance_ratio && right > config.evidence_floor {
        Some(Side::Right)
    } else if left_f > right_f * config.dominance_ratio && left > config.evidence_floor {
        Some(Side::Left)
    } else {
        None
    }
}

/// Inclusive row band around a normalized vertical position.
fn band_rows(height: u32, y_center_norm: f64, half_height: u32) -> Range<u32> {
    let last = i64::from(height) - 1;
    let center = (y_center_norm * last as f64) as i64;
    let top = (center - i64::from(half_height)).max(0);
    let bottom = (center + i64::from(half_height)).min(last);
    top as u32..(bottom + 1) as u32
}

fn count_dark(image: &RgbImage, columns: Range<u32>, rows: Range<u32>, threshold: u8) -> u32 {
    let mut count = 0;
    for y in rows {
        for x in columns.clone() {
            let pixel = image.get_pixel(x, y);
            if pixel.0.iter().all(|channel| *channel < threshold) {
                count += 1;
            }
        }
    }
    count
}

fn lane_scores(
    image: &RgbImage,
    y_center_norm: f64,
    left_lane_norm: f64,
    right_lane_norm: f64,
    config: &SideInferenceConfig,
) -> (u32, u32) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let rows = band_rows(height, y_center_norm, config.band_half_height);
    let column_band = |lane_norm: f64| {
        let last = width - 1;
        let x = ((lane_norm * f64::from(last)) as u32).min(last);
        x.saturating_sub(config.lane_half_width)..(x + config.lane_half_width + 1).min(width)
    };

    (
        count_dark(
            image,
            column_band(left_lane_norm),
            rows.clone(),
            config.dark_threshold,
        ),
        count_dark(
            image,
            column_band(right_lane_norm),
            rows,
            config.dark_threshold,
        ),
    )
}

fn edge_scores(image: &RgbImage, y_center_norm: f64, config: &SideInferenceConfig) -> (u32, u32) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let rows = band_rows(height, y_center_norm, config.band_half_height);
    let left_end = ((f64::from(width) * config.left_edge) as u32).min(width - 1);
    let right_start = ((f64::from(width) * config.right_edge) as u32).min(width - 1);

    (
        count_dark(image, 0..left_end + 1, rows.clone(), config.dark_threshold),
        count_dark(image, right_start..width, rows, config.dark_threshold),
    )
}
