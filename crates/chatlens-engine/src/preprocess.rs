use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chatlens_contracts::anchors::{AnchorProfile, AnchorStore, PixelRect};
use image::{imageops, DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// Chat panel bounds as fractions of the full screenshot.
const PANEL_LEFT: f64 = 0.67;
const PANEL_TOP: f64 = 0.21;
const PANEL_RIGHT: f64 = 0.97;
const PANEL_BOTTOM: f64 = 0.85;

// Message list inside the panel; excludes the tab strip and the composer.
const LIST_LEFT: f64 = 0.03;
const LIST_TOP: f64 = 0.16;
const LIST_RIGHT: f64 = 0.99;
const LIST_BOTTOM: f64 = 0.80;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("screenshot has no pixels ({width}x{height})")]
    EmptyScreenshot { width: u32, height: u32 },
    #[error("failed to decode screenshot {}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to encode crop: {0}")]
    Encode(#[from] image::ImageError),
}

/// Where bubbles of each side sit inside the crop, normalized to its width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierHints {
    pub left_lane_norm: f64,
    pub right_lane_norm: f64,
    pub split_norm: f64,
}

impl ClassifierHints {
    /// Approximate lane centers of the fixed fallback layout.
    pub const FALLBACK: ClassifierHints = ClassifierHints {
        left_lane_norm: 0.20,
        right_lane_norm: 0.83,
        split_norm: 0.515,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CropSource {
    Profile { key: String },
    Fallback,
}

#[derive(Debug, Clone)]
pub struct PreparedCrop {
    pub image: RgbImage,
    pub hints: Option<ClassifierHints>,
    pub source: CropSource,
}

impl PreparedCrop {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// PNG data URL, the form the vision model receives the crop in.
    pub fn to_png_data_url(&self) -> Result<String, PreprocessError> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(bytes)))
    }
}

pub fn load_screenshot(path: &Path) -> Result<DynamicImage, PreprocessError> {
    image::open(path).map_err(|source| PreprocessError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Crop the message list out of a full screenshot.
///
/// A profile matching the exact resolution wins; a missing or unusable profile
/// falls back to the fixed fractional layout. The crop always has a non-zero
/// extent.
pub fn prepare_chat_message_list(
    screenshot: &DynamicImage,
    anchors: &AnchorStore,
) -> Result<PreparedCrop, PreprocessError> {
    let source = screenshot.to_rgb8();
    let (width, height) = source.dimensions();
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyScreenshot { width, height });
    }

    if let Some(raw) = anchors.profile_for(width, height) {
        let key = AnchorStore::resolution_key(width, height);
        match AnchorProfile::from_value(raw) {
            Ok(profile) => {
                debug!(profile = %key, "cropping chat with anchor profile");
                return Ok(crop_from_profile(&source, &profile, key));
            }
            Err(err) => warn!(profile = %key, "ignoring anchor profile: {err}"),
        }
    }

    debug!(width, height, "cropping chat with fallback layout");
    Ok(crop_with_fallback(&source))
}

pub fn crop_chat_message_list(
    screenshot: &DynamicImage,
    anchors: &AnchorStore,
) -> Result<RgbImage, PreprocessError> {
    prepare_chat_message_list(screenshot, anchors).map(|prepared| prepared.image)
}

/// Pixel bounds `[left, right) x [top, bottom)` inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl Bounds {
    /// Pull the box inside a `max_w x max_h` image while keeping at least one
    /// pixel of extent on each axis.
    fn clamped(left: i64, top: i64, right: i64, bottom: i64, max_w: i64, max_h: i64) -> Self {
        let left = left.min(max_w - 2).max(0);
        let top = top.min(max_h - 2).max(0);
        Self {
            left,
            top,
            right: right.min(max_w).max(left + 1),
            bottom: bottom.min(max_h).max(top + 1),
        }
    }

    fn from_rect(rect: &PixelRect, max_w: i64, max_h: i64) -> Self {
        Self::clamped(
            rect.x,
            rect.y,
            rect.x.saturating_add(rect.width),
            rect.y.saturating_add(rect.height),
            max_w,
            max_h,
        )
    }

    fn width(&self) -> i64 {
        self.right - self.left
    }

    fn height(&self) -> i64 {
        self.bottom - self.top
    }

    fn offset(self, dx: i64, dy: i64) -> Self {
        Self {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }

    fn crop(&self, source: &RgbImage) -> RgbImage {
        imageops::crop_imm(
            source,
            self.left as u32,
            self.top as u32,
            self.width() as u32,
            self.height() as u32,
        )
        .to_image()
    }
}

fn crop_from_profile(source: &RgbImage, profile: &AnchorProfile, key: String) -> PreparedCrop {
    let (width, height) = source.dimensions();
    let bounds = Bounds::from_rect(&profile.message_list, width as i64, height as i64);
    let image = bounds.crop(source);

    let hints = profile.lanes.map(|lanes| {
        let list_width = bounds.width().max(1) as f64;
        let project =
            |x: i64| (x.saturating_sub(bounds.left) as f64 / list_width).clamp(0.0, 1.0);
        let left_lane_x = lanes.left_x.unwrap_or(bounds.left);
        let right_lane_x = lanes.right_x.unwrap_or(bounds.right);
        let split_x = profile
            .split_x
            .unwrap_or_else(|| left_lane_x.saturating_add(right_lane_x).div_euclid(2));
        ClassifierHints {
            left_lane_norm: project(left_lane_x),
            right_lane_norm: project(right_lane_x),
            split_norm: project(split_x),
        }
    });

    PreparedCrop {
        image,
        hints,
        source: CropSource::Profile { key },
    }
}

fn crop_with_fallback(source: &RgbImage) -> PreparedCrop {
    let (width, height) = source.dimensions();
    let (width, height) = (width as i64, height as i64);
    let scale = |extent: i64, fraction: f64| (extent as f64 * fraction) as i64;

    let panel = Bounds::clamped(
        scale(width, PANEL_LEFT),
        scale(height, PANEL_TOP),
        scale(width, PANEL_RIGHT),
        scale(height, PANEL_BOTTOM),
        width,
        height,
    );
    let (panel_w, panel_h) = (panel.width(), panel.height());
    let list = Bounds::clamped(
        scale(panel_w, LIST_LEFT),
        scale(panel_h, LIST_TOP),
        scale(panel_w, LIST_RIGHT),
        scale(panel_h, LIST_BOTTOM),
        panel_w,
        panel_h,
    )
    .offset(panel.left, panel.top);

    PreparedCrop {
        image: list.crop(source),
        hints: Some(ClassifierHints::FALLBACK),
        source: CropSource::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use chatlens_contracts::anchors::AnchorStore;
    use image::{DynamicImage, Rgb, RgbImage};
    use indexmap::IndexMap;
    use serde_json::{json, Value};

    use super::{
        crop_chat_message_list, prepare_chat_message_list, ClassifierHints, CropSource,
        PreprocessError,
    };

    fn screenshot(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([236, 231, 226])))
    }

    fn store(key: &str, profile: Value) -> AnchorStore {
        let mut profiles = IndexMap::new();
        profiles.insert(key.to_string(), profile);
        AnchorStore::from_profiles(profiles)
    }

    #[test]
    fn fallback_layout_crops_message_list() -> anyhow::Result<()> {
        let mut image = RgbImage::from_pixel(1920, 1080, Rgb([236, 231, 226]));
        image.put_pixel(1303, 336, Rgb([255, 0, 0]));
        let prepared =
            prepare_chat_message_list(&DynamicImage::ImageRgb8(image), &AnchorStore::empty())?;

        assert_eq!(prepared.source, CropSource::Fallback);
        assert_eq!((prepared.width(), prepared.height()), (553, 443));
        assert_eq!(prepared.image.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(prepared.hints, Some(ClassifierHints::FALLBACK));
        Ok(())
    }

    #[test]
    fn tiny_screenshots_still_produce_pixels() -> anyhow::Result<()> {
        for (width, height) in [(1, 1), (2, 3), (7, 2)] {
            let crop = crop_chat_message_list(&screenshot(width, height), &AnchorStore::empty())?;
            assert!(crop.width() >= 1 && crop.height() >= 1, "{width}x{height}");
        }
        Ok(())
    }

    #[test]
    fn empty_screenshot_is_rejected() {
        let result = prepare_chat_message_list(&screenshot(0, 0), &AnchorStore::empty());
        assert!(matches!(
            result,
            Err(PreprocessError::EmptyScreenshot { width: 0, height: 0 })
        ));
    }

    #[test]
    fn profile_crop_projects_lane_hints() -> anyhow::Result<()> {
        let anchors = store(
            "400x300",
            json!({
                "message_list": {"x": 100, "y": 50, "width": 200, "height": 150},
                "lanes": {"left_x": 150, "right_x": 260},
                "classifier": {"split_x": 205}
            }),
        );
        let prepared = prepare_chat_message_list(&screenshot(400, 300), &anchors)?;

        assert_eq!(
            prepared.source,
            CropSource::Profile { key: "400x300".to_string() }
        );
        assert_eq!((prepared.width(), prepared.height()), (200, 150));
        let hints = prepared.hints.expect("profile hints");
        assert!((hints.left_lane_norm - 0.25).abs() < 1e-9);
        assert!((hints.right_lane_norm - 0.8).abs() < 1e-9);
        assert!((hints.split_norm - 0.525).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn profile_defaults_split_between_lanes_and_clamps_hints() -> anyhow::Result<()> {
        let anchors = store(
            "400x300",
            json!({
                "message_list": {"x": 100, "y": 50, "width": 200, "height": 150},
                "lanes": {"left_x": 20, "right_x": 380}
            }),
        );
        let hints = prepare_chat_message_list(&screenshot(400, 300), &anchors)?
            .hints
            .expect("profile hints");
        assert_eq!(hints.left_lane_norm, 0.0);
        assert_eq!(hints.right_lane_norm, 1.0);
        assert!((hints.split_norm - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn profile_rect_is_clamped_to_image() -> anyhow::Result<()> {
        let anchors = store(
            "400x300",
            json!({"message_list": {"x": 350, "y": 280, "width": 200, "height": 200}}),
        );
        let prepared = prepare_chat_message_list(&screenshot(400, 300), &anchors)?;
        assert_eq!((prepared.width(), prepared.height()), (50, 20));
        let hints = prepared.hints.expect("default lanes");
        assert_eq!(hints.left_lane_norm, 0.0);
        assert_eq!(hints.right_lane_norm, 1.0);
        assert!((hints.split_norm - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn malformed_lanes_yield_no_hints() -> anyhow::Result<()> {
        let anchors = store(
            "400x300",
            json!({
                "message_list": {"x": 0, "y": 0, "width": 100, "height": 100},
                "lanes": [1, 2]
            }),
        );
        let prepared = prepare_chat_message_list(&screenshot(400, 300), &anchors)?;
        assert!(matches!(prepared.source, CropSource::Profile { .. }));
        assert_eq!(prepared.hints, None);
        Ok(())
    }

    #[test]
    fn degenerate_profile_falls_back() -> anyhow::Result<()> {
        let anchors = store(
            "200x120",
            json!({"message_list": {"x": 10, "y": 10, "width": 0, "height": 50}}),
        );
        let prepared = prepare_chat_message_list(&screenshot(200, 120), &anchors)?;
        assert_eq!(prepared.source, CropSource::Fallback);
        assert_eq!((prepared.width(), prepared.height()), (58, 49));
        Ok(())
    }

    #[test]
    fn huge_or_broken_coordinates_fall_back() -> anyhow::Result<()> {
        for profile in [
            json!({"message_list": {"x": 9.0e18, "y": 0, "width": 9.0e18, "height": 100}}),
            json!({"message_list": {"x": 0, "y": 0, "width": 100, "height": 100},
                   "lanes": {"left_x": 9.0e18, "right_x": 9.0e18}}),
            json!({"message_list": {"x": null, "y": 0, "width": 100, "height": 100}}),
        ] {
            let anchors = store("400x300", profile);
            let prepared = prepare_chat_message_list(&screenshot(400, 300), &anchors)?;
            assert_eq!(prepared.source, CropSource::Fallback);
            assert_eq!(prepared.hints, Some(ClassifierHints::FALLBACK));
        }
        Ok(())
    }

    #[test]
    fn other_resolutions_ignore_profile() -> anyhow::Result<()> {
        let anchors = store(
            "1920x1080",
            json!({"message_list": {"x": 0, "y": 0, "width": 100, "height": 100}}),
        );
        let prepared = prepare_chat_message_list(&screenshot(200, 120), &anchors)?;
        assert_eq!(prepared.source, CropSource::Fallback);
        Ok(())
    }

    #[test]
    fn data_url_is_png() -> anyhow::Result<()> {
        let prepared = prepare_chat_message_list(&screenshot(200, 120), &AnchorStore::empty())?;
        let url = prepared.to_png_data_url()?;
        assert!(url.starts_with("data:image/png;base64,iVBORw0KGgo"));
        Ok(())
    }
}
