//! Tool calls emitted by the model and the grounding crop tool.
//!
//! A call is a `<grounding>{"bbox_2d": [x1, y1, x2, y2], "source": "..."}</grounding>`
//! block. `source` names a previously seen image: `original_image` for the
//! prompt image or `observation_<k>` for the k-th observation. The box is given
//! in the coordinates of the image as the model saw it and is mapped back to
//! the full-resolution original before cropping.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use image::DynamicImage;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::image::{ImageSize, MIN_SIDE};

/// Arguments of a grounding call as written by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingArgs {
    pub bbox_2d: [f64; 4],
    pub source: String,
}

/// Kinds of tools the dispatcher can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Grounding,
}

/// A validated tool call ready to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTool {
    pub kind: ToolKind,
    /// Index into the observation history.
    pub source_index: usize,
    /// `(left, top, right, bottom)` in original-resolution pixels.
    pub region: [u32; 4],
}

/// What a tool hands back to the conversation.
#[derive(Debug, Clone)]
pub enum ToolObservation {
    Image(DynamicImage),
    Text(String),
}

/// Validates and runs tool calls against the request's observation history.
///
/// `observations` holds the full-resolution images (prompt image first) and
/// `sizes` the size each one was shown to the model at.
pub trait ToolDispatcher: Send + Sync {
    fn prepare(
        &self,
        payload: &str,
        observations: &[Arc<DynamicImage>],
        sizes: &[ImageSize],
    ) -> Result<PreparedTool>;

    fn execute(
        &self,
        tool: &PreparedTool,
        observations: &[Arc<DynamicImage>],
    ) -> Result<ToolObservation>;
}

/// Payload of the last tool-call block in `text`, if there is one.
pub fn extract_tool_call<'t>(pattern: &Regex, text: &'t str) -> Option<&'t str> {
    pattern
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Crops a region of an earlier observation.
#[derive(Debug, Clone, Default)]
pub struct CropTool {
    /// Treat `bbox_2d` as fractions of the image instead of pixels.
    pub use_relative_coordinates: bool,
}

impl CropTool {
    pub fn new(use_relative_coordinates: bool) -> Self {
        Self {
            use_relative_coordinates,
        }
    }

    fn source_index(source: &str) -> Result<usize> {
        if source == "original_image" {
            return Ok(0);
        }
        let k = source
            .strip_prefix("observation_")
            .ok_or_else(|| anyhow!("unknown source image `{source}`"))?;
        k.parse::<usize>()
            .with_context(|| format!("bad observation index in `{source}`"))
    }
}

impl ToolDispatcher for CropTool {
    fn prepare(
        &self,
        payload: &str,
        observations: &[Arc<DynamicImage>],
        sizes: &[ImageSize],
    ) -> Result<PreparedTool> {
        let args: GroundingArgs =
            serde_json::from_str(payload.trim()).context("tool arguments are not valid JSON")?;
        let source_index = Self::source_index(&args.source)?;
        let original = observations
            .get(source_index)
            .ok_or_else(|| anyhow!("source `{}` does not exist yet", args.source))?;
        let shown = sizes
            .get(source_index)
            .ok_or_else(|| anyhow!("no display size for `{}`", args.source))?;
        let full = ImageSize::of(original);

        let [x1, y1, x2, y2] = args.bbox_2d;
        if x2 <= x1 || y2 <= y1 {
            bail!("bbox_2d {:?} has no area", args.bbox_2d);
        }
        let (sx, sy) = if self.use_relative_coordinates {
            (f64::from(full.width), f64::from(full.height))
        } else {
            (
                f64::from(full.width) / f64::from(shown.width.max(1)),
                f64::from(full.height) / f64::from(shown.height.max(1)),
            )
        };
        let clamp_x = |v: f64| (v * sx).round().clamp(0.0, f64::from(full.width)) as u32;
        let clamp_y = |v: f64| (v * sy).round().clamp(0.0, f64::from(full.height)) as u32;
        let (left, right) = widen(clamp_x(x1), clamp_x(x2), full.width);
        let (top, bottom) = widen(clamp_y(y1), clamp_y(y2), full.height);
        if right <= left || bottom <= top {
            bail!("bbox_2d {:?} lies outside `{}`", args.bbox_2d, args.source);
        }

        Ok(PreparedTool {
            kind: ToolKind::Grounding,
            source_index,
            region: [left, top, right, bottom],
        })
    }

    fn execute(
        &self,
        tool: &PreparedTool,
        observations: &[Arc<DynamicImage>],
    ) -> Result<ToolObservation> {
        match tool.kind {
            ToolKind::Grounding => {
                let source = observations
                    .get(tool.source_index)
                    .ok_or_else(|| anyhow!("observation {} vanished", tool.source_index))?;
                let [left, top, right, bottom] = tool.region;
                Ok(ToolObservation::Image(source.crop_imm(
                    left,
                    top,
                    right - left,
                    bottom - top,
                )))
            }
        }
    }
}

/// Grow `[lo, hi)` to at least [`MIN_SIDE`] around its centre, inside `[0, limit)`.
fn widen(lo: u32, hi: u32, limit: u32) -> (u32, u32) {
    if hi.saturating_sub(lo) >= MIN_SIDE || limit < MIN_SIDE {
        return (lo, hi);
    }
    let centre = (lo + hi) / 2;
    let start = centre.saturating_sub(MIN_SIDE / 2).min(limit - MIN_SIDE);
    (start, start + MIN_SIDE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> (Vec<Arc<DynamicImage>>, Vec<ImageSize>) {
        // Original is 400x200, shown to the model at 200x100.
        let images = vec![Arc::new(DynamicImage::new_rgb8(400, 200))];
        let sizes = vec![ImageSize::new(200, 100)];
        (images, sizes)
    }

    #[test]
    fn test_extract_last_tool_call() {
        let pattern = Regex::new(r"(?s)<grounding>(.*?)</grounding>").unwrap();
        let text = "look <grounding>a</grounding> then <grounding>b</grounding>";
        assert_eq!(extract_tool_call(&pattern, text), Some("b"));
        assert_eq!(extract_tool_call(&pattern, "<answer>x</answer>"), None);
    }

    #[test]
    fn test_prepare_maps_to_original_resolution() {
        let (images, sizes) = history();
        let tool = CropTool::new(false);
        let payload = r#"{"bbox_2d": [10, 20, 60, 70], "source": "original_image"}"#;
        let prepared = tool.prepare(payload, &images, &sizes).unwrap();
        assert_eq!(prepared.source_index, 0);
        assert_eq!(prepared.region, [20, 40, 120, 140]);

        let ToolObservation::Image(crop) = tool.execute(&prepared, &images).unwrap() else {
            panic!("expected an image observation");
        };
        assert_eq!(ImageSize::of(&crop), ImageSize::new(100, 100));
    }

    #[test]
    fn test_prepare_relative_coordinates() {
        let (images, sizes) = history();
        let tool = CropTool::new(true);
        let payload = r#"{"bbox_2d": [0.0, 0.0, 0.5, 0.5], "source": "original_image"}"#;
        let prepared = tool.prepare(payload, &images, &sizes).unwrap();
        assert_eq!(prepared.region, [0, 0, 200, 100]);
    }

    #[test]
    fn test_prepare_widens_tiny_boxes() {
        let (images, sizes) = history();
        let tool = CropTool::new(false);
        let payload = r#"{"bbox_2d": [100, 50, 101, 51], "source": "original_image"}"#;
        let prepared = tool.prepare(payload, &images, &sizes).unwrap();
        let [l, t, r, b] = prepared.region;
        assert_eq!(r - l, MIN_SIDE);
        assert_eq!(b - t, MIN_SIDE);
    }

    #[test]
    fn test_prepare_rejects_bad_calls() {
        let (images, sizes) = history();
        let tool = CropTool::new(false);
        for payload in [
            "not json",
            r#"{"bbox_2d": [10, 10, 5, 50], "source": "original_image"}"#,
            r#"{"bbox_2d": [0, 0, 10, 10], "source": "observation_3"}"#,
            r#"{"bbox_2d": [0, 0, 10, 10], "source": "somewhere"}"#,
            r#"{"bbox_2d": [0, 0, 10], "source": "original_image"}"#,
        ] {
            assert!(tool.prepare(payload, &images, &sizes).is_err(), "{payload}");
        }
    }
}
