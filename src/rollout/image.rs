//! Image geometry for prompt and observation images.
//!
//! Observations are resized so their pixel count lands inside
//! `[min_pixels, max_pixels]` before they are attached to the context.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

use crate::error::{RemoraError, Result};

/// Smallest side the vision encoder accepts (one merged patch).
pub const MIN_SIDE: u32 = 28;

/// Long-to-short ratio at which the short side is grown.
pub const MAX_ASPECT_RATIO: u32 = 200;

/// Ratio an over-long image is brought back to.
const REPAIRED_ASPECT_RATIO: u32 = 190;

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(image: &DynamicImage) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Target size for an image so its area falls inside `[min_pixels, max_pixels]`.
///
/// Both sides are scaled by the same factor, so the aspect ratio is kept.
/// Images that are already inside the range keep their size. The result is
/// then repaired for the vision encoder: a short side under [`MIN_SIDE`] is
/// scaled up to it, and a ratio of [`MAX_ASPECT_RATIO`] or more is narrowed
/// by growing the short side.
pub fn fit_image_size(size: ImageSize, max_pixels: usize, min_pixels: usize) -> Result<ImageSize> {
    if size.width == 0 || size.height == 0 {
        return Err(RemoraError::InvalidImage(format!(
            "empty image {}x{}",
            size.width, size.height
        )));
    }

    let (mut width, mut height) = (size.width, size.height);
    let area = size.pixels() as f64;
    if area > max_pixels as f64 {
        let factor = (max_pixels as f64 / area).sqrt();
        width = ((f64::from(width) * factor) as u32).max(1);
        height = ((f64::from(height) * factor) as u32).max(1);
    }
    let area = u64::from(width) * u64::from(height);
    if (area as f64) < min_pixels as f64 {
        let factor = (min_pixels as f64 / area as f64).sqrt();
        width = (f64::from(width) * factor) as u32;
        height = (f64::from(height) * factor) as u32;
    }

    let short = width.min(height);
    if short < MIN_SIDE {
        let factor = f64::from(MIN_SIDE) / f64::from(short);
        width = (f64::from(width) * factor + 1.0) as u32;
        height = (f64::from(height) * factor + 1.0) as u32;
    }

    if width / height >= MAX_ASPECT_RATIO {
        height = width / REPAIRED_ASPECT_RATIO + 1;
    } else if height / width >= MAX_ASPECT_RATIO {
        width = height / REPAIRED_ASPECT_RATIO + 1;
    }
    Ok(ImageSize { width, height })
}

/// Resize `image` to [`fit_image_size`] with a triangle filter.
pub fn resize_to_fit(image: &DynamicImage, max_pixels: usize, min_pixels: usize) -> Result<DynamicImage> {
    let current = ImageSize::of(image);
    let target = fit_image_size(current, max_pixels, min_pixels)?;
    if target == current {
        return Ok(image.clone());
    }
    Ok(image.resize_exact(target.width, target.height, FilterType::Triangle))
}
