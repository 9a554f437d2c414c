//! Tokenizer and image-processor seams, plus a patch-grid processor for
//! Qwen2-VL style vision encoders.

use std::sync::Arc;

use anyhow::{bail, Result};
use image::DynamicImage;
use ndarray::{Array2, ArrayView1};

use super::image::ImageSize;

/// Text to token ids and back. Shared read-only across requests.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
}

/// Grid metadata and rotary positions for images. Pixel work is not done here.
pub trait ImageProcessor: Send + Sync {
    /// `(t, h, w)` patch grid of each image.
    fn grid_thw(&self, images: &[Arc<DynamicImage>]) -> Result<Vec<[u32; 3]>>;

    /// Patches merged per side into one model token.
    fn merge_size(&self) -> u32;

    /// `(3, L)` rotary positions for one sequence.
    fn rope_index(
        &self,
        input_ids: ArrayView1<'_, u32>,
        grids: &[[u32; 3]],
        attention_mask: ArrayView1<'_, u8>,
    ) -> Result<Array2<i64>>;

    /// Model tokens one image expands to.
    fn image_token_count(&self, image: &Arc<DynamicImage>) -> Result<usize> {
        let grids = self.grid_thw(std::slice::from_ref(image))?;
        let grid = grids
            .first()
            .ok_or_else(|| anyhow::anyhow!("image processor returned no grid"))?;
        Ok(tokens_for_grid(*grid, self.merge_size()))
    }
}

/// `t * h * w / merge^2`.
pub fn tokens_for_grid(grid: [u32; 3], merge_size: u32) -> usize {
    let [t, h, w] = grid.map(|d| d as usize);
    let merge = (merge_size as usize).max(1);
    t * h * w / (merge * merge)
}

// ---------------------------------------------------------------------------
// Patch-grid processor
// ---------------------------------------------------------------------------

/// Grid and rotary index rules of a patch-based vision encoder.
#[derive(Debug, Clone)]
pub struct PatchGridProcessor {
    /// Side of one vision patch in pixels (default: 14).
    pub patch_size: u32,
    /// Patches merged per side (default: 2).
    pub merge_size: u32,
    /// Token id of the image placeholder.
    pub image_pad_token_id: u32,
}

impl PatchGridProcessor {
    pub fn new(image_pad_token_id: u32) -> Self {
        Self {
            patch_size: 14,
            merge_size: 2,
            image_pad_token_id,
        }
    }

    /// Grid for an image of `size`, rounding each side to whole merged patches.
    pub fn grid_for(&self, size: ImageSize) -> [u32; 3] {
        let factor = f64::from(self.patch_size * self.merge_size);
        let merged = |side: u32| ((f64::from(side) / factor).round() as u32).max(1);
        [
            1,
            merged(size.height) * self.merge_size,
            merged(size.width) * self.merge_size,
        ]
    }
}

impl ImageProcessor for PatchGridProcessor {
    fn grid_thw(&self, images: &[Arc<DynamicImage>]) -> Result<Vec<[u32; 3]>> {
        Ok(images
            .iter()
            .map(|image| self.grid_for(ImageSize::of(image)))
            .collect())
    }

    fn merge_size(&self) -> u32 {
        self.merge_size
    }

    /// Text tokens share one position across the three axes; each image run
    /// gets `(t, h, w)` offsets from the position after the preceding text.
    /// Positions outside the attention mask are 1.
    fn rope_index(
        &self,
        input_ids: ArrayView1<'_, u32>,
        grids: &[[u32; 3]],
        attention_mask: ArrayView1<'_, u8>,
    ) -> Result<Array2<i64>> {
        if input_ids.len() != attention_mask.len() {
            bail!(
                "input_ids has {} positions but attention_mask has {}",
                input_ids.len(),
                attention_mask.len()
            );
        }
        let mut positions = Array2::<i64>::ones((3, input_ids.len()));
        let live: Vec<usize> = (0..input_ids.len())
            .filter(|&i| attention_mask[i] == 1)
            .collect();

        let merge = self.merge_size.max(1) as usize;
        let mut grids = grids.iter();
        let mut next: i64 = 0;
        let mut cursor = 0;
        while cursor < live.len() {
            let idx = live[cursor];
            if input_ids[idx] != self.image_pad_token_id {
                for axis in 0..3 {
                    positions[[axis, idx]] = next;
                }
                next += 1;
                cursor += 1;
                continue;
            }

            let Some(&[t, h, w]) = grids.next() else {
                bail!("more image placeholders than image grids");
            };
            let (t, h, w) = (t as usize, h as usize / merge, w as usize / merge);
            let run = t * h * w;
            if cursor + run > live.len() {
                bail!("image run of {run} tokens overruns the sequence");
            }
            for k in 0..run {
                let idx = live[cursor + k];
                if input_ids[idx] != self.image_pad_token_id {
                    bail!("image run broken at position {idx}");
                }
                positions[[0, idx]] = next + (k / (h * w)) as i64;
                positions[[1, idx]] = next + ((k / w) % h) as i64;
                positions[[2, idx]] = next + (k % w) as i64;
            }
            next += t.max(h).max(w) as i64;
            cursor += run;
        }
        Ok(positions)
    }
}
