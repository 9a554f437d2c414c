//! The generation engine seam.
//!
//! The engine is shared by every in-flight request and must batch device work
//! internally. The state machine only needs one call per turn plus the
//! lifecycle hooks.

use std::sync::Arc;

use anyhow::Result;
use futures::stream::BoxStream;
use futures::StreamExt;
use image::DynamicImage;

use super::types::{GenerationOutput, SamplingParams};

/// Token context and images for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct EnginePrompt<'a> {
    pub token_ids: &'a [u32],
    pub images: &'a [Arc<DynamicImage>],
}

/// An inference backend that continues a token context.
#[allow(async_fn_in_trait)]
pub trait GenerationEngine: Send + Sync {
    /// Start generating and stream partial outputs; the last item is final.
    fn generate<'a>(
        &'a self,
        prompt: EnginePrompt<'a>,
        params: &'a SamplingParams,
        request_id: &'a str,
    ) -> BoxStream<'a, Result<GenerationOutput>>;

    /// Reload weights and caches before a rollout round.
    async fn wake_up(&self) -> Result<()> {
        Ok(())
    }

    /// Release device memory after a rollout round.
    async fn sleep(&self) -> Result<()> {
        Ok(())
    }
}

/// Drain an output stream and keep the final output.
pub async fn final_output(
    mut stream: BoxStream<'_, Result<GenerationOutput>>,
) -> Result<GenerationOutput> {
    let mut last = None;
    while let Some(output) = stream.next().await {
        last = Some(output?);
    }
    last.ok_or_else(|| anyhow::anyhow!("generation stream ended without output"))
}
