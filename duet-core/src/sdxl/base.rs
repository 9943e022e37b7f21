use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig, schedulers::SchedulerConfig, unet_2d::UNet2DConditionModel,
};
use rand::rngs::StdRng;

use super::{
    config::{LATENT_CHANNELS, VAE_FACTOR},
    sampling,
    text::{with_unconditional, TextEncoder},
};
use crate::{
    pipeline::{LatentStage, Latents},
    GenerationParams,
};

/// First stage: text to fully denoised latents.
pub struct SdxlBase {
    pub(super) device: Device,
    pub(super) dtype: DType,
    pub(super) clip_l: TextEncoder,
    pub(super) clip_g: Arc<TextEncoder>,
    pub(super) unet: UNet2DConditionModel,
    pub(super) scheduler: DDIMSchedulerConfig,
}

impl LatentStage for SdxlBase {
    fn generate_latents(
        &self,
        prompt: &str,
        params: &GenerationParams,
        rng: &mut StdRng,
    ) -> Result<Latents> {
        let guided = sampling::use_guidance(params.guidance);
        let text_embeddings = Tensor::cat(
            &[self.clip_l.encode(prompt)?, self.clip_g.encode(prompt)?],
            D::Minus1,
        )?;
        let text_embeddings = with_unconditional(text_embeddings, guided)?.to_dtype(self.dtype)?;

        let mut scheduler = self.scheduler.build(params.steps)?;
        let latents = sampling::randn(
            rng,
            (
                1,
                LATENT_CHANNELS,
                params.height / VAE_FACTOR,
                params.width / VAE_FACTOR,
            ),
            &self.device,
        )?;
        // scale the initial noise by the standard deviation required by the scheduler
        let latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        tracing::info!(steps = params.steps, "starting base sampling");
        let latents = sampling::denoise(
            "base",
            &self.unet,
            scheduler.as_mut(),
            latents,
            &text_embeddings,
            params.guidance,
            0,
        )?;
        Ok(Latents::new(latents))
    }
}
