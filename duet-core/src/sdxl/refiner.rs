use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig, schedulers::SchedulerConfig, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use image::DynamicImage;
use rand::rngs::StdRng;

use super::{
    config::VAE_SCALE,
    sampling,
    text::{with_unconditional, TextEncoder},
};
use crate::{
    pipeline::{Latents, RefineStage},
    util::{decoded_to_pixels, tensor_to_image},
    GenerationParams,
};

/// Second stage: re-noises the base latents part way and finishes denoising with the
/// refiner UNet, then decodes with the shared VAE.
pub struct SdxlRefiner {
    pub(super) dtype: DType,
    pub(super) device: Device,
    pub(super) clip_g: Arc<TextEncoder>,
    pub(super) unet: UNet2DConditionModel,
    pub(super) vae: Arc<AutoEncoderKL>,
    pub(super) scheduler: DDIMSchedulerConfig,
}

impl RefineStage for SdxlRefiner {
    fn refine(
        &self,
        prompt: &str,
        latents: Latents,
        params: &GenerationParams,
        rng: &mut StdRng,
    ) -> Result<DynamicImage> {
        let guided = sampling::use_guidance(params.guidance);
        let text_embeddings =
            with_unconditional(self.clip_g.encode(prompt)?, guided)?.to_dtype(self.dtype)?;

        let mut scheduler = self.scheduler.build(params.steps)?;
        let t_start = sampling::refine_start(params.steps, params.strength);
        let latents = latents
            .tensor()
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let latents = match scheduler.timesteps().get(t_start).copied() {
            Some(timestep) => {
                let noise =
                    sampling::randn(rng, latents.dims4()?, &self.device)?.to_dtype(self.dtype)?;
                scheduler.add_noise(&latents, noise, timestep)?
            }
            None => latents,
        };

        tracing::info!(
            steps = params.steps.saturating_sub(t_start),
            "starting refiner sampling"
        );
        let latents = sampling::denoise(
            "refiner",
            &self.unet,
            scheduler.as_mut(),
            latents,
            &text_embeddings,
            params.guidance,
            t_start,
        )?;

        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let pixels = decoded_to_pixels(&decoded.to_dtype(DType::F32)?)?;
        tensor_to_image(&pixels)
    }
}
