use anyhow::Result;
use candle_core::Tensor;
use image::DynamicImage;
use rand::{rngs::StdRng, SeedableRng};

use crate::{GenerationParams, GenerationRequest, ModelLike};

/// Latent-space output of the base stage. Only a [`LatentStage`] can produce one, so the
/// refiner is always fed what the base generated.
#[derive(Debug, Clone)]
pub struct Latents(Tensor);

impl Latents {
    pub(crate) fn new(latents: Tensor) -> Self {
        Self(latents)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }
}

/// Both stages draw their noise from the same generator, seeded once per call.
pub trait LatentStage: Send + Sync {
    fn generate_latents(
        &self,
        prompt: &str,
        params: &GenerationParams,
        rng: &mut StdRng,
    ) -> Result<Latents>;
}

pub trait RefineStage: Send + Sync {
    fn refine(
        &self,
        prompt: &str,
        latents: Latents,
        params: &GenerationParams,
        rng: &mut StdRng,
    ) -> Result<DynamicImage>;
}

/// Base model followed by refiner model.
pub struct TwoStagePipeline<B, R> {
    base: B,
    refiner: R,
}

impl<B, R> TwoStagePipeline<B, R> {
    pub(crate) fn new(base: B, refiner: R) -> Self {
        Self { base, refiner }
    }
}

impl<B: LatentStage, R: RefineStage> ModelLike for TwoStagePipeline<B, R> {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        let params = GenerationParams::try_from(&request)?;
        let seed = params.seed.unwrap_or_else(rand::random::<u64>);
        tracing::info!(seed, "Using seed");
        let mut rng = StdRng::seed_from_u64(seed);

        let latents = self
            .base
            .generate_latents(&request.prompt, &params, &mut rng)?;
        tracing::info!(dims = ?latents.tensor().dims(), "base stage produced latents");

        let image = self
            .refiner
            .refine(&request.prompt, latents, &params, &mut rng)?;
        tracing::info!(
            width = image.width(),
            height = image.height(),
            "refiner stage produced image"
        );
        Ok(image)
    }
}
