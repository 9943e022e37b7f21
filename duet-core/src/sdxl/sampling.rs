use std::time::Instant;

use anyhow::Result;
use candle_core::{Device, Shape, Tensor};
use candle_transformers::models::stable_diffusion::{
    schedulers::Scheduler, unet_2d::UNet2DConditionModel,
};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// Standard normal f32 noise drawn on the host, so a seed reproduces a run on every
/// device.
pub fn randn<S: Into<Shape>>(rng: &mut StdRng, shape: S, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = StandardNormal
        .sample_iter(&mut *rng)
        .take(shape.elem_count())
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Guidance scales at or below one disable classifier-free guidance.
pub fn use_guidance(guidance: f64) -> bool {
    guidance > 1.0
}

/// Index of the first timestep the refiner runs, `strength` being the fraction of the
/// schedule it re-denoises.
pub fn refine_start(n_steps: usize, strength: f64) -> usize {
    let refine_steps = ((n_steps as f64 * strength) as usize).min(n_steps);
    n_steps - refine_steps
}

/// Mixes the (unconditional, conditional) halves of a guided noise prediction.
pub fn apply_guidance(noise_pred: &Tensor, guidance: f64) -> Result<Tensor> {
    let noise_pred = noise_pred.chunk(2, 0)?;
    let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
    Ok((uncond + ((text - uncond)? * guidance)?)?)
}

/// Runs the scheduler from `t_start` to the end of its schedule.
pub fn denoise(
    stage: &str,
    unet: &UNet2DConditionModel,
    scheduler: &mut dyn Scheduler,
    mut latents: Tensor,
    text_embeddings: &Tensor,
    guidance: f64,
    t_start: usize,
) -> Result<Tensor> {
    let guided = use_guidance(guidance);
    let timesteps = scheduler.timesteps().to_vec();
    let total = timesteps.len();
    for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
        let start_time = Instant::now();
        let model_input = if guided {
            Tensor::cat(&[&latents, &latents], 0)?
        } else {
            latents.clone()
        };
        let model_input = scheduler.scale_model_input(model_input, timestep)?;

        let noise_pred = unet.forward(&model_input, timestep as f64, text_embeddings)?;
        let noise_pred = if guided {
            apply_guidance(&noise_pred, guidance)?
        } else {
            noise_pred
        };

        latents = scheduler.step(&noise_pred, timestep, &latents)?;
        tracing::debug!(
            "{stage} step {}/{total} done, {:.2}s",
            index + 1,
            start_time.elapsed().as_secs_f32()
        );
    }
    Ok(latents)
}
