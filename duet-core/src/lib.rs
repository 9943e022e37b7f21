pub mod activity;
pub mod app;
pub mod device_map;
pub mod error;
pub mod loader;
mod loader_factory;
mod pipeline;
mod util;

mod sdxl;

pub use activity::*;
pub use device_map::*;
pub use error::RequestError;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use pipeline::TwoStagePipeline;
pub use sdxl::{SdxlLoader, SdxlModel};
use serde::{Deserialize, Serialize};
pub use util::{image_to_png, select_best_device, tensor_to_image};

pub const DEFAULT_WIDTH: usize = 1024;
pub const DEFAULT_HEIGHT: usize = 1024;
pub const DEFAULT_STEPS: usize = 40;
pub const DEFAULT_GUIDANCE: f64 = 5.0;
pub const DEFAULT_REFINER_STRENGTH: f64 = 0.3;
/// Largest accepted width or height, in pixels.
pub const MAX_DIMENSION: usize = 4096;
/// The scheduler is trained on 1000 timesteps, more steps than that collapse the schedule.
pub const MAX_STEPS: usize = 1000;

/// Body of a call to the generation function.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Owner of the call, used for the activity log only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,
    /// Denoising steps, shared by the base and the refiner schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<f64>,
    /// Fraction of the schedule the refiner re-runs on the base latents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new<S: ToString>(prompt: S) -> Self {
        Self {
            prompt: prompt.to_string(),
            username: None,
            width: None,
            height: None,
            steps: None,
            guidance: None,
            strength: None,
            seed: None,
        }
    }
}

/// A request with defaults applied and all values checked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub strength: f64,
    pub seed: Option<u64>,
}

impl TryFrom<&GenerationRequest> for GenerationParams {
    type Error = RequestError;

    fn try_from(request: &GenerationRequest) -> Result<Self, Self::Error> {
        if request.prompt.trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        let width = request.width.unwrap_or(DEFAULT_WIDTH);
        let height = request.height.unwrap_or(DEFAULT_HEIGHT);
        for (name, value) in [("width", width), ("height", height)] {
            if value == 0 || value % 8 != 0 || value > MAX_DIMENSION {
                return Err(RequestError::InvalidDimension { name, value });
            }
        }
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        if !(1..=MAX_STEPS).contains(&steps) {
            return Err(RequestError::InvalidSteps(steps));
        }
        let guidance = request.guidance.unwrap_or(DEFAULT_GUIDANCE);
        if !guidance.is_finite() || guidance < 0. {
            return Err(RequestError::InvalidGuidance(guidance));
        }
        let strength = request.strength.unwrap_or(DEFAULT_REFINER_STRENGTH);
        if !(strength > 0. && strength <= 1.) {
            return Err(RequestError::InvalidStrength(strength));
        }
        Ok(Self {
            width,
            height,
            steps,
            guidance,
            strength,
            seed: request.seed,
        })
    }
}

/// Return value of the remote generation function.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionResult {
    pub result: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageResponse {
    /// Base64 encoded PNG.
    pub image: String,
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}
