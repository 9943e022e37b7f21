use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, Loader, ModelLike, SdxlLoader};
use std::sync::Arc;

pub const SDXL_BASE_REPO: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const SDXL_REFINER_REPO: &str = "stabilityai/stable-diffusion-xl-refiner-1.0";

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    Sdxl,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION-XL") || name_upper.contains("SDXL") {
            Some(ModelType::Sdxl)
        } else {
            None
        }
    }
}

/// The two checkpoints making up a generation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSource {
    pub base: String,
    pub refiner: String,
    /// Load f16 weights. The VAE is swapped for the fp16-fix variant.
    pub use_f16: bool,
    pub use_flash_attn: bool,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            base: SDXL_BASE_REPO.to_string(),
            refiner: SDXL_REFINER_REPO.to_string(),
            use_f16: false,
            use_flash_attn: false,
        }
    }
}

impl ModelSource {
    pub fn model_type(&self) -> Result<ModelType> {
        let base = ModelType::from_name(&self.base)
            .ok_or_else(|| anyhow!("Unsupported base model: {}", self.base))?;
        let refiner = ModelType::from_name(&self.refiner)
            .ok_or_else(|| anyhow!("Unsupported refiner model: {}", self.refiner))?;
        if base != refiner {
            anyhow::bail!(
                "Base model {} ({base:?}) and refiner {} ({refiner:?}) are not compatible",
                self.base,
                self.refiner
            );
        }
        Ok(base)
    }
}

/// Load a pipeline based on its model names, automatically detecting the appropriate loader
pub async fn load_model(
    source: &ModelSource,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    let model_type = source.model_type()?;

    tracing::info!(
        base = %source.base,
        refiner = %source.refiner,
        "Loading models (detected type: {model_type:?})"
    );

    match model_type {
        ModelType::Sdxl => {
            let model = SdxlLoader::load(source, api, device_map).await?;
            Ok(Arc::new(model))
        }
    }
}
