use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip,
    unet_2d::{UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::AutoEncoderKL,
};
use hf_hub::api::tokio::{Api, ApiRepo};
use tokenizers::Tokenizer;

mod base;
mod config;
mod refiner;
mod sampling;
mod text;

pub use base::SdxlBase;
pub use refiner::SdxlRefiner;
use text::TextEncoder;

use crate::{pipeline::TwoStagePipeline, select_best_device, DeviceMap, Loader, ModelSource};

pub type SdxlModel = TwoStagePipeline<SdxlBase, SdxlRefiner>;

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Model = SdxlModel;

    async fn load(source: &ModelSource, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = if source.use_f16 {
            DType::F16
        } else {
            DType::F32
        };
        let use_flash_attn = source.use_flash_attn && cfg!(feature = "flash-attn");
        if source.use_flash_attn && !use_flash_attn {
            tracing::warn!(
                "flash attention requested but not compiled in, build with `--features flash-attn`"
            );
        }

        let base_repo = api.model(source.base.clone());
        let refiner_repo = api.model(source.refiner.clone());

        // --- Text encoders, the bigG one is shared with the refiner ---
        tracing::info!("Building the CLIP transformers");
        let clip_l = text_encoder(
            &api.model(config::CLIP_L_TOKENIZER_REPO.to_string()),
            &base_repo,
            config::clip_l_file(source.use_f16),
            &config::clip_l(),
            &device,
        )
        .await
        .context("failed to load CLIP ViT-L text encoder")?;
        let clip_g = text_encoder(
            &api.model(config::CLIP_G_TOKENIZER_REPO.to_string()),
            &base_repo,
            config::clip_g_file(source.use_f16),
            &config::clip_g(),
            &device,
        )
        .await
        .context("failed to load OpenCLIP ViT-bigG text encoder")?;
        let clip_g = Arc::new(clip_g);

        // --- Autoencoder, shared with the refiner ---
        tracing::info!("Building the autoencoder");
        let vae_file = if source.use_f16 {
            api.model(config::VAE_FP16_FIX_REPO.to_string())
                .get(config::VAE_FP16_FIX_FILE)
                .await
        } else {
            base_repo.get(config::vae_file(false)).await
        };
        let vae_file = vae_file.context("failed to get autoencoder model file")?;
        let vae_vb = var_builder(vae_file, dtype, &device)
            .context("failed to build autoencoder var builder")?;
        let vae = AutoEncoderKL::new(vae_vb, 3, 3, config::vae())
            .context("failed to load autoencoder")?;

        // --- UNets ---
        tracing::info!(base = %source.base, "Building the base unet");
        let base_unet = unet(
            &base_repo,
            source.use_f16,
            config::base_unet(),
            use_flash_attn,
            dtype,
            &device,
        )
        .await
        .context("failed to load base unet")?;
        tracing::info!(refiner = %source.refiner, "Building the refiner unet");
        let refiner_config = config::refiner_unet();
        let mid_layers = config::mid_block_layers(&refiner_config);
        if mid_layers < config::REFINER_MID_BLOCK_LAYERS {
            tracing::warn!(
                "refiner mid block built with {mid_layers} transformer layer(s), the checkpoint has {}, \
                 the remaining layers are not loaded and refined images lose detail",
                config::REFINER_MID_BLOCK_LAYERS
            );
        }
        let refiner_unet = unet(
            &refiner_repo,
            source.use_f16,
            refiner_config,
            use_flash_attn,
            dtype,
            &device,
        )
        .await
        .context("failed to load refiner unet")?;

        let base = SdxlBase {
            device: device.clone(),
            dtype,
            clip_l,
            clip_g: clip_g.clone(),
            unet: base_unet,
            scheduler: config::scheduler(),
        };
        let refiner = SdxlRefiner {
            dtype,
            device,
            clip_g,
            unet: refiner_unet,
            vae: Arc::new(vae),
            scheduler: config::scheduler(),
        };
        Ok(TwoStagePipeline::new(base, refiner))
    }
}

fn var_builder(file: PathBuf, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
    Ok(vb)
}

async fn text_encoder(
    tokenizer_repo: &ApiRepo,
    weights_repo: &ApiRepo,
    weights_file: &str,
    clip_config: &clip::Config,
    device: &Device,
) -> Result<TextEncoder> {
    let tokenizer_file = tokenizer_repo
        .get(config::TOKENIZER_FILE)
        .await
        .context("failed to get tokenizer")?;
    let tokenizer = Tokenizer::from_file(tokenizer_file)
        .map_err(anyhow::Error::msg)
        .context("failed to load tokenizer")?;
    let weights = weights_repo
        .get(weights_file)
        .await
        .with_context(|| format!("failed to get {weights_file}"))?;
    // Text encoders always run in f32, their output is cast to the pipeline dtype.
    let model = build_clip_transformer(clip_config, weights, device, DType::F32)?;
    TextEncoder::new(tokenizer, model, clip_config, device)
}

async fn unet(
    repo: &ApiRepo,
    use_f16: bool,
    unet_config: UNet2DConditionModelConfig,
    use_flash_attn: bool,
    dtype: DType,
    device: &Device,
) -> Result<UNet2DConditionModel> {
    let weights = repo
        .get(config::unet_file(use_f16))
        .await
        .context("failed to get unet model file")?;
    let vb = var_builder(weights, dtype, device).context("failed to build unet var builder")?;
    let unet = UNet2DConditionModel::new(
        vb,
        config::LATENT_CHANNELS,
        config::LATENT_CHANNELS,
        use_flash_attn,
        unet_config,
    )?;
    Ok(unet)
}
