use candle_transformers::models::stable_diffusion::{
    clip,
    ddim::DDIMSchedulerConfig,
    schedulers::PredictionType,
    unet_2d::{BlockConfig, UNet2DConditionModelConfig},
    vae::AutoEncoderKLConfig,
};

/// https://huggingface.co/stabilityai/stable-diffusion-xl-base-1.0/blob/main/vae/config.json
pub const VAE_SCALE: f64 = 0.13025;
pub const LATENT_CHANNELS: usize = 4;
/// Spatial downsampling between pixels and latents.
pub const VAE_FACTOR: usize = 8;

pub const CLIP_L_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
pub const CLIP_G_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
// See https://github.com/huggingface/candle/issues/1060
pub const VAE_FP16_FIX_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";
pub const VAE_FP16_FIX_FILE: &str = "diffusion_pytorch_model.safetensors";

fn block(out_channels: usize, use_cross_attn: Option<usize>, heads: usize) -> BlockConfig {
    BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim: heads,
    }
}

// https://huggingface.co/stabilityai/stable-diffusion-xl-base-1.0/blob/main/unet/config.json
pub fn base_unet() -> UNet2DConditionModelConfig {
    UNet2DConditionModelConfig {
        blocks: vec![
            block(320, None, 5),
            block(640, Some(2), 10),
            block(1280, Some(10), 20),
        ],
        center_input_sample: false,
        cross_attention_dim: 2048,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: true,
    }
}

/// Transformer depth of the refiner checkpoint's mid block.
pub const REFINER_MID_BLOCK_LAYERS: usize = 4;

/// Mid-block transformer depth candle builds for `config`, taken from the last block.
pub fn mid_block_layers(config: &UNet2DConditionModelConfig) -> usize {
    config
        .blocks
        .last()
        .and_then(|block| block.use_cross_attn)
        .unwrap_or(1)
}

// https://huggingface.co/stabilityai/stable-diffusion-xl-refiner-1.0/blob/main/unet/config.json
pub fn refiner_unet() -> UNet2DConditionModelConfig {
    UNet2DConditionModelConfig {
        blocks: vec![
            block(384, None, 6),
            block(768, Some(4), 12),
            block(1536, Some(4), 24),
            block(1536, None, 24),
        ],
        center_input_sample: false,
        cross_attention_dim: 1280,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: true,
    }
}

pub fn vae() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: LATENT_CHANNELS,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

// https://huggingface.co/stabilityai/stable-diffusion-xl-base-1.0/blob/main/scheduler/scheduler_config.json
pub fn scheduler() -> DDIMSchedulerConfig {
    DDIMSchedulerConfig {
        prediction_type: PredictionType::Epsilon,
        ..Default::default()
    }
}

/// CLIP ViT-L, base only.
pub fn clip_l() -> clip::Config {
    clip::Config::sdxl()
}

/// OpenCLIP ViT-bigG, shared by base and refiner.
pub fn clip_g() -> clip::Config {
    clip::Config::sdxl2()
}

pub fn unet_file(use_f16: bool) -> &'static str {
    if use_f16 {
        "unet/diffusion_pytorch_model.fp16.safetensors"
    } else {
        "unet/diffusion_pytorch_model.safetensors"
    }
}

pub fn vae_file(use_f16: bool) -> &'static str {
    if use_f16 {
        "vae/diffusion_pytorch_model.fp16.safetensors"
    } else {
        "vae/diffusion_pytorch_model.safetensors"
    }
}

pub fn clip_l_file(use_f16: bool) -> &'static str {
    if use_f16 {
        "text_encoder/model.fp16.safetensors"
    } else {
        "text_encoder/model.safetensors"
    }
}

pub fn clip_g_file(use_f16: bool) -> &'static str {
    if use_f16 {
        "text_encoder_2/model.fp16.safetensors"
    } else {
        "text_encoder_2/model.safetensors"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attention_heads_are_64_channels_wide() {
        for config in [base_unet(), refiner_unet()] {
            for block in config.blocks {
                assert_eq!(block.out_channels / block.attention_head_dim, 64);
            }
        }
    }

    #[test]
    fn cross_attention_matches_text_encoders() {
        // Base attends over CLIP-L (768) and bigG (1280) concatenated, refiner over bigG only.
        assert_eq!(base_unet().cross_attention_dim, 768 + 1280);
        assert_eq!(refiner_unet().cross_attention_dim, 1280);
    }

    #[test]
    fn refiner_blocks_match_checkpoint_layout() {
        let refiner = refiner_unet();
        assert_eq!(refiner.blocks.len(), 4);
        assert!(refiner.blocks.last().unwrap().use_cross_attn.is_none());
        assert_eq!(refiner.blocks[1].use_cross_attn, Some(4));
    }

    #[test]
    fn refiner_mid_block_is_shallower_than_checkpoint() {
        assert_eq!(mid_block_layers(&base_unet()), 10);
        assert_eq!(mid_block_layers(&refiner_unet()), 1);
        assert!(mid_block_layers(&refiner_unet()) < REFINER_MID_BLOCK_LAYERS);
    }

    #[test]
    fn weight_files_follow_diffusers_layout() {
        assert_eq!(unet_file(false), "unet/diffusion_pytorch_model.safetensors");
        assert_eq!(clip_g_file(true), "text_encoder_2/model.fp16.safetensors");
        assert_eq!(vae_file(true), "vae/diffusion_pytorch_model.fp16.safetensors");
        assert_eq!(clip_l_file(false), "text_encoder/model.safetensors");
    }

    #[test]
    fn text_encoders_pad_to_77_tokens() {
        assert_eq!(clip_l().max_position_embeddings, 77);
        assert_eq!(clip_g().max_position_embeddings, 77);
        assert_eq!(clip_g().pad_with.as_deref(), Some("!"));
    }
}
