use anyhow::{Context, Error as E, Result};
use candle_core::{Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::clip::{ClipTextTransformer, Config};
use tokenizers::Tokenizer;

const END_OF_TEXT: &str = "<|endoftext|>";

/// A CLIP tokenizer paired with its text transformer.
pub struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
    eos_id: u32,
    device: Device,
}

impl TextEncoder {
    pub fn new(
        tokenizer: Tokenizer,
        model: ClipTextTransformer,
        config: &Config,
        device: &Device,
    ) -> Result<Self> {
        let vocab = tokenizer.get_vocab(true);
        let eos_id = *vocab
            .get(END_OF_TEXT)
            .with_context(|| format!("tokenizer has no {END_OF_TEXT} token"))?;
        let pad_id = match &config.pad_with {
            Some(padding) => *vocab
                .get(padding.as_str())
                .with_context(|| format!("tokenizer has no padding token {padding:?}"))?,
            None => eos_id,
        };
        Ok(Self {
            tokenizer,
            model,
            max_len: config.max_position_embeddings,
            pad_id,
            eos_id,
            device: device.clone(),
        })
    }

    pub fn token_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        Ok(fit_tokens(tokens, self.max_len, self.pad_id, self.eos_id))
    }

    /// Hidden states with shape (1, max_len, embed_dim).
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self.token_ids(prompt)?;
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Truncates to `max_len` keeping the end-of-text marker, then pads.
pub fn fit_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32, eos_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        tracing::warn!(
            "prompt is too long, {} > max-tokens ({max_len}), truncating",
            tokens.len()
        );
        tokens.truncate(max_len - 1);
        tokens.push(eos_id);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

/// Prepends the unconditional embedding used by classifier-free guidance. An empty
/// negative prompt is represented by zeros.
pub fn with_unconditional(cond: Tensor, guided: bool) -> Result<Tensor> {
    if guided {
        Ok(Tensor::cat(&[&cond.zeros_like()?, &cond], 0)?)
    } else {
        Ok(cond)
    }
}
