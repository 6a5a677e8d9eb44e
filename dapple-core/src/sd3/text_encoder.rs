//! Prompt encoding for MMDiT models: two CLIP towers for the pooled vector and
//! T5-XXL for the long context.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::stable_diffusion::clip;
use candle_transformers::models::t5::{self, T5EncoderModel};
use tokenizers::Tokenizer;

/// Token window shared by all three encoders.
const MAX_TOKENS: usize = 77;
/// Width of the T5 context; the CLIP features are zero-padded up to it.
const CONTEXT_DIM: usize = 4096;

/// Local paths of the encoder weights, configs and tokenizers.
#[derive(Debug, Clone)]
pub struct TextEncoderFiles {
    pub clip_l: PathBuf,
    pub clip_l_tokenizer: PathBuf,
    pub clip_g: PathBuf,
    pub clip_g_tokenizer: PathBuf,
    pub t5: PathBuf,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(Error::msg)
        .with_context(|| format!("failed to load tokenizer {}", path.display()))
}

fn var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            .with_context(|| format!("failed to map {}", path.display()))?
    };
    Ok(vb)
}

struct ClipEncoder {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    pad_id: u32,
}

impl ClipEncoder {
    fn load(vb: VarBuilder, config: &clip::Config, tokenizer: &Path) -> Result<Self> {
        let tokenizer = load_tokenizer(tokenizer)?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("tokenizer has no padding token {pad_token:?}"))?;
        let model = clip::ClipTextTransformer::new(vb, config)?;
        Ok(Self {
            model,
            tokenizer,
            pad_id,
        })
    }

    /// Penultimate hidden states, and the final hidden state at the last
    /// prompt token as the pooled vector.
    fn encode(&self, prompt: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(MAX_TOKENS);
        let eos_position = tokens.len().saturating_sub(1);
        tokens.resize(MAX_TOKENS, self.pad_id);

        let input_ids = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        let (last, penultimate) = self
            .model
            .forward_until_encoder_layer(&input_ids, usize::MAX, -2)?;
        let pooled = last.i((0, eos_position, ..))?;
        Ok((penultimate, pooled))
    }
}

struct T5Encoder {
    // The encoder keeps an internal cache, so forward needs exclusive access.
    model: Mutex<T5EncoderModel>,
    tokenizer: Tokenizer,
}

impl T5Encoder {
    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(MAX_TOKENS, 0);
        let input_ids = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("T5 encoder lock poisoned"))?;
        // T5 overflows in half precision, so its activations stay in F32.
        Ok(model.forward_dt(&input_ids, Some(DType::F32))?)
    }
}

pub struct TripleTextEncoder {
    clip_l: ClipEncoder,
    clip_g: ClipEncoder,
    clip_g_projection: Linear,
    t5: T5Encoder,
    dtype: DType,
}

impl TripleTextEncoder {
    pub fn load(files: &TextEncoderFiles, device: &Device, dtype: DType) -> Result<Self> {
        let clip_l = ClipEncoder::load(
            var_builder(&files.clip_l, dtype, device)?,
            &clip::Config::sdxl(),
            &files.clip_l_tokenizer,
        )
        .context("failed to load CLIP-L")?;

        let clip_g_vb = var_builder(&files.clip_g, dtype, device)?;
        let clip_g_projection = candle_nn::linear_no_bias(1280, 1280, clip_g_vb.pp("text_projection"))
            .context("failed to load CLIP-G projection")?;
        let clip_g = ClipEncoder::load(clip_g_vb, &clip::Config::sdxl2(), &files.clip_g_tokenizer)
            .context("failed to load CLIP-G")?;

        // --- T5 ---
        let config = std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let config: t5::Config = serde_json::from_str(&config).context("failed to parse T5 config")?;
        let model = T5EncoderModel::load(var_builder(&files.t5, dtype, device)?, &config)
            .context("failed to load T5 model")?;
        let t5 = T5Encoder {
            model: Mutex::new(model),
            tokenizer: load_tokenizer(&files.t5_tokenizer)?,
        };

        Ok(Self {
            clip_l,
            clip_g,
            clip_g_projection,
            t5,
            dtype,
        })
    }

    /// Returns `(context, y)`: the `(1, 154, 4096)` token context and the
    /// `(1, 2048)` pooled vector.
    pub fn encode(&self, prompt: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let (clip_l_hidden, clip_l_pooled) = self.clip_l.encode(prompt, device)?;
        let (clip_g_hidden, clip_g_pooled) = self.clip_g.encode(prompt, device)?;
        let clip_g_pooled = self
            .clip_g_projection
            .forward(&clip_g_pooled.unsqueeze(0)?)?
            .squeeze(0)?;

        let y = Tensor::cat(&[&clip_l_pooled, &clip_g_pooled], 0)?.unsqueeze(0)?;
        let clip_hidden = Tensor::cat(&[&clip_l_hidden, &clip_g_hidden], D::Minus1)?;
        let clip_width = clip_hidden.dim(D::Minus1)?;
        let clip_hidden = clip_hidden.pad_with_zeros(D::Minus1, 0, CONTEXT_DIM - clip_width)?;

        let t5_hidden = self.t5.encode(prompt, device)?.to_dtype(self.dtype)?;
        let context = Tensor::cat(&[&clip_hidden, &t5_hidden], D::Minus2)?;
        Ok((context, y.to_dtype(self.dtype)?))
    }
}
