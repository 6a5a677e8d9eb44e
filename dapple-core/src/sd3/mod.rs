//! SD3 / SD3.5: MMDiT denoiser, CLIP-L + CLIP-G + T5 conditioning, 16 channel VAE.
//!
//! The SAI single-file checkpoints carry the MMDiT under `model.diffusion_model`
//! and the VAE under `first_stage_model`; text encoders live next to them in
//! `text_encoders/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::mmdit::model::{Config as MMDiTConfig, MMDiT};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use hf_hub::api::tokio::Api;
use hf_hub::{Repo, RepoType};
use image::DynamicImage;
use tracing::{debug, info, warn};

mod sampling;
mod text_encoder;

use sampling::{
    euler_sample, latent_size, noise_latents, sigmas, uses_guidance, Conditioning, DEFAULT_TIME_SHIFT,
};
use text_encoder::{TextEncoderFiles, TripleTextEncoder};

use crate::stable_diffusion::weights::{CLIP_BIGG_TOKENIZER_REPO, CLIP_LARGE_TOKENIZER_REPO};
use crate::{
    fetch, image_to_tensor, init_start_step, preferred_dtype, select_best_device, tensor_to_image,
    AttentionSlicing, GenerationJob, LoadOptions, Loader, ModelSpec, Pipeline,
};

const T5_CONFIG_REPO: &str = "google/t5-v1_1-xxl";
const T5_CONFIG_REVISION: &str = "refs/pr/2";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";

/// Latent normalization of the SD3 VAE.
const VAE_SCALE: f64 = 1.5305;
const VAE_SHIFT: f64 = 0.0609;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sd3Variant {
    V3Medium,
    V3_5Medium,
    V3_5Large,
    V3_5LargeTurbo,
}

impl Sd3Variant {
    pub fn for_id(model_id: &str) -> Self {
        let name = model_id.to_lowercase();
        let is_3_5 = ["3.5", "3_5", "3-5"].iter().any(|v| name.contains(v));

        if !is_3_5 {
            Sd3Variant::V3Medium
        } else if name.contains("large") && name.contains("turbo") {
            Sd3Variant::V3_5LargeTurbo
        } else if name.contains("large") {
            Sd3Variant::V3_5Large
        } else {
            Sd3Variant::V3_5Medium
        }
    }

    /// Single-file checkpoint holding the MMDiT and the VAE.
    pub fn weights_file(self) -> &'static str {
        match self {
            Sd3Variant::V3Medium => "sd3_medium.safetensors",
            Sd3Variant::V3_5Medium => "sd3.5_medium.safetensors",
            Sd3Variant::V3_5Large => "sd3.5_large.safetensors",
            Sd3Variant::V3_5LargeTurbo => "sd3.5_large_turbo.safetensors",
        }
    }

    pub fn config(self) -> MMDiTConfig {
        match self {
            Sd3Variant::V3Medium => MMDiTConfig::sd3_medium(),
            Sd3Variant::V3_5Medium => MMDiTConfig::sd3_5_medium(),
            Sd3Variant::V3_5Large | Sd3Variant::V3_5LargeTurbo => MMDiTConfig::sd3_5_large(),
        }
    }

    /// Turbo is distilled to run without classifier-free guidance.
    pub fn is_distilled(self) -> bool {
        self == Sd3Variant::V3_5LargeTurbo
    }
}

/// The single-file weights live in the non-`diffusers` repo.
pub fn weights_repo(model_id: &str) -> &str {
    model_id.strip_suffix("-diffusers").unwrap_or(model_id)
}

/// Maps the diffusers-style names candle's VAE asks for onto the SAI layout.
fn sd3_vae_vb_rename(name: &str) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    let mut renamed = Vec::with_capacity(parts.len());
    let mut i = 0;

    while i < parts.len() {
        let next = parts.get(i + 1).copied();
        match parts[i] {
            "down_blocks" => renamed.push("down"),
            "mid_block" => renamed.push("mid"),
            "up_blocks" => {
                renamed.push("up");
                // SAI numbers decoder blocks from the lowest resolution up.
                match next {
                    Some("0") => renamed.push("3"),
                    Some("1") => renamed.push("2"),
                    Some("2") => renamed.push("1"),
                    Some("3") => renamed.push("0"),
                    Some(other) => renamed.push(other),
                    None => {}
                }
                i += 1;
            }
            "resnets" if i > 0 && parts[i - 1] == "mid_block" => {
                match next {
                    Some("0") => renamed.push("block_1"),
                    Some("1") => renamed.push("block_2"),
                    _ => {}
                }
                i += 1;
            }
            "resnets" => renamed.push("block"),
            "downsamplers" => {
                renamed.push("downsample");
                i += 1;
            }
            "upsamplers" => {
                renamed.push("upsample");
                i += 1;
            }
            "attentions" => {
                if next == Some("0") {
                    renamed.push("attn_1");
                }
                i += 1;
            }
            "conv_shortcut" => renamed.push("nin_shortcut"),
            "group_norm" => renamed.push("norm"),
            "query" => renamed.push("q"),
            "key" => renamed.push("k"),
            "value" => renamed.push("v"),
            "proj_attn" => renamed.push("proj_out"),
            "conv_norm_out" => renamed.push("norm_out"),
            other => renamed.push(other),
        }
        i += 1;
    }
    renamed.join(".")
}

fn build_vae(vb: VarBuilder) -> Result<AutoEncoderKL> {
    let config = AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 16,
        norm_num_groups: 32,
        use_quant_conv: false,
        use_post_quant_conv: false,
    };
    let vb = vb.rename_f(sd3_vae_vb_rename).pp("first_stage_model");
    Ok(AutoEncoderKL::new(vb, 3, 3, config)?)
}

/// Local paths of everything an SD3 pipeline needs.
#[derive(Debug, Clone)]
pub struct Sd3Files {
    pub weights: PathBuf,
    pub text: TextEncoderFiles,
}

impl Sd3Files {
    pub async fn fetch(api: &Api, repo: &str, variant: Sd3Variant) -> Result<Self> {
        let weights = fetch(api, repo, variant.weights_file()).await?;

        let t5_config = api
            .repo(Repo::with_revision(
                T5_CONFIG_REPO.to_string(),
                RepoType::Model,
                T5_CONFIG_REVISION.to_string(),
            ))
            .get("config.json")
            .await
            .with_context(|| format!("failed to fetch config.json from {T5_CONFIG_REPO}"))?;

        let text = TextEncoderFiles {
            clip_l: fetch(api, repo, "text_encoders/clip_l.safetensors").await?,
            clip_l_tokenizer: fetch(api, CLIP_LARGE_TOKENIZER_REPO, "tokenizer.json").await?,
            clip_g: fetch(api, repo, "text_encoders/clip_g.safetensors").await?,
            clip_g_tokenizer: fetch(api, CLIP_BIGG_TOKENIZER_REPO, "tokenizer.json").await?,
            t5: fetch(api, repo, "text_encoders/t5xxl_fp16.safetensors").await?,
            t5_config,
            t5_tokenizer: fetch(api, T5_TOKENIZER_REPO, T5_TOKENIZER_FILE).await?,
        };

        Ok(Self { weights, text })
    }
}

pub struct Sd3Model {
    variant: Sd3Variant,
    device: Device,
    dtype: DType,
    text: TripleTextEncoder,
    mmdit: MMDiT,
    vae: AutoEncoderKL,
}

impl Sd3Model {
    fn build(variant: Sd3Variant, files: Sd3Files, device: Device, dtype: DType) -> Result<Self> {
        let text = TripleTextEncoder::load(&files.text, &device, dtype)?;

        let vb = map_weights(&files.weights, dtype, &device)?;
        let mmdit = MMDiT::new(&variant.config(), false, vb.pp("model.diffusion_model"))
            .context("failed to load MMDiT")?;
        let vae = build_vae(vb).context("failed to load VAE")?;

        Ok(Self {
            variant,
            device,
            dtype,
            text,
            mmdit,
            vae,
        })
    }
}

fn map_weights(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            .with_context(|| format!("failed to map {}", path.display()))?
    };
    Ok(vb)
}

impl Pipeline for Sd3Model {
    fn run(&self, job: &GenerationJob) -> Result<DynamicImage> {
        let params = job.params;
        let (width, height) = (params.width, params.height);

        if let Some(seed) = job.seed {
            if let Err(err) = self.device.set_seed(seed) {
                warn!(seed, error = %err, "ignoring seed");
            }
        }

        let guidance_scale = if self.variant.is_distilled() {
            0.0
        } else {
            params.guidance_scale
        };

        // --- Conditioning, conditional batch first ---
        let (context, y) = self.text.encode(&job.prompt, &self.device)?;
        let (context, y) = if uses_guidance(guidance_scale) {
            let negative = job.negative_prompt.as_deref().unwrap_or("");
            let (uncond_context, uncond_y) = self.text.encode(negative, &self.device)?;
            (
                Tensor::cat(&[&context, &uncond_context], 0)?,
                Tensor::cat(&[&y, &uncond_y], 0)?,
            )
        } else {
            (context, y)
        };
        let cond = Conditioning {
            y: &y,
            context: &context,
            guidance_scale,
        };

        // --- Starting latents ---
        let sigmas = sigmas(params.steps, DEFAULT_TIME_SHIFT);
        let (latent_h, latent_w) = latent_size(width, height);
        let noise = Tensor::randn(0f32, 1f32, (1, 16, latent_h, latent_w), &self.device)?
            .to_dtype(self.dtype)?;
        let (x, start) = match &job.init_image {
            Some(init) => {
                let image = image_to_tensor(&init.image, latent_w * 8, latent_h * 8, &self.device)?
                    .to_dtype(self.dtype)?;
                let latents = ((self.vae.encode(&image)?.sample()? - VAE_SHIFT)? * VAE_SCALE)?;
                let start = init_start_step(sigmas.len() - 1, init.strength);
                (noise_latents(&latents, &noise, sigmas[start])?, start)
            }
            None => (noise, 0),
        };
        debug!(start, steps = sigmas.len() - 1, guidance_scale, "sampling");

        let latents = euler_sample(&self.mmdit, x, &cond, &sigmas[start..])?;

        // --- Decode and map [-1, 1] to u8 pixels ---
        let decoded = self.vae.decode(&((latents / VAE_SCALE)? + VAE_SHIFT)?)?;
        let img = decoded.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let img = ((img.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
            .to_dtype(DType::U8)?
            .i(0)?;
        let image = tensor_to_image(&img)?;

        if (image.width() as usize, image.height() as usize) != (width, height) {
            Ok(image.crop_imm(0, 0, width as u32, height as u32))
        } else {
            Ok(image)
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

pub struct Sd3Loader {
    api: Api,
    options: LoadOptions,
}

impl Sd3Loader {
    pub fn new(api: Api, options: LoadOptions) -> Self {
        Self { api, options }
    }
}

#[async_trait]
impl Loader for Sd3Loader {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn Pipeline>> {
        let variant = Sd3Variant::for_id(&spec.id);
        let repo = weights_repo(&spec.id);

        let device = select_best_device(self.options.device_map).context("failed to set up device")?;
        let dtype = preferred_dtype(&device);
        if self.options.attention_slicing == AttentionSlicing::On {
            warn!(model = %spec.id, "attention slicing is not supported by MMDiT, ignoring");
        }

        let files = Sd3Files::fetch(&self.api, repo, variant).await?;
        info!(model = %spec.id, ?variant, ?dtype, "weights available, building pipeline");

        let model = tokio::task::spawn_blocking(move || Sd3Model::build(variant, files, device, dtype))
            .await
            .context("pipeline construction task failed")??;

        Ok(Arc::new(model))
    }
}
