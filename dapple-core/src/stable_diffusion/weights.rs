use std::path::PathBuf;

use anyhow::{bail, Result};
use candle_core::DType;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use hf_hub::api::tokio::Api;

use crate::{fetch, ModelFamily, ModelSpec};

const SDXL_BASE_REPO: &str = "stabilityai/stable-diffusion-xl-base-1.0";
const SDXL_FP16_VAE_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";
const CLIP_BASE_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
pub(crate) const CLIP_LARGE_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
pub(crate) const CLIP_BIGG_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
const LIGHTNING_UNET: &str = "sdxl_lightning_4step_unet.safetensors";

/// UNet / VAE layout of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    V1_5,
    V2_1,
    Xl,
    Turbo,
    /// SDXL weights with a step-distilled UNet.
    Lightning,
}

impl Architecture {
    pub fn for_spec(spec: &ModelSpec) -> Result<Self> {
        let id = spec.id.to_lowercase();
        Ok(match spec.family {
            ModelFamily::Standard if id.contains("2-1") || id.contains("2.1") || id.contains("v2") => {
                Architecture::V2_1
            }
            ModelFamily::Standard => Architecture::V1_5,
            ModelFamily::Turbo => Architecture::Turbo,
            ModelFamily::Lightning => Architecture::Lightning,
            ModelFamily::Xl => Architecture::Xl,
            ModelFamily::NextGen => bail!("{} is not a UNet checkpoint", spec.id),
        })
    }

    pub fn config(
        self,
        sliced_attention_size: Option<usize>,
        height: Option<usize>,
        width: Option<usize>,
    ) -> StableDiffusionConfig {
        match self {
            Architecture::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, height, width),
            Architecture::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, height, width),
            Architecture::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, height, width),
            // Lightning wants trailing timesteps with an Euler sampler, which is
            // how the turbo config schedules.
            Architecture::Turbo | Architecture::Lightning => {
                StableDiffusionConfig::sdxl_turbo(sliced_attention_size, height, width)
            }
        }
    }

    pub fn is_xl(self) -> bool {
        matches!(self, Architecture::Xl | Architecture::Turbo | Architecture::Lightning)
    }

    /// Latent scaling factor of the VAE.
    pub fn vae_scale(self) -> f64 {
        if self.is_xl() {
            0.13025
        } else {
            0.18215
        }
    }
}

/// Local paths of every file a pipeline needs.
#[derive(Debug, Clone)]
pub struct ComponentFiles {
    pub tokenizer: PathBuf,
    pub clip: PathBuf,
    /// Second tokenizer and text encoder, XL-class models only.
    pub tokenizer_2: Option<PathBuf>,
    pub clip_2: Option<PathBuf>,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl ComponentFiles {
    pub async fn fetch(api: &Api, spec: &ModelSpec, arch: Architecture, dtype: DType) -> Result<Self> {
        let base_repo = match arch {
            Architecture::Lightning => SDXL_BASE_REPO,
            _ => spec.id.as_str(),
        };

        let tokenizer_repo = if arch.is_xl() {
            CLIP_LARGE_TOKENIZER_REPO
        } else {
            CLIP_BASE_TOKENIZER_REPO
        };
        let tokenizer = fetch(api, tokenizer_repo, "tokenizer.json").await?;
        let clip = fetch(api, base_repo, "text_encoder/model.safetensors").await?;

        let (tokenizer_2, clip_2) = if arch.is_xl() {
            (
                Some(fetch(api, CLIP_BIGG_TOKENIZER_REPO, "tokenizer.json").await?),
                Some(fetch(api, base_repo, "text_encoder_2/model.safetensors").await?),
            )
        } else {
            (None, None)
        };

        let unet = match arch {
            Architecture::Lightning => fetch(api, &spec.id, LIGHTNING_UNET).await?,
            _ => fetch(api, base_repo, "unet/diffusion_pytorch_model.safetensors").await?,
        };

        // The stock SDXL VAE overflows in half precision.
        let vae = if arch.is_xl() && dtype == DType::F16 {
            fetch(api, SDXL_FP16_VAE_REPO, "diffusion_pytorch_model.safetensors").await?
        } else {
            fetch(api, base_repo, "vae/diffusion_pytorch_model.safetensors").await?
        };

        Ok(Self {
            tokenizer,
            clip,
            tokenizer_2,
            clip_2,
            unet,
            vae,
        })
    }
}
