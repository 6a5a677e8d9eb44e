use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

pub(crate) mod weights;

use weights::{Architecture, ComponentFiles};

use crate::{
    image_to_tensor, init_start_step, preferred_dtype, select_best_device, tensor_to_image, GenerationJob,
    LoadOptions, Loader, ModelSpec, Pipeline,
};

struct TextEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn load(
        config: &clip::Config,
        tokenizer: &Path,
        weights: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("tokenizer has no padding token {pad_token:?}"))?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, dtype)
            .context("failed to load CLIP text encoder")?;

        Ok(Self {
            tokenizer,
            model,
            max_len: config.max_position_embeddings,
            pad_id,
        })
    }

    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)? // Encode the prompt
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);
        let input_ids = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&input_ids)?)
    }
}

pub struct StableDiffusionModel {
    arch: Architecture,
    device: Device,
    dtype: DType,
    sliced_attention_size: Option<usize>,
    text_encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    fn build(
        arch: Architecture,
        files: ComponentFiles,
        device: Device,
        dtype: DType,
        sliced_attention_size: Option<usize>,
    ) -> Result<Self> {
        let sd_config = arch.config(sliced_attention_size, None, None);

        // --- Text encoders, one for SD 1.x/2.x and two for the XL class ---
        let mut text_encoders = vec![TextEncoder::load(
            &sd_config.clip,
            &files.tokenizer,
            &files.clip,
            &device,
            dtype,
        )?];
        if let (Some(config), Some(tokenizer), Some(weights)) =
            (sd_config.clip2.as_ref(), &files.tokenizer_2, &files.clip_2)
        {
            text_encoders.push(TextEncoder::load(config, tokenizer, weights, &device, dtype)?);
        }

        // --- Autoencoder and UNet ---
        let vae = sd_config
            .build_vae(&files.vae, &device, dtype)
            .context("failed to load VAE")?;
        let unet = sd_config
            .build_unet(&files.unet, &device, 4, false, dtype)
            .context("failed to load UNet")?;

        Ok(Self {
            arch,
            device,
            dtype,
            sliced_attention_size,
            text_encoders,
            unet,
            vae,
        })
    }

    /// Hidden states for every text encoder, concatenated along the feature
    /// axis. With guidance the unconditional batch comes first.
    fn text_embeddings(&self, prompt: &str, negative: &str, use_guidance: bool) -> Result<Tensor> {
        let mut embeddings = Vec::with_capacity(self.text_encoders.len());
        for encoder in &self.text_encoders {
            let cond = encoder.encode(prompt, &self.device)?;
            let embedding = if use_guidance {
                let uncond = encoder.encode(negative, &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            embeddings.push(embedding.to_dtype(self.dtype)?);
        }
        Ok(Tensor::cat(&embeddings, D::Minus1)?)
    }
}

impl Pipeline for StableDiffusionModel {
    fn run(&self, job: &GenerationJob) -> Result<DynamicImage> {
        let params = job.params;
        let (width, height) = (params.width, params.height);
        let use_guidance = params.guidance_scale > 1.0;

        // Optionally set seed for reproducibility.
        if let Some(seed) = job.seed {
            // The CPU backend has no seedable generator.
            if let Err(err) = self.device.set_seed(seed) {
                warn!(seed, error = %err, "ignoring seed");
            }
        }

        let sd_config = self
            .arch
            .config(self.sliced_attention_size, Some(height), Some(width));
        let mut scheduler = sd_config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let negative = job.negative_prompt.as_deref().unwrap_or("");
        let text_embeddings = self.text_embeddings(&job.prompt, negative, use_guidance)?;
        let vae_scale = self.arch.vae_scale();

        // --- Starting latents: noised reference image, or pure noise ---
        let (latents, t_start) = match &job.init_image {
            Some(init) => {
                let image = image_to_tensor(&init.image, width, height, &self.device)?
                    .to_dtype(self.dtype)?;
                let latents = (self.vae.encode(&image)?.sample()? * vae_scale)?;
                let t_start = init_start_step(timesteps.len(), init.strength);
                let noise = latents.randn_like(0f64, 1f64)?;
                let latents = scheduler.add_noise(&latents, noise, timesteps[t_start])?;
                (latents, t_start)
            }
            None => {
                let latents =
                    Tensor::randn(0f32, 1f32, (1, 4, height / 8, width / 8), &self.device)?;
                ((latents * scheduler.init_noise_sigma())?, 0)
            }
        };
        let mut latents = latents.to_dtype(self.dtype)?;

        // --- Denoising loop ---
        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising step done");
        }

        // --- Decode and map [-1, 1] to u8 pixels ---
        let decoded = self.vae.decode(&(&latents / vae_scale)?)?;
        let img = ((decoded / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?.i(0)?;

        tensor_to_image(&img)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

pub struct StableDiffusionLoader {
    api: Api,
    options: LoadOptions,
}

impl StableDiffusionLoader {
    pub fn new(api: Api, options: LoadOptions) -> Self {
        Self { api, options }
    }
}

#[async_trait]
impl Loader for StableDiffusionLoader {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn Pipeline>> {
        let arch = Architecture::for_spec(spec)?;

        // Configure device.
        let device = select_best_device(self.options.device_map).context("failed to set up device")?;
        let dtype = preferred_dtype(&device);
        let sliced_attention_size = self.options.attention_slicing.slice_size(&device);

        let files = ComponentFiles::fetch(&self.api, spec, arch, dtype).await?;
        info!(
            model = %spec.id,
            ?arch,
            ?dtype,
            ?sliced_attention_size,
            "weights available, building pipeline"
        );

        // Weight loading is blocking work.
        let model = tokio::task::spawn_blocking(move || {
            StableDiffusionModel::build(arch, files, device, dtype, sliced_attention_size)
        })
        .await
        .context("pipeline construction task failed")??;

        Ok(Arc::new(model))
    }
}
