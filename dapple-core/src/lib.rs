pub mod codec;
pub mod device_map;
pub mod loader;
mod loader_factory;
pub mod policy;
mod util;

mod sd3;
mod stable_diffusion;

pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use policy::{resolve, EffectiveParams, RequestedParams};
use serde::{Deserialize, Serialize};
pub use sd3::Sd3Loader;
pub use stable_diffusion::StableDiffusionLoader;
pub use util::{device_label, expected_device_label, select_best_device};
pub(crate) use util::*;

pub const DEFAULT_STEPS: u32 = 28;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.0;
pub const DEFAULT_SIZE: u32 = 1024;
pub const DEFAULT_STRENGTH: f64 = 0.75;

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Base64 payload or `data:` URL of an image to start from.
    #[serde(default, alias = "referenceImage")]
    pub reference_image: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_steps", alias = "num_inference_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_size")]
    pub width: u32,
    #[serde(default = "default_size")]
    pub height: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    /// How far an image-to-image run may drift from the reference, in `[0, 1]`.
    #[serde(default)]
    pub strength: Option<f64>,
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_guidance_scale() -> f64 {
    DEFAULT_GUIDANCE_SCALE
}

fn default_size() -> u32 {
    DEFAULT_SIZE
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_image: None,
            negative_prompt: None,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
            seed: None,
            strength: None,
        }
    }

    pub fn requested_params(&self) -> RequestedParams {
        RequestedParams {
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            width: self.width,
            height: self.height,
        }
    }
}

/// Starting image for an image-to-image run.
#[derive(Debug, Clone)]
pub struct InitImage {
    pub image: DynamicImage,
    pub strength: f64,
}

/// A fully resolved unit of work handed to a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: EffectiveParams,
    pub seed: Option<u64>,
    pub init_image: Option<InitImage>,
}

impl GenerationJob {
    pub fn new(request: &GenerationRequest, family: ModelFamily) -> Self {
        Self {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            params: resolve(family, &request.requested_params()),
            seed: request.seed,
            init_image: None,
        }
    }

    pub fn with_init_image(mut self, image: DynamicImage, strength: Option<f64>) -> Self {
        let strength = strength
            .filter(|s| s.is_finite())
            .unwrap_or(DEFAULT_STRENGTH)
            .clamp(0.0, 1.0);
        self.init_image = Some(InitImage { image, strength });
        self
    }
}
