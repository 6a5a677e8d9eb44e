use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{LoadOptions, Loader, Pipeline, Sd3Loader, StableDiffusionLoader};

/// Model families, each with its own pipeline layout and parameter policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    /// SD 1.x / 2.x.
    Standard,
    /// Adversarially distilled SDXL, 1 to 4 steps without guidance.
    Turbo,
    /// Progressively distilled SDXL, few steps with minimal guidance.
    Lightning,
    /// SDXL base and derivatives.
    Xl,
    /// SD 3.x.
    NextGen,
}

serde_plain::derive_display_from_serialize!(ModelFamily);
serde_plain::derive_fromstr_from_deserialize!(ModelFamily);

impl ModelFamily {
    /// Detect the model family from a hub identifier
    pub fn detect(model_id: &str) -> Self {
        let name = model_id.to_lowercase();

        // SD3.5 Large Turbo is an MMDiT model, so next-gen wins over turbo.
        if name.contains("stable-diffusion-3") || name.contains("sd3") {
            ModelFamily::NextGen
        } else if name.contains("turbo") {
            ModelFamily::Turbo
        } else if name.contains("lightning") {
            ModelFamily::Lightning
        } else if name.contains("sdxl") || name.contains("diffusion-xl") {
            ModelFamily::Xl
        } else {
            ModelFamily::Standard
        }
    }

    pub fn is_distilled(self) -> bool {
        matches!(self, ModelFamily::Turbo | ModelFamily::Lightning)
    }
}

/// A hub identifier together with the family it was resolved to at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub family: ModelFamily,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, family: Option<ModelFamily>) -> Self {
        let id = id.into();
        let family = family.unwrap_or_else(|| ModelFamily::detect(&id));
        Self { id, family }
    }
}

/// Loads models from the Hugging Face hub, dispatching on the model family.
pub struct HubLoader {
    stable_diffusion: StableDiffusionLoader,
    sd3: Sd3Loader,
}

impl HubLoader {
    pub fn new(api: Api, options: LoadOptions) -> Self {
        Self {
            stable_diffusion: StableDiffusionLoader::new(api.clone(), options),
            sd3: Sd3Loader::new(api, options),
        }
    }
}

#[async_trait]
impl Loader for HubLoader {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn Pipeline>> {
        info!(model = %spec.id, family = %spec.family, "loading model");

        match spec.family {
            ModelFamily::Standard
            | ModelFamily::Turbo
            | ModelFamily::Lightning
            | ModelFamily::Xl => self.stable_diffusion.load(spec).await,
            ModelFamily::NextGen => self.sd3.load(spec).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_families_from_known_ids() {
        let cases = [
            ("ByteDance/SDXL-Lightning", ModelFamily::Lightning),
            ("stabilityai/sdxl-turbo", ModelFamily::Turbo),
            ("stabilityai/stable-diffusion-xl-base-1.0", ModelFamily::Xl),
            ("stabilityai/stable-diffusion-3-medium-diffusers", ModelFamily::NextGen),
            ("stabilityai/stable-diffusion-3.5-medium", ModelFamily::NextGen),
            ("stabilityai/stable-diffusion-3.5-large-turbo", ModelFamily::NextGen),
            ("runwayml/stable-diffusion-v1-5", ModelFamily::Standard),
            ("someone/unheard-of-model", ModelFamily::Standard),
        ];
        for (id, family) in cases {
            assert_eq!(ModelFamily::detect(id), family, "{id}");
        }
    }

    #[test]
    fn override_beats_detection() {
        let spec = ModelSpec::new("my-org/custom-finetune", Some(ModelFamily::Xl));
        assert_eq!(spec.family, ModelFamily::Xl);
        let spec = ModelSpec::new("my-org/custom-finetune", None);
        assert_eq!(spec.family, ModelFamily::Standard);
    }

    #[test]
    fn family_names_round_trip_through_strings() {
        assert_eq!(ModelFamily::NextGen.to_string(), "next-gen");
        assert_eq!("lightning".parse::<ModelFamily>().unwrap(), ModelFamily::Lightning);
        assert!("dall-e".parse::<ModelFamily>().is_err());
    }
}
