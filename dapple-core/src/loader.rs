use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use candle_core::Device;
use image::DynamicImage;

use crate::{AttentionSlicing, DeviceMap, GenerationJob, ModelSpec};

/// A loaded generative model. Runs are blocking and may take minutes.
pub trait Pipeline: Send + Sync {
    fn run(&self, job: &GenerationJob) -> Result<DynamicImage>;

    fn device(&self) -> &Device;
}

/// Builds a [`Pipeline`] for a model spec.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn Pipeline>>;
}

/// Placement and memory options applied when a pipeline is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub device_map: DeviceMap,
    pub attention_slicing: AttentionSlicing,
}
