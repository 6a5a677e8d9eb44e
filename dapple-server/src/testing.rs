//! Loader and pipeline doubles that never touch the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use candle_core::Device;
use dapple_core::{GenerationJob, Loader, ModelSpec, Pipeline};
use image::{DynamicImage, Rgb, RgbImage};

/// Paints a flat image of the requested size, optionally after a delay.
pub struct FakePipeline {
    device: Device,
    delay: Duration,
    fail: bool,
    jobs: Mutex<Vec<GenerationJob>>,
}

impl FakePipeline {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
            delay: Duration::ZERO,
            fail: false,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn jobs(&self) -> Vec<GenerationJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Pipeline for FakePipeline {
    fn run(&self, job: &GenerationJob) -> Result<DynamicImage> {
        self.jobs.lock().unwrap().push(job.clone());
        std::thread::sleep(self.delay);
        if self.fail {
            bail!("out of memory");
        }
        let params = job.params;
        let pixel = if job.init_image.is_some() {
            Rgb([0, 0, 255])
        } else {
            Rgb([255, 0, 0])
        };
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            params.width as u32,
            params.height as u32,
            pixel,
        )))
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Records every load and fails the ids it was told to.
pub struct ScriptedLoader {
    pipeline: Arc<FakePipeline>,
    delay: Duration,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::with_pipeline(FakePipeline::new())
    }

    pub fn with_pipeline(pipeline: FakePipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            delay: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn failing(self, id: &str) -> Self {
        self.failing_times(id, usize::MAX)
    }

    pub fn failing_times(self, id: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(id.to_string(), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Most loads that were ever in progress at the same time.
    pub fn max_concurrent_loads(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn pipeline(&self) -> Arc<FakePipeline> {
        self.pipeline.clone()
    }
}

#[async_trait]
impl Loader for ScriptedLoader {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn Pipeline>> {
        self.calls.lock().unwrap().push(spec.id.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let should_fail = match self.failures.lock().unwrap().get_mut(&spec.id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if should_fail {
            bail!("weights for {} are corrupt", spec.id);
        }
        Ok(self.pipeline.clone())
    }
}
