//! Runs generations on the blocking pool behind a bounded, FIFO worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dapple_core::codec::{decode_reference, encode_output};
use dapple_core::{GenerationJob, GenerationRequest};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{ServeError, Stage};
use crate::manager::ModelManager;

pub struct Executor {
    slots: Arc<Semaphore>,
    deadline: Duration,
}

impl Executor {
    pub fn new(workers: usize, deadline: Duration) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers.max(1))),
            deadline,
        }
    }

    /// Runs `work` on the blocking pool once a slot frees up.
    ///
    /// The deadline covers the wait for a slot and the run itself. When it
    /// passes the caller gets [`ServeError::Timeout`] right away, but the
    /// work keeps its slot until it actually returns.
    pub async fn run<F, T>(&self, work: F) -> Result<T, ServeError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slots = self.slots.clone();
        let task = async move {
            let permit = slots
                .acquire_owned()
                .await
                .map_err(|_| ServeError::Generation("worker pool is closed".into()))?;

            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                work()
            })
            .await
            .map_err(|err| ServeError::Generation(format!("worker task failed: {err}")))?
            .map_err(|err| ServeError::Generation(format!("{err:#}")))
        };

        match timeout(self.deadline, task).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_secs = self.deadline.as_secs(),
                    "generation deadline passed, result will be discarded"
                );
                Err(ServeError::Timeout {
                    stage: Stage::Generate,
                    after: self.deadline,
                })
            }
        }
    }
}

/// Serves one `/generate` call and returns the output image as a data URL.
pub async fn generate(
    manager: &ModelManager,
    executor: &Executor,
    request: GenerationRequest,
) -> Result<String, ServeError> {
    if request.prompt.trim().is_empty() {
        return Err(ServeError::InvalidRequest("prompt must not be empty".into()));
    }

    let reference = match request.reference_image.clone() {
        Some(data) => Some(
            tokio::task::spawn_blocking(move || decode_reference(&data))
                .await
                .map_err(|err| ServeError::Generation(format!("decode task failed: {err}")))??,
        ),
        None => None,
    };

    let loaded = manager.ensure_loaded().await?;

    let mut job = GenerationJob::new(&request, loaded.spec.family);
    if let Some(image) = reference {
        job = job.with_init_image(image, request.strength);
    }
    info!(
        model = %loaded.spec.id,
        steps = job.params.steps,
        guidance_scale = job.params.guidance_scale,
        width = job.params.width,
        height = job.params.height,
        image_to_image = job.init_image.is_some(),
        "generating"
    );

    let started = Instant::now();
    let pipeline = loaded.pipeline.clone();
    let image_url = executor
        .run(move || {
            let image = pipeline.run(&job)?;
            Ok(encode_output(&image)?)
        })
        .await?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "generation finished");

    Ok(image_url)
}
