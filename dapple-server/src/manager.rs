//! Owns the process-wide pipeline.
//!
//! The pipeline is created on first use and never replaced. A load runs as a
//! detached task that every waiting request shares, so a request that goes
//! away does not cancel it. A failed load clears the in-flight task and the
//! next request starts over.

use std::sync::Arc;
use std::time::Duration;

use dapple_core::{device_label, Loader, ModelSpec, Pipeline};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{ServeError, Stage};

/// A pipeline together with the model it was built from.
pub struct LoadedPipeline {
    pub spec: ModelSpec,
    pub pipeline: Arc<dyn Pipeline>,
}

/// Result of one load attempt.
pub enum LoadOutcome {
    Loaded(Arc<dyn Pipeline>),
    TimedOut,
    Failed(anyhow::Error),
}

/// Why no pipeline could be loaded. Cloned out to every waiting request.
#[derive(Debug, Clone)]
pub enum LoadError {
    Failed(String),
    TimedOut(Duration),
}

impl From<LoadError> for ServeError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Failed(msg) => ServeError::Load(msg),
            LoadError::TimedOut(after) => ServeError::Timeout {
                stage: Stage::Load,
                after,
            },
        }
    }
}

type LoadTask = Shared<BoxFuture<'static, Result<Arc<LoadedPipeline>, LoadError>>>;

/// State the detached load task needs.
struct Slot {
    loader: Arc<dyn Loader>,
    primary: ModelSpec,
    fallback: ModelSpec,
    load_timeout: Duration,
    handle: OnceCell<Arc<LoadedPipeline>>,
    inflight: Mutex<Option<LoadTask>>,
}

pub struct ModelManager {
    slot: Arc<Slot>,
    /// Reported before anything is loaded.
    startup_device: String,
}

impl ModelManager {
    pub fn new(
        loader: Arc<dyn Loader>,
        primary: ModelSpec,
        fallback: ModelSpec,
        load_timeout: Duration,
        startup_device: impl Into<String>,
    ) -> Self {
        Self {
            slot: Arc::new(Slot {
                loader,
                primary,
                fallback,
                load_timeout,
                handle: OnceCell::new(),
                inflight: Mutex::new(None),
            }),
            startup_device: startup_device.into(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.handle.initialized()
    }

    pub fn loaded(&self) -> Option<Arc<LoadedPipeline>> {
        self.slot.handle.get().cloned()
    }

    pub fn device(&self) -> String {
        match self.slot.handle.get() {
            Some(loaded) => device_label(loaded.pipeline.device()).to_string(),
            None => self.startup_device.clone(),
        }
    }

    /// Returns the loaded pipeline, loading it first if needed. Dropping the
    /// returned future does not cancel a load in progress.
    pub async fn ensure_loaded(&self) -> Result<Arc<LoadedPipeline>, ServeError> {
        if let Some(loaded) = self.slot.handle.get() {
            return Ok(loaded.clone());
        }

        let task = {
            let mut inflight = self.slot.inflight.lock().await;
            if let Some(loaded) = self.slot.handle.get() {
                return Ok(loaded.clone());
            }
            match inflight.as_ref() {
                Some(task) => task.clone(),
                None => {
                    let task = Slot::spawn_load(Arc::clone(&self.slot));
                    *inflight = Some(task.clone());
                    task
                }
            }
        };

        Ok(task.await?)
    }
}

impl Slot {
    fn spawn_load(slot: Arc<Slot>) -> LoadTask {
        let join = tokio::spawn(async move {
            let result = slot.load_with_fallback().await;
            if let Ok(loaded) = &result {
                // Only this task ever sets the cell.
                let _ = slot.handle.set(loaded.clone());
            }
            *slot.inflight.lock().await = None;
            result
        });

        async move {
            match join.await {
                Ok(result) => result,
                Err(err) => Err(LoadError::Failed(format!("load task failed: {err}"))),
            }
        }
        .boxed()
        .shared()
    }

    /// Runs one load with the deadline. A build that misses it is still
    /// awaited, so the next attempt never overlaps it and its memory is
    /// released before anything else is loaded.
    async fn attempt(&self, spec: &ModelSpec) -> LoadOutcome {
        let loader = Arc::clone(&self.loader);
        let owned = spec.clone();
        let mut build = tokio::spawn(async move { loader.load(&owned).await });

        match timeout(self.load_timeout, &mut build).await {
            Ok(Ok(Ok(pipeline))) => LoadOutcome::Loaded(pipeline),
            Ok(Ok(Err(err))) => LoadOutcome::Failed(err),
            Ok(Err(join)) => LoadOutcome::Failed(anyhow::anyhow!("load task failed: {join}")),
            Err(_) => {
                warn!(
                    model = %spec.id,
                    timeout_secs = self.load_timeout.as_secs(),
                    "model load timed out, waiting for the build to wind down"
                );
                // A late pipeline is dropped here.
                let _ = build.await;
                LoadOutcome::TimedOut
            }
        }
    }

    /// Primary first, then the fallback exactly once if it names another model.
    async fn load_with_fallback(&self) -> Result<Arc<LoadedPipeline>, LoadError> {
        let mut candidates = vec![&self.primary];
        if self.fallback.id != self.primary.id {
            candidates.push(&self.fallback);
        }

        let mut failures = Vec::with_capacity(candidates.len());
        let mut all_timed_out = true;
        for spec in candidates {
            match self.attempt(spec).await {
                LoadOutcome::Loaded(pipeline) => {
                    info!(
                        model = %spec.id,
                        family = %spec.family,
                        device = device_label(pipeline.device()),
                        "model loaded"
                    );
                    return Ok(Arc::new(LoadedPipeline {
                        spec: spec.clone(),
                        pipeline,
                    }));
                }
                LoadOutcome::TimedOut => {
                    failures.push(format!("{}: timed out after {}s", spec.id, self.load_timeout.as_secs()));
                }
                LoadOutcome::Failed(err) => {
                    warn!(model = %spec.id, error = %format!("{err:#}"), "model load failed");
                    all_timed_out = false;
                    failures.push(format!("{}: {err:#}", spec.id));
                }
            }
        }

        if all_timed_out {
            Err(LoadError::TimedOut(self.load_timeout))
        } else {
            Err(LoadError::Failed(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLoader;
    use dapple_core::ModelFamily;

    fn manager(loader: Arc<ScriptedLoader>, primary: &str, fallback: &str) -> ModelManager {
        ModelManager::new(
            loader,
            ModelSpec::new(primary, None),
            ModelSpec::new(fallback, None),
            Duration::from_millis(200),
            "cpu",
        )
    }

    #[tokio::test]
    async fn loads_primary_once_and_reuses_it() {
        let loader = Arc::new(ScriptedLoader::new());
        let manager = manager(loader.clone(), "stabilityai/sdxl-turbo", "runwayml/stable-diffusion-v1-5");
        assert!(!manager.is_loaded());

        let first = manager.ensure_loaded().await.unwrap();
        let second = manager.ensure_loaded().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.spec.family, ModelFamily::Turbo);
        assert_eq!(loader.calls(), vec!["stabilityai/sdxl-turbo"]);
        assert!(manager.is_loaded());
    }

    #[tokio::test]
    async fn falls_back_exactly_once() {
        let loader = Arc::new(ScriptedLoader::new().failing("broken/primary"));
        let manager = manager(loader.clone(), "broken/primary", "stabilityai/sdxl-turbo");

        let loaded = manager.ensure_loaded().await.unwrap();
        assert_eq!(loaded.spec.id, "stabilityai/sdxl-turbo");
        assert_eq!(loader.calls(), vec!["broken/primary", "stabilityai/sdxl-turbo"]);
        assert!(manager.is_loaded());
    }

    #[tokio::test]
    async fn both_failing_leaves_nothing_loaded() {
        let loader = Arc::new(ScriptedLoader::new().failing("a/one").failing("b/two"));
        let manager = manager(loader.clone(), "a/one", "b/two");

        let err = manager.ensure_loaded().await.err().unwrap();
        assert!(matches!(err, ServeError::Load(ref msg) if msg.contains("a/one") && msg.contains("b/two")));
        assert_eq!(loader.calls().len(), 2);
        assert!(!manager.is_loaded());
        assert!(manager.loaded().is_none());
    }

    #[tokio::test]
    async fn identical_fallback_is_not_retried() {
        let loader = Arc::new(ScriptedLoader::new().failing("a/one"));
        let manager = manager(loader.clone(), "a/one", "a/one");

        assert!(matches!(manager.ensure_loaded().await, Err(ServeError::Load(_))));
        assert_eq!(loader.calls(), vec!["a/one"]);
    }

    #[tokio::test]
    async fn slow_loads_surface_as_timeouts() {
        let loader = Arc::new(ScriptedLoader::new().with_delay(Duration::from_millis(400)));
        let manager = manager(loader.clone(), "slow/one", "slow/two");

        let err = manager.ensure_loaded().await.err().unwrap();
        assert!(matches!(err, ServeError::Timeout { stage: Stage::Load, .. }));
        assert_eq!(loader.calls().len(), 2);
        assert!(!manager.is_loaded());
    }

    #[tokio::test]
    async fn fallback_waits_for_a_timed_out_build() {
        let loader = Arc::new(ScriptedLoader::new().with_delay(Duration::from_millis(400)));
        let manager = manager(loader.clone(), "slow/one", "slow/two");

        assert!(manager.ensure_loaded().await.is_err());
        assert_eq!(loader.calls(), vec!["slow/one", "slow/two"]);
        assert_eq!(loader.max_concurrent_loads(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_requests_share_one_load() {
        let loader = Arc::new(ScriptedLoader::new().with_delay(Duration::from_millis(50)));
        let manager = Arc::new(manager(loader.clone(), "stabilityai/sdxl-turbo", "b/two"));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_loaded().await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(loader.calls().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_first_request_does_not_restart_the_load() {
        let loader = Arc::new(ScriptedLoader::new().with_delay(Duration::from_millis(200)));
        let manager = Arc::new(manager(loader.clone(), "stabilityai/sdxl-turbo", "b/two"));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_loaded().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let loaded = manager.ensure_loaded().await.unwrap();
        assert_eq!(loaded.spec.id, "stabilityai/sdxl-turbo");
        assert_eq!(loader.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_load_can_be_retried_later() {
        let loader = Arc::new(ScriptedLoader::new().failing_times("flaky/one", 1));
        let manager = manager(loader.clone(), "flaky/one", "flaky/one");

        assert!(manager.ensure_loaded().await.is_err());
        assert!(manager.ensure_loaded().await.is_ok());
        assert_eq!(loader.calls().len(), 2);
    }
}
