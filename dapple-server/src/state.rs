use std::sync::Arc;

use crate::executor::Executor;
use crate::manager::ModelManager;

/// Shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ModelManager>,
    pub executor: Arc<Executor>,
}
