//! dapple-server: Stable Diffusion behind a small HTTP API.
//!
//! Nothing is loaded at startup unless `SD_PRELOAD` is set; the first
//! `/generate` request pulls the weights from the hub.

mod config;
mod error;
mod executor;
mod manager;
mod routes;
mod state;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use clap::Parser;
use dapple_core::{expected_device_label, HubLoader};
use hf_hub::api::tokio::ApiBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, Config};
use crate::executor::Executor;
use crate::manager::ModelManager;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "dapple-server starting");

    let config = Config::from(args);

    let mut api = ApiBuilder::new();
    if let Some(token) = config.hf_token.clone() {
        api = api.with_token(Some(token));
    }
    let api = api.build()?;

    // Opening a device here would hold a second GPU context for the whole run.
    let device = expected_device_label(config.load_options.device_map);
    info!(
        model = %config.primary.id,
        family = %config.primary.family,
        fallback = %config.fallback.id,
        device,
        workers = config.workers,
        max_body_bytes = config.max_body_bytes,
        "model configuration resolved"
    );

    let manager = Arc::new(ModelManager::new(
        Arc::new(HubLoader::new(api, config.load_options)),
        config.primary.clone(),
        config.fallback.clone(),
        config.load_timeout,
        device,
    ));
    let state = Arc::new(AppState {
        manager: Arc::clone(&manager),
        executor: Arc::new(Executor::new(config.workers, config.generate_timeout)),
    });

    if config.preload {
        tokio::spawn(async move {
            if let Err(e) = manager.ensure_loaded().await {
                warn!(error = %e, "preload failed, the first request will retry");
            }
        });
    }

    let app = routes::build(state, config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("dapple-server stopped");
    Ok(())
}

/// `RUST_LOG` wins over `SD_LOG`; an unparsable filter falls back to `info`.
fn init_tracing(log_level: &str, json: bool) {
    let (filter, rejected) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, None),
        Err(_) => match EnvFilter::try_new(log_level) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new("info"), Some(e)),
        },
    };

    let fmt = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }

    if let Some(e) = rejected {
        warn!(filter = log_level, error = %e, "ignoring invalid SD_LOG filter");
    }
}

/// Completes on Ctrl-C, or on SIGTERM where there is one.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!("shutting down once in-flight requests finish");
}
