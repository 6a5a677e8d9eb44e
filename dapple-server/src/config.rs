//! Server configuration. Every option is read from the environment and may
//! also be given as a command line flag.

use std::time::Duration;

use clap::Parser;
use dapple_core::{AttentionSlicing, DeviceMap, LoadOptions, ModelFamily, ModelSpec};

pub const DEFAULT_MODEL_ID: &str = "ByteDance/SDXL-Lightning";
pub const DEFAULT_FALLBACK_MODEL_ID: &str = "stabilityai/sdxl-turbo";
/// Room for a base64 reference image of a few megapixels.
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Stable Diffusion image generation server")]
pub struct Args {
    /// Hugging Face model identifier to serve
    #[arg(long, env = "SD_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model: String,

    /// Model tried once when the primary model fails to load
    #[arg(long, env = "SD_FALLBACK_MODEL_ID", default_value = DEFAULT_FALLBACK_MODEL_ID)]
    pub fallback_model: String,

    /// Model family of the primary model; detected from its identifier when unset
    #[arg(long, env = "SD_MODEL_FAMILY")]
    pub family: Option<ModelFamily>,

    /// Access token for gated models
    #[arg(long, env = "HUGGINGFACE_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 7861)]
    pub port: u16,

    /// Use CPU instead of GPU
    #[arg(long, env = "SD_FORCE_CPU")]
    pub cpu: bool,

    /// Attention slicing: auto, on or off
    #[arg(long, env = "SD_ATTENTION_SLICING", default_value_t = AttentionSlicing::Auto)]
    pub attention_slicing: AttentionSlicing,

    /// Deadline for each model load attempt, in seconds
    #[arg(long, env = "SD_LOAD_TIMEOUT_SECS", default_value_t = 1200)]
    pub load_timeout_secs: u64,

    /// Deadline for a single generation, in seconds
    #[arg(long, env = "SD_GENERATE_TIMEOUT_SECS", default_value_t = 900)]
    pub generate_timeout_secs: u64,

    /// Number of generations allowed to run at the same time
    #[arg(long, env = "SD_WORKERS", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Largest accepted request body, in bytes
    #[arg(long, env = "SD_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Load the model at startup instead of on the first request
    #[arg(long, env = "SD_PRELOAD")]
    pub preload: bool,

    /// `tracing` filter, used when RUST_LOG is unset
    #[arg(long, env = "SD_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit log records as newline-delimited JSON
    #[arg(long, env = "SD_LOG_JSON")]
    pub log_json: bool,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct Config {
    pub primary: ModelSpec,
    pub fallback: ModelSpec,
    pub hf_token: Option<String>,
    pub bind_address: String,
    pub load_options: LoadOptions,
    pub load_timeout: Duration,
    pub generate_timeout: Duration,
    pub workers: usize,
    pub max_body_bytes: usize,
    pub preload: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let device_map = if args.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::default()
        };

        Self {
            primary: ModelSpec::new(args.model, args.family),
            fallback: ModelSpec::new(args.fallback_model, None),
            hf_token: args.hf_token.filter(|t| !t.trim().is_empty()),
            bind_address: format!("{}:{}", args.host, args.port),
            load_options: LoadOptions {
                device_map,
                attention_slicing: args.attention_slicing,
            },
            load_timeout: Duration::from_secs(args.load_timeout_secs),
            generate_timeout: Duration::from_secs(args.generate_timeout_secs),
            workers: usize::from(args.workers),
            max_body_bytes: args.max_body_bytes,
            preload: args.preload,
        }
    }
}
