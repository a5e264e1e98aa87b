//! Reverse-proxy gateway in front of a pooled upstream AI provider: an
//! OpenAI-compatible REST surface multiplexed across a pool of session-token
//! credentials (Token Pool Manager, Upstream Streaming Pipeline, Retry &
//! Backoff Engine, Batch Controller — spec.md §1).

#![allow(missing_docs)]

pub mod app;
pub mod asset_cache;
pub mod batch;
pub mod config;
pub mod entrypoints;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod models;
pub mod openai;
pub mod retry;
pub mod statsig;
pub mod stream;
pub mod token_pool;
pub mod upstream;

pub use app::{bootstrap, spawn_background_refresh, AppState, AppStateInner};
pub use config::{
    load_gateway_settings, load_gateway_settings_from_paths, set_config_home_override,
    GatewaySettings,
};
pub use error::AppError;
pub use gateway::{router, run_http};
