//! Gateway binary CLI: bind address, config paths, log level.
//!
//! Grounded on the teacher's `src/cli.rs` (`clap` derive, `--conf` override
//! for the config directory, default bind address) narrowed to the single
//! `serve` shape this gateway needs — there is no stdio/repl/channel mode
//! here, only an HTTP server.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "grok-gateway")]
#[command(about = "OpenAI-compatible reverse-proxy gateway over a pooled upstream credential set")]
pub(crate) struct Cli {
    /// Listen address (e.g. 0.0.0.0:8080).
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub(crate) bind: String,

    /// Override the directory system/user settings YAML files are read from.
    #[arg(long)]
    pub(crate) conf: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Overridden by `RUST_LOG` when set.
    #[arg(long, default_value = "info")]
    pub(crate) log_level: String,
}
