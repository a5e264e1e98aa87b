//! Gateway binary entrypoint: load settings, build the collaborator graph
//! (`grok_gateway::bootstrap`), spawn the background cooling-token refresh
//! sweep, and serve the HTTP router until Ctrl+C/SIGTERM.

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use grok_gateway::{bootstrap, load_gateway_settings, run_http, set_config_home_override};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(conf_dir) = cli.conf.clone() {
        set_config_home_override(conf_dir);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("grok_gateway={}", cli.log_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let settings = load_gateway_settings();
    let state = bootstrap(settings).await?;
    grok_gateway::spawn_background_refresh(state.clone());

    run_http(state, &cli.bind).await
}
