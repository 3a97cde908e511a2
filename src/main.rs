use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use nodeatlas::{
    config::Config, mail::LogMailer, metrics::init_metrics, server::run_with_config_until_ctrl_c,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Cli::parse();

    let config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await?
    } else {
        debug!("using default config");
        Config::default()
    };

    init_metrics();
    run_with_config_until_ctrl_c(config, Arc::new(LogMailer)).await
}
