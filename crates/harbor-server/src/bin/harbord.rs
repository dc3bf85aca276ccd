#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! The archive server daemon.

use clap::Parser;
use std::path::PathBuf;

use harbor_types::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "harbord", about = "Harbor archive server", version)]
struct Opts {
    /// TOML configuration file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory of the archive store.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Client protocol listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Diagnostics listen address.
    #[arg(long)]
    diagnostics: Option<String>,
}

fn build_config(opts: &Opts) -> anyhow::Result<ServerConfig> {
    let mut config = match (&opts.config, &opts.root) {
        (Some(path), _) => ServerConfig::load(path)?,
        (None, Some(root)) => ServerConfig::for_root(root),
        (None, None) => anyhow::bail!("either --config or --root is required"),
    };
    if let Some(root) = &opts.root {
        config.root.clone_from(root);
    }
    if let Some(listen) = &opts.listen {
        config.listen_addr.clone_from(listen);
    }
    if let Some(diagnostics) = &opts.diagnostics {
        config.diagnostics_addr.clone_from(diagnostics);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    harbor_server::telemetry::init_tracing()?;
    let opts = Opts::parse();
    let config = build_config(&opts)?;
    harbor_server::run(&config).await
}
