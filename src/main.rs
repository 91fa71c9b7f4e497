//! Millennium daemon entrypoint.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use millennium::app::{self, MillenniumOptions};
use millennium::config::{default_plugins_dir, default_settings_path};
use millennium::transport::DEFAULT_DEBUGGER_PORT;

#[derive(Parser, Debug)]
#[command(name = "millennium", version, about = "Steam client customization layer")]
struct Cli {
    /// Port of Steam's remote debugger.
    #[arg(long, default_value_t = DEFAULT_DEBUGGER_PORT, env = "MILLENNIUM_DEVTOOLS_PORT")]
    devtools_port: u16,

    /// Settings file; defaults to the per-user config directory.
    #[arg(long, env = "MILLENNIUM_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Plugins root; defaults to the per-user data directory.
    #[arg(long, env = "MILLENNIUM_PLUGINS_DIR")]
    plugins: Option<PathBuf>,

    /// IPC listener port; 0 picks an ephemeral one.
    #[arg(long, default_value_t = 0, env = "MILLENNIUM_IPC_PORT")]
    ipc_port: u16,

    /// Log filter, e.g. `millennium=debug`.
    #[arg(long, default_value = "info", env = "MILLENNIUM_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = MillenniumOptions {
        devtools_port: cli.devtools_port,
        config_path: cli.config.unwrap_or_else(default_settings_path),
        plugins_dir: cli.plugins.unwrap_or_else(default_plugins_dir),
        ipc_port: cli.ipc_port,
    };

    app::run(options).await?;
    Ok(())
}
