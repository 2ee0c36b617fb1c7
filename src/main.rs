use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sumo_session::config::Config;

const DEFAULT_LOG_FILTER: &str = "sumo_session=info,tower_http=warn";

#[derive(Parser, Debug)]
#[command(name = "sumo-session")]
#[command(version, about = "WhatsApp session-string relay server")]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Allowed browser origin (overrides FRONTEND_URL)
    #[arg(long)]
    frontend_url: Option<String>,

    /// Credential directory root (overrides SESSIONS_DIR)
    #[arg(long)]
    sessions_dir: Option<PathBuf>,

    /// Protocol bridge WebSocket URL (overrides PROTOCOL_BRIDGE_URL)
    #[arg(long)]
    bridge_url: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = self.frontend_url {
            config.frontend_url = url;
        }
        if let Some(dir) = self.sessions_dir {
            config.sessions_dir = dir;
        }
        if let Some(url) = self.bridge_url {
            config.protocol.bridge_url = url;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    sumo_session::gateway::run_gateway(config).await
}
