//! Live audio relay server.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use relay_lib::config::{load_config, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = load_config(&cli)?;

    relay_lib::init_logging(config.log_level.as_deref());

    for file in &sources.files {
        info!("Loaded config from {}", file.display());
    }
    if !sources.env_overrides.is_empty() {
        info!(vars = ?sources.env_overrides, "Environment overrides applied");
    }
    if !sources.ignored.is_empty() {
        warn!(vars = ?sources.ignored, "Ignored unparsable environment overrides");
    }

    relay_lib::run(config).await
}
