//! Configuration loading: TOML file, then `RELAY_*` environment variables,
//! then command-line flags.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::Parser;

use relay_ipc::RelayConfig;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Live audio relay.
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: relay.toml in the working directory, if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// ffmpeg binary
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,

    /// Log filter directive, used when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,

    /// Session to start at boot
    #[arg(long)]
    pub auto_start: Option<String>,
}

impl Cli {
    /// Overlay the flags that were given.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.transcoder.ffmpeg_path = ffmpeg.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = Some(level.clone());
        }
        if let Some(id) = &self.auto_start {
            config.session.auto_start = Some(id.clone());
        }
    }
}

/// Where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded.
    pub files: Vec<PathBuf>,

    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,

    /// Environment variables whose value could not be parsed.
    pub ignored: Vec<String>,
}

/// Build the effective configuration.
pub fn load_config(cli: &Cli) -> Result<(RelayConfig, ConfigSources)> {
    let mut sources = ConfigSources::default();

    let mut config = match config_file(cli.config.as_deref())? {
        Some(path) => {
            let config = load_from_file(&path)?;
            sources.files.push(path);
            config
        }
        None => RelayConfig::default(),
    };

    apply_env_overrides(&mut config, &mut sources, |key| env::var(key).ok());
    cli.apply(&mut config);

    Ok((config, sources))
}

fn config_file(cli_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = cli_path {
        if !path.exists() {
            bail!("Config file {} not found", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(local.exists().then_some(local))
}

/// Load config from a TOML file. Missing keys take their defaults.
pub fn load_from_file(path: &Path) -> Result<RelayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Apply `RELAY_*` overrides found through `lookup`.
pub fn apply_env_overrides(
    config: &mut RelayConfig,
    sources: &mut ConfigSources,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let mut env = EnvOverlay { lookup, sources };

    env.set("RELAY_HOST", &mut config.server.host);
    env.set("RELAY_PORT", &mut config.server.port);

    env.set("RELAY_HLS_DIR", &mut config.paths.hls_dir);
    env.set("RELAY_ARCHIVE_DIR", &mut config.paths.archive_dir);
    env.set("RELAY_OBJECT_ROOT", &mut config.paths.object_root);
    env.set("RELAY_METADATA_FILE", &mut config.paths.metadata_file);

    env.set("RELAY_FFMPEG", &mut config.transcoder.ffmpeg_path);
    env.set("RELAY_DRAIN_TIMEOUT_SECS", &mut config.transcoder.drain_timeout_secs);

    env.set("RELAY_WARMUP_SECS", &mut config.timing.warmup_secs);
    env.set("RELAY_GRACE_SECS", &mut config.timing.grace_secs);
    env.set("RELAY_FINALIZE_WAIT_SECS", &mut config.timing.finalize_wait_secs);

    env.set("RELAY_PUBLIC_BASE_URL", &mut config.storage.public_base_url);
    env.set("RELAY_COLLECTION", &mut config.storage.collection);

    env.set_optional("RELAY_AUTO_START", &mut config.session.auto_start);
    env.set_optional("RELAY_LOG_LEVEL", &mut config.log_level);
}

struct EnvOverlay<'a, F> {
    lookup: F,
    sources: &'a mut ConfigSources,
}

impl<F: Fn(&str) -> Option<String>> EnvOverlay<'_, F> {
    fn set<T: FromStr>(&mut self, key: &str, target: &mut T) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.parse() {
            Ok(value) => {
                *target = value;
                self.sources.env_overrides.push(key.to_string());
            }
            Err(_) => self.sources.ignored.push(key.to_string()),
        }
    }

    fn set_optional(&mut self, key: &str, target: &mut Option<String>) {
        if let Some(raw) = (self.lookup)(key) {
            *target = Some(raw).filter(|v| !v.trim().is_empty());
            self.sources.env_overrides.push(key.to_string());
        }
    }
}
