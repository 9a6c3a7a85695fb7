//! CLI configuration: `clap` flags, each env-backed, optionally overlaid
//! on a JSON config file.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Simulator export-stream host.
    #[clap(long, env = "HUB_SIM_HOST", default_value = "127.0.0.1")]
    pub sim_host: String,

    /// Simulator export-stream port.
    #[clap(long, env = "HUB_SIM_PORT", default_value = "7778")]
    pub sim_port: u16,

    /// HTTP/WebSocket edge port.
    #[clap(long, env = "HUB_HTTP_PORT", default_value = "5010")]
    pub http_port: u16,

    /// Lua-console JSON-API-over-TCP listener port.
    #[clap(long, env = "HUB_LUA_CONSOLE_PORT", default_value = "3001")]
    pub lua_console_port: u16,

    /// Override for the per-user config directory; platform default if unset.
    #[clap(long, env = "HUB_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Root directory static web app bundles are served from under `/app/<appname>`.
    #[clap(long, env = "HUB_APP_DIR", default_value = "./webapps")]
    pub app_dir: PathBuf,

    /// `manual` (default) leaves ports disconnected until requested;
    /// `auto` connects every discovered port on startup.
    #[clap(long, env = "HUB_AUTORUN_MODE", default_value = "manual")]
    pub autorun_mode: String,

    /// Optional path to a JSON file whose fields fill in anything not given
    /// on the command line or via environment variables.
    #[clap(long, env = "HUB_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "HUB_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Resolve the effective config directory: `--config-dir` if given,
    /// otherwise the platform default (`dirs::config_dir()/dcs-bios-hub`).
    pub fn resolve_config_dir(&self) -> anyhow::Result<hub_common::config::ConfigDir> {
        match &self.config_dir {
            Some(path) => Ok(hub_common::config::ConfigDir::new(path.clone())),
            None => hub_common::config::ConfigDir::platform_default(),
        }
    }

    pub fn autoconnect_default(&self) -> bool {
        self.autorun_mode.eq_ignore_ascii_case("auto")
    }
}

/// Parse CLI flags (and their env-var fallbacks), then overlay a JSON config
/// file if `--config-path`/`HUB_CONFIG_PATH` names one. Command-line values
/// win over file values for every field that was actually provided; since
/// `clap` fills defaults eagerly, this overlay only fills fields sourced
/// from the file's own optional slots (`config_dir`).
pub fn load_config() -> Config {
    let cli_config = Config::parse();

    let file_config = cli_config.config_path.as_ref().and_then(|path| {
        fs::read_to_string(path).ok().and_then(|raw| serde_json::from_str::<Config>(&raw).ok())
    });

    match file_config {
        Some(file_config) => Config {
            config_dir: cli_config.config_dir.or(file_config.config_dir),
            ..cli_config
        },
        None => cli_config,
    }
}
