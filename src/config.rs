// src/config.rs
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_WEB_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_WATCH_DIR: &str = "./src";
const DEFAULT_ARTIFACT: &str = "./app.so";
const DEFAULT_BUILD_COMMAND: &str = "tcc -shared -fPIC -o app.so src/app.c";
const DEFAULT_TIME_PROTOCOL: &str = "time";
const DEFAULT_RELOAD_PROTOCOL: &str = "livereload";

/// Command-line arguments for the application.
#[derive(Parser, Debug, Deserialize, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Production mode: load the prebuilt artifact, no watching or rebuilding
    #[clap(long, help = "Production mode: load the prebuilt artifact, no watching or rebuilding")]
    pub prod: bool,

    /// HTTP address to listen on (e.g., "0.0.0.0:8080")
    #[clap(
        short,
        long,
        value_parser,
        help = "HTTP address to listen on (e.g., \"0.0.0.0:8080\")"
    )]
    pub webaddr: Option<String>,

    /// Directory whose completed writes trigger a rebuild
    #[clap(long, value_parser, help = "Directory whose completed writes trigger a rebuild")]
    pub watch_dir: Option<String>,

    /// Path of the shared library the build produces
    #[clap(short, long, value_parser, help = "Path of the shared library the build produces")]
    pub artifact: Option<String>,

    /// Shell command that builds the artifact
    #[clap(long, value_parser, help = "Shell command that builds the artifact")]
    pub build_command: Option<String>,

    /// Streaming clients tracked per channel
    #[clap(long, value_parser, help = "Streaming clients tracked per channel")]
    pub max_clients: Option<usize>,

    /// Path to a configuration file (e.g., hotswap.toml)
    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., hotswap.toml)"
    )]
    pub config: Option<PathBuf>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FileConfig {
    /// Listen address
    pub webaddr: Option<String>,
    /// Watched source directory
    pub watch_dir: Option<String>,
    /// Built shared library
    pub artifact: Option<String>,
    /// Build command; empty means prebuilt
    pub build_command: Option<String>,
    /// Per-channel client capacity
    pub max_clients: Option<usize>,
    /// Push period in milliseconds
    pub tick_interval_ms: Option<u64>,
    /// Longest wait between reload checks in milliseconds
    pub poll_timeout_ms: Option<u64>,
    /// Sub-protocol of the time channel
    pub time_protocol: Option<String>,
    /// Sub-protocol of the reload channel
    pub reload_protocol: Option<String>,
    /// Production mode
    pub prod: Option<bool>,
    /// Log level
    pub log_level: Option<String>,
}

impl FileConfig {
    /// Lowest-precedence values.
    pub fn defaults(log_level: String) -> Self {
        FileConfig {
            webaddr: Some(DEFAULT_WEB_ADDR.to_string()),
            watch_dir: Some(DEFAULT_WATCH_DIR.to_string()),
            artifact: Some(DEFAULT_ARTIFACT.to_string()),
            build_command: Some(DEFAULT_BUILD_COMMAND.to_string()),
            max_clients: Some(crate::registry::DEFAULT_CAPACITY),
            tick_interval_ms: Some(1000),
            poll_timeout_ms: Some(1000),
            time_protocol: Some(DEFAULT_TIME_PROTOCOL.to_string()),
            reload_protocol: Some(DEFAULT_RELOAD_PROTOCOL.to_string()),
            prod: Some(false),
            log_level: Some(log_level),
        }
    }
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Production mode
    pub prod: bool,
    /// HTTP address to listen on
    pub web_addr: String,
    /// Watched source directory
    pub watch_dir: String,
    /// Built shared library
    pub artifact: String,
    /// Build command; empty means prebuilt
    pub build_command: String,
    /// Per-channel client capacity
    pub max_clients: usize,
    /// Push period in milliseconds
    pub tick_interval_ms: u64,
    /// Longest wait between reload checks in milliseconds
    pub poll_timeout_ms: u64,
    /// Sub-protocol of the time channel
    pub time_protocol: String,
    /// Sub-protocol of the reload channel
    pub reload_protocol: String,
    /// Log level
    pub log_level: String,
}

impl AppConfig {
    /// Loads the application configuration by merging CLI, file, environment, and defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_args(CliArgs::parse())
    }

    /// Same as [`AppConfig::load`] with already parsed arguments.
    pub fn from_args(cli_args: CliArgs) -> Result<Self, figment::Error> {
        let config_file_path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("hotswap.toml"));

        // Default log level from environment variable HOTSWAP_LOG_LEVEL, then "info"
        let default_log_level =
            std::env::var("HOTSWAP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let fig = Figment::new()
            .merge(Serialized::defaults(FileConfig::defaults(
                default_log_level.clone(),
            )))
            .merge(Toml::file(config_file_path).nested())
            .merge(Env::prefixed("HOTSWAP_").map(|key| key.as_str().replace("__", ".").into()));

        let mut merged_config: FileConfig = fig.select("hotswap").extract()?;
        merged_config.apply_cli(cli_args);

        Self::from_merged(merged_config, default_log_level)
    }

    /// Resolves a merged [`FileConfig`], filling anything still unset.
    ///
    /// # Errors
    ///
    /// Fails if a timer period is zero.
    pub fn from_merged(merged: FileConfig, default_log_level: String) -> Result<Self, figment::Error> {
        Ok(AppConfig {
            prod: merged.prod.unwrap_or(false),
            web_addr: merged
                .webaddr
                .unwrap_or_else(|| DEFAULT_WEB_ADDR.to_string()),
            watch_dir: merged
                .watch_dir
                .unwrap_or_else(|| DEFAULT_WATCH_DIR.to_string()),
            artifact: merged
                .artifact
                .unwrap_or_else(|| DEFAULT_ARTIFACT.to_string()),
            build_command: merged
                .build_command
                .unwrap_or_else(|| DEFAULT_BUILD_COMMAND.to_string()),
            max_clients: merged
                .max_clients
                .unwrap_or(crate::registry::DEFAULT_CAPACITY),
            tick_interval_ms: non_zero_ms("tick_interval_ms", merged.tick_interval_ms.unwrap_or(1000))?,
            poll_timeout_ms: non_zero_ms("poll_timeout_ms", merged.poll_timeout_ms.unwrap_or(1000))?,
            time_protocol: merged
                .time_protocol
                .unwrap_or_else(|| DEFAULT_TIME_PROTOCOL.to_string()),
            reload_protocol: merged
                .reload_protocol
                .unwrap_or_else(|| DEFAULT_RELOAD_PROTOCOL.to_string()),
            log_level: merged.log_level.unwrap_or(default_log_level),
        })
    }
}

/// A zero period would panic the ticker or spin the loop.
fn non_zero_ms(key: &str, value: u64) -> Result<u64, figment::Error> {
    if value == 0 {
        return Err(figment::Error::from(format!("`{}` must be at least 1 ms", key)));
    }
    Ok(value)
}

impl FileConfig {
    /// CLI values win over file, environment and defaults. `--prod` can only
    /// switch production mode on.
    pub fn apply_cli(&mut self, cli_args: CliArgs) {
        if let Some(addr) = cli_args.webaddr {
            self.webaddr = Some(addr);
        }
        if let Some(dir) = cli_args.watch_dir {
            self.watch_dir = Some(dir);
        }
        if let Some(artifact) = cli_args.artifact {
            self.artifact = Some(artifact);
        }
        if let Some(command) = cli_args.build_command {
            self.build_command = Some(command);
        }
        if let Some(max) = cli_args.max_clients {
            self.max_clients = Some(max);
        }
        if let Some(level) = cli_args.log_level {
            self.log_level = Some(level);
        }
        if cli_args.prod {
            self.prod = Some(true);
        }
    }
}
