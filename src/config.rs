//! Configuration for the proxy.
//!
//! CLI arguments via `clap`, optional TOML file via `serde` + `toml`,
//! CLI taking precedence — the same layering the teacher's `config.rs`
//! uses for the cache server. The "SIZE_MAX means discover at startup"
//! sentinel from spec.md §6 is modeled with `Option<usize>`: `None`
//! (the value is simply absent from both CLI and file) means "discover",
//! which is the idiomatic Rust spelling of the same intent.

use crate::error::ResolveError;
use crate::net::Endpoint;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_MINCONN: usize = 1000;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "tcp-splice-proxy")]
#[command(about = "A zero-copy TCP reverse proxy built on splice(2)", long_about = None)]
pub struct CliArgs {
    /// Listen endpoint, e.g. "0.0.0.0:6380" or ":6380".
    pub listen: String,

    /// Upstream endpoint to relay to, e.g. "127.0.0.1:6379".
    pub upstream: String,

    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of worker threads. Omit to use the CPU count.
    #[arg(long)]
    pub nproc: Option<usize>,

    /// Requested kernel pipe capacity in bytes. Omit to use the kernel default.
    #[arg(long)]
    pub pipe_size: Option<usize>,

    /// Reserved: requested SO_SNDBUF. Read but not currently applied.
    #[arg(long)]
    pub send_size: Option<usize>,

    /// Reserved: requested SO_RCVBUF. Read but not currently applied.
    #[arg(long)]
    pub recv_size: Option<usize>,

    /// Initial per-worker connection-slot pool size.
    #[arg(long)]
    pub minconn: Option<usize>,

    /// Absolute per-worker connection cap.
    #[arg(long)]
    pub maxconn: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProxyConfig {
    pub nproc: Option<usize>,
    pub pipe_size: Option<usize>,
    pub send_size: Option<usize>,
    pub recv_size: Option<usize>,
    pub minconn: Option<usize>,
    pub maxconn: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final, resolved, read-only configuration shared across workers.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Endpoint,
    pub upstream: Endpoint,
    pub nproc: usize,
    pub pipe_size: usize,
    pub send_size: usize,
    pub recv_size: usize,
    pub minconn: usize,
    pub maxconn: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file, then
    /// resolve every "discover at startup" option against the OS.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents =
                std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let nproc = cli
            .nproc
            .or(toml_config.proxy.nproc)
            .unwrap_or_else(discover_nproc);
        let pipe_size = cli
            .pipe_size
            .or(toml_config.proxy.pipe_size)
            .unwrap_or_else(|| discover_proc_setting("/proc/sys/fs/pipe-max-size"));
        let send_size = cli
            .send_size
            .or(toml_config.proxy.send_size)
            .unwrap_or_else(|| discover_proc_setting("/proc/sys/net/core/wmem_max"));
        let recv_size = cli
            .recv_size
            .or(toml_config.proxy.recv_size)
            .unwrap_or_else(|| discover_proc_setting("/proc/sys/net/core/rmem_max"));
        let minconn = cli
            .minconn
            .or(toml_config.proxy.minconn)
            .unwrap_or(DEFAULT_MINCONN);
        let maxconn = cli
            .maxconn
            .or(toml_config.proxy.maxconn)
            .unwrap_or(10 * minconn);

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let listen = Endpoint::resolve(&cli.listen, true).map_err(ConfigError::Resolve)?;
        let upstream = Endpoint::resolve(&cli.upstream, false).map_err(ConfigError::Resolve)?;

        Ok(Config {
            listen,
            upstream,
            nproc,
            pipe_size,
            send_size,
            recv_size,
            minconn,
            maxconn,
            log_level,
        })
    }
}

/// CPU count, falling back to 1 if it cannot be determined.
fn discover_nproc() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Read an integer out of a `/proc/sys/...` file. Returns 0 if the file
/// is missing or unparsable, matching `read_proc_setting_int`'s
/// "return 0 if failed to read" contract in the original implementation.
fn discover_proc_setting(path: &str) -> usize {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Resolve(ResolveError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Resolve(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_defaults_are_all_discover() {
        let config = TomlConfig::default();
        assert!(config.proxy.nproc.is_none());
        assert!(config.proxy.minconn.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn toml_parsing_overrides_defaults() {
        let toml_str = r#"
            [proxy]
            nproc = 4
            minconn = 500
            maxconn = 5000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.proxy.nproc, Some(4));
        assert_eq!(config.proxy.minconn, Some(500));
        assert_eq!(config.proxy.maxconn, Some(5000));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn maxconn_defaults_to_ten_times_minconn() {
        let cfg = Config::from_cli(CliArgs {
            listen: "127.0.0.1:0".into(),
            upstream: "127.0.0.1:1".into(),
            config: None,
            nproc: Some(2),
            pipe_size: Some(0),
            send_size: Some(0),
            recv_size: Some(0),
            minconn: Some(50),
            maxconn: None,
            log_level: "info".into(),
        })
        .unwrap();

        assert_eq!(cfg.minconn, 50);
        assert_eq!(cfg.maxconn, 500);
    }
}
