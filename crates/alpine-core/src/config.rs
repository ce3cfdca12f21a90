//! Process-wide configuration (Section 6, Section 10.3).
//!
//! Loaded once at entry from the `ALPINE_*` environment variables, validated
//! eagerly, and then held immutably — components receive only the slice
//! they need, never the whole struct mutably.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid verbosity for {key}: {value} (expected normal, verbose, or debug)")]
    InvalidVerbosity { key: String, value: String },
    #[error("{key} must be between 1 and 65535, got {value}")]
    PortOutOfRange { key: String, value: i64 },
    #[error("{key} must be greater than 0, got {value}")]
    NotPositive { key: String, value: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Normal,
    Verbose,
    Debug,
}

impl Verbosity {
    /// Maps to an `EnvFilter` directive, matching the orchestrator's
    /// `ALPINE_VERBOSITY` semantics (Section 10.1).
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Debug => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workdir: PathBuf,
    pub verbosity: Verbosity,
    pub git_enabled: bool,
    pub git_base_branch: String,
    pub git_auto_cleanup: bool,
    pub auto_cleanup: bool,
    pub http_port: u16,
    pub stream_buffer_size: usize,
    pub max_clients_per_run: usize,
    /// The assistant binary to invoke. Not part of the documented `ALPINE_*`
    /// surface (Section 6): this exists so integration tests can point the
    /// Executor at a fake assistant script instead of the real `claude` CLI.
    pub assistant_bin: String,
    /// Extra arguments appended after the assistant's own flags. Used
    /// alongside `assistant_bin` to invoke a fake assistant script (e.g.
    /// `assistant_bin = "/bin/sh"`, `assistant_args = ["fake.sh"]`).
    pub assistant_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            verbosity: Verbosity::Normal,
            git_enabled: true,
            git_base_branch: "main".to_string(),
            git_auto_cleanup: true,
            auto_cleanup: true,
            http_port: 3001,
            stream_buffer_size: 100,
            max_clients_per_run: 100,
            assistant_bin: "claude".to_string(),
            assistant_args: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the process environment, merging over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = env::var("ALPINE_WORKDIR") {
            config.workdir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("ALPINE_VERBOSITY") {
            config.verbosity = match v.as_str() {
                "normal" => Verbosity::Normal,
                "verbose" => Verbosity::Verbose,
                "debug" => Verbosity::Debug,
                other => {
                    return Err(ConfigError::InvalidVerbosity {
                        key: "ALPINE_VERBOSITY".to_string(),
                        value: other.to_string(),
                    })
                }
            };
        }
        if let Ok(v) = env::var("ALPINE_GIT_ENABLED") {
            config.git_enabled = parse_bool("ALPINE_GIT_ENABLED", &v)?;
        }
        if let Ok(v) = env::var("ALPINE_GIT_BASE_BRANCH") {
            config.git_base_branch = v;
        }
        if let Ok(v) = env::var("ALPINE_GIT_AUTO_CLEANUP") {
            config.git_auto_cleanup = parse_bool("ALPINE_GIT_AUTO_CLEANUP", &v)?;
        }
        if let Ok(v) = env::var("ALPINE_AUTO_CLEANUP") {
            config.auto_cleanup = parse_bool("ALPINE_AUTO_CLEANUP", &v)?;
        }
        if let Ok(v) = env::var("ALPINE_HTTP_PORT") {
            let n = parse_int("ALPINE_HTTP_PORT", &v)?;
            if !(1..=65535).contains(&n) {
                return Err(ConfigError::PortOutOfRange {
                    key: "ALPINE_HTTP_PORT".to_string(),
                    value: n,
                });
            }
            config.http_port = n as u16;
        }
        if let Ok(v) = env::var("ALPINE_STREAM_BUFFER_SIZE") {
            let n = parse_int("ALPINE_STREAM_BUFFER_SIZE", &v)?;
            if n <= 0 {
                return Err(ConfigError::NotPositive {
                    key: "ALPINE_STREAM_BUFFER_SIZE".to_string(),
                    value: n,
                });
            }
            config.stream_buffer_size = n as usize;
        }
        if let Ok(v) = env::var("ALPINE_MAX_CLIENTS_PER_RUN") {
            let n = parse_int("ALPINE_MAX_CLIENTS_PER_RUN", &v)?;
            if n <= 0 {
                return Err(ConfigError::NotPositive {
                    key: "ALPINE_MAX_CLIENTS_PER_RUN".to_string(),
                    value: n,
                });
            }
            config.max_clients_per_run = n as usize;
        }
        if let Ok(v) = env::var("ALPINE_ASSISTANT_BIN") {
            config.assistant_bin = v;
        }
        if let Ok(v) = env::var("ALPINE_ASSISTANT_ARGS") {
            config.assistant_args = v.split_whitespace().map(str::to_string).collect();
        }

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}
