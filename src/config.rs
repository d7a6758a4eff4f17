// =============================================================================
// Configuration — CLI flags, environment overrides, startup validation
// =============================================================================
//
// Every tunable of the live pipeline lives here. Parsing happens once at
// startup; a validation failure is a configuration error and the process
// exits with code 2 before any subsystem starts.
// =============================================================================

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Default upstream Socket.IO endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "https://backend.rugs.fun?frontend-version=1.0";

/// Default bounded-queue capacity for the event bus.
pub const DEFAULT_RING_BUFFER_SIZE: usize = 5_000;

/// Which measurement the integrity monitor thresholds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityThresholdType {
    /// Trigger when a tick gap exceeds the threshold value.
    Ticks,
    /// Trigger after N consecutive unclean games.
    Games,
}

impl std::fmt::Display for IntegrityThresholdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticks => write!(f, "ticks"),
            Self::Games => write!(f, "games"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Command-line surface of the core service.
#[derive(Debug, Clone, Parser)]
#[command(name = "vectra", about = "Observe-and-act trading harness core service")]
pub struct Config {
    /// Upstream Socket.IO endpoint.
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,

    /// Root directory for recorded sessions.
    #[arg(long, env = "VECTRA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Stop the session after N recorded games (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub session_game_limit: u32,

    /// Stop the session after N minutes (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub session_time_limit: u64,

    /// Integrity threshold kind: tick-gap size or unclean-game count.
    #[arg(long, value_enum, default_value_t = IntegrityThresholdType::Ticks)]
    pub integrity_threshold_type: IntegrityThresholdType,

    /// Integrity threshold value (ticks of gap, or games).
    #[arg(long, default_value_t = 5)]
    pub integrity_threshold_value: u32,

    /// Maximum signals per second accepted from the feed (critical events
    /// bypass the limiter).
    #[arg(long, default_value_t = 20.0)]
    pub rate_limit: f64,

    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Info, env = "VECTRA_LOG_LEVEL")]
    pub log_level: LogLevel,

    /// Event bus queue capacity.
    #[arg(long, default_value_t = DEFAULT_RING_BUFFER_SIZE, env = "VECTRA_RING_BUFFER_SIZE")]
    pub ring_buffer_size: usize,

    /// Window within which a second rugged frame pairs with the first.
    #[arg(long, default_value_t = 500)]
    pub rug_pair_window_ms: u64,
}

impl Config {
    /// Resolved data directory: flag/env override, else `$HOME/rugs_data`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs_home().join("rugs_data"),
        }
    }

    /// Validate cross-field constraints that clap cannot express.
    /// Failures here are configuration errors (exit code 2).
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_limit <= 0.0 {
            return Err(format!(
                "--rate-limit must be positive, got {}",
                self.rate_limit
            ));
        }
        if self.integrity_threshold_value == 0 {
            return Err("--integrity-threshold-value must be at least 1".into());
        }
        if self.ring_buffer_size == 0 {
            return Err("ring buffer size must be at least 1".into());
        }
        if !self.upstream_url.starts_with("http://")
            && !self.upstream_url.starts_with("https://")
            && !self.upstream_url.starts_with("ws://")
            && !self.upstream_url.starts_with("wss://")
        {
            return Err(format!(
                "--upstream-url must be an http(s) or ws(s) URL, got {}",
                self.upstream_url
            ));
        }
        Ok(())
    }
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("vectra").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit, 20.0);
        assert_eq!(config.ring_buffer_size, DEFAULT_RING_BUFFER_SIZE);
        assert_eq!(config.integrity_threshold_value, 5);
    }

    #[test]
    fn rejects_non_positive_rate_limit() {
        let config = parse(&["--rate-limit", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_integrity_threshold() {
        let config = parse(&["--integrity-threshold-value", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_upstream_scheme() {
        let config = parse(&["--upstream-url", "ftp://example.com"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn data_dir_defaults_under_home() {
        let config = parse(&[]);
        assert!(config.resolved_data_dir().ends_with("rugs_data"));
    }
}
