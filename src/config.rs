//! Configuration
//!
//! TigerStyle: Defaults in constants, overrides from CLI then environment.

use crate::sim::SimConfig;
use crate::FETCH_TIMEOUT_MS_DEFAULT;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Default data directory (tilde-expanded by the binary)
pub const DATA_DIR_DEFAULT: &str = "~/.gatekeeper";

/// Default interval between configuration snapshots
pub const SAVE_INTERVAL_SECS_DEFAULT: u64 = 300;

/// Environment override for the fetch deadline
pub const ENV_FETCH_TIMEOUT_MS: &str = "GATEKEEPER_FETCH_TIMEOUT_MS";

/// Environment override for the snapshot interval
pub const ENV_SAVE_INTERVAL_SECS: &str = "GATEKEEPER_SAVE_INTERVAL_SECS";

/// Environment override for the platform fixture path
pub const ENV_FIXTURE: &str = "GATEKEEPER_FIXTURE";

// =============================================================================
// Resolver Configuration
// =============================================================================

/// How the resolver waits on fetches
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Deadline for one bridged fetch
    pub fetch_timeout: Duration,
    /// Join an in-flight fetch for the same key instead of issuing another
    pub coalesce_in_flight: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(FETCH_TIMEOUT_MS_DEFAULT),
            coalesce_in_flight: true,
        }
    }
}

impl ResolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "fetch timeout must be positive");
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalesce_in_flight = enabled;
        self
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Everything the binary needs to start
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// Platform directory served by the simulated adapter
    pub fixture: Option<PathBuf>,
    pub save_interval: Duration,
    pub resolver: ResolverConfig,
    pub sim: SimConfig,
}

impl AppConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            fixture: None,
            save_interval: Duration::from_secs(SAVE_INTERVAL_SECS_DEFAULT),
            resolver: ResolverConfig::default(),
            sim: SimConfig::default(),
        }
    }

    /// Apply `GATEKEEPER_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source. Blank values are ignored.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(value) = var(ENV_FETCH_TIMEOUT_MS) {
            let ms = parse_positive(ENV_FETCH_TIMEOUT_MS, &value)?;
            self.resolver.fetch_timeout = Duration::from_millis(ms);
        }

        if let Some(value) = var(ENV_SAVE_INTERVAL_SECS) {
            let secs = parse_positive(ENV_SAVE_INTERVAL_SECS, &value)?;
            self.save_interval = Duration::from_secs(secs);
        }

        if let Some(value) = var(ENV_FIXTURE) {
            self.fixture = Some(PathBuf::from(value.trim()));
        }

        Ok(())
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} (expected a positive integer)")]
    InvalidValue { var: &'static str, value: String },
}

// =============================================================================
// Tests
// =============================================================================
