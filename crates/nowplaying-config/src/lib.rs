//! Configuration loading for the now-playing engine and cache.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that physically cannot change
//!   at runtime - the cache directory, the discovery bind port.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values passed into runtime
//!   object constructors (mixmode, worker counts, rate/TTL overrides). Once
//!   an object is built it owns its own copy; later config reloads do not
//!   reach back into live objects.
//!
//! # Usage
//!
//! ```rust,no_run
//! use nowplaying_config::NowPlayingConfig;
//!
//! let config = NowPlayingConfig::load().expect("failed to load config");
//! println!("cache dir: {}", config.infra.paths.cache_dir.display());
//! println!("workers: {}", config.bootstrap.worker.num_workers);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/nowplaying/config.toml` (system)
//! 2. `~/.config/nowplaying/config.toml` (user)
//! 3. `./nowplaying.toml` (local override)
//! 4. Environment variables (`NOWPLAYING_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! cache_dir = "~/.cache/nowplaying/datacache"
//!
//! [discovery]
//! port = 51337
//! announce_interval_secs = 1.0
//!
//! [audibility]
//! mixmode = "newest"
//! deckskip = []
//!
//! [worker]
//! num_workers = 2
//!
//! [rate_overrides]
//! musicbrainz = 1.0
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{AudibilityConfig, BootstrapConfig, RateOverrides, TtlOverrides, WorkerConfig};
pub use infra::{DiscoveryConfig, InfraConfig, PathsConfig};
pub use loader::ConfigSources;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete now-playing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NowPlayingConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl NowPlayingConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, with an optional caller-supplied path taking
    /// precedence over the local `./nowplaying.toml` override.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about where values came from.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = NowPlayingConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NowPlayingConfig::default();
        assert_eq!(config.infra.discovery.port, 51337);
        assert_eq!(config.bootstrap.worker.num_workers, 2);
    }

    #[test]
    fn test_load_defaults() {
        let config = NowPlayingConfig::load().unwrap();
        assert_eq!(config.infra.discovery.port, 51337);
    }
}
