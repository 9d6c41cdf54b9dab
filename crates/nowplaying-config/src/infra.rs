//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths used by the data cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding `datacache.sqlite` (and its HTTP-response sibling).
    /// Default: `$XDG_CACHE_HOME/nowplaying/datacache` (Linux-style; platform
    /// equivalent elsewhere).
    #[serde(default = "PathsConfig::default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl PathsConfig {
    fn default_cache_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "nowplaying")
            .map(|dirs| dirs.cache_dir().join("datacache"))
            .unwrap_or_else(|| PathBuf::from("datacache"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
        }
    }
}

/// StagelinQ discovery bind settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port for StagelinQ discovery datagrams.
    /// Default: 51337
    #[serde(default = "DiscoveryConfig::default_port")]
    pub port: u16,

    /// Announce cadence, in seconds.
    /// Default: 1.0
    #[serde(default = "DiscoveryConfig::default_announce_interval")]
    pub announce_interval_secs: f64,

    /// How long to wait for directory-phase services before giving up.
    /// Default: 5.0
    #[serde(default = "DiscoveryConfig::default_discovery_timeout")]
    pub discovery_timeout_secs: f64,

    /// Name we announce ourselves as.
    #[serde(default = "DiscoveryConfig::default_device_name")]
    pub device_name: String,

    #[serde(default = "DiscoveryConfig::default_software_name")]
    pub software_name: String,

    #[serde(default = "DiscoveryConfig::default_software_version")]
    pub software_version: String,
}

impl DiscoveryConfig {
    fn default_port() -> u16 {
        51337
    }

    fn default_announce_interval() -> f64 {
        1.0
    }

    fn default_discovery_timeout() -> f64 {
        5.0
    }

    fn default_device_name() -> String {
        "NowPlaying".to_string()
    }

    fn default_software_name() -> String {
        "nowplaying".to_string()
    }

    fn default_software_version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            announce_interval_secs: Self::default_announce_interval(),
            discovery_timeout_secs: Self::default_discovery_timeout(),
            device_name: Self::default_device_name(),
            software_name: Self::default_software_name(),
            software_version: Self::default_software_version(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Filesystem paths.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Discovery bind settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_default_ends_in_datacache() {
        let paths = PathsConfig::default();
        assert!(paths.cache_dir.ends_with("datacache"));
    }

    #[test]
    fn discovery_defaults() {
        let discovery = DiscoveryConfig::default();
        assert_eq!(discovery.port, 51337);
        assert_eq!(discovery.announce_interval_secs, 1.0);
        assert_eq!(discovery.discovery_timeout_secs, 5.0);
    }
}
