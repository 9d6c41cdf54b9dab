//! Config file discovery, loading, and environment variable overlay.

use crate::{AudibilityConfig, BootstrapConfig, ConfigError, DiscoveryConfig, InfraConfig, NowPlayingConfig, PathsConfig, WorkerConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a caller-supplied override path.
pub fn discover_config_files_with_override(override_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/nowplaying/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("nowplaying/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = override_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("nowplaying.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<NowPlayingConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<NowPlayingConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut infra = InfraConfig::default();
    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("cache_dir").and_then(|v| v.as_str()) {
            infra.paths = PathsConfig {
                cache_dir: expand_path(v),
            };
        }
    }
    if let Some(discovery) = table.get("discovery").and_then(|v| v.as_table()) {
        if let Some(v) = discovery.get("port").and_then(|v| v.as_integer()) {
            infra.discovery.port = v as u16;
        }
        if let Some(v) = discovery.get("announce_interval_secs").and_then(|v| v.as_float()) {
            infra.discovery.announce_interval_secs = v;
        }
        if let Some(v) = discovery.get("discovery_timeout_secs").and_then(|v| v.as_float()) {
            infra.discovery.discovery_timeout_secs = v;
        }
        if let Some(v) = discovery.get("device_name").and_then(|v| v.as_str()) {
            infra.discovery.device_name = v.to_string();
        }
    }

    let mut bootstrap = BootstrapConfig::default();
    if let Some(audibility) = table.get("audibility").and_then(|v| v.as_table()) {
        if let Some(v) = audibility.get("mixmode").and_then(|v| v.as_str()) {
            bootstrap.audibility.mixmode = v.to_string();
        }
        if let Some(v) = audibility.get("deckskip").and_then(|v| v.as_array()) {
            bootstrap.audibility.deckskip = v
                .iter()
                .filter_map(|v| v.as_integer())
                .map(|v| v as u8)
                .collect();
        }
        if let Some(v) = audibility.get("audible_threshold").and_then(|v| v.as_float()) {
            bootstrap.audibility.audible_threshold = v;
        }
    }
    if let Some(worker) = table.get("worker").and_then(|v| v.as_table()) {
        if let Some(v) = worker.get("num_workers").and_then(|v| v.as_integer()) {
            bootstrap.worker.num_workers = v as usize;
        }
        if let Some(v) = worker.get("max_concurrent_per_worker").and_then(|v| v.as_integer()) {
            bootstrap.worker.max_concurrent_per_worker = v as usize;
        }
        if let Some(v) = worker.get("batch_size").and_then(|v| v.as_integer()) {
            bootstrap.worker.batch_size = v as usize;
        }
    }
    if let Some(rates) = table.get("rate_overrides").and_then(|v| v.as_table()) {
        for (provider, rate) in rates {
            if let Some(r) = rate.as_float() {
                bootstrap.rate_overrides.insert(provider.clone(), r);
            }
        }
    }
    if let Some(ttls) = table.get("ttl_overrides").and_then(|v| v.as_table()) {
        for (data_type, ttl) in ttls {
            if let Some(t) = ttl.as_integer() {
                bootstrap.ttl_overrides.insert(data_type.clone(), t as u64);
            }
        }
    }

    Ok(NowPlayingConfig { infra, bootstrap })
}

/// Merge two configs, with `overlay` taking precedence field-by-field
/// wherever `overlay` differs from the compiled default.
pub fn merge_configs(base: NowPlayingConfig, overlay: NowPlayingConfig) -> NowPlayingConfig {
    let default_discovery = DiscoveryConfig::default();
    let default_audibility = AudibilityConfig::default();
    let default_worker = WorkerConfig::default();

    let mut merged = base;

    if overlay.infra.paths != PathsConfig::default() {
        merged.infra.paths = overlay.infra.paths;
    }
    if overlay.infra.discovery != default_discovery {
        merged.infra.discovery = overlay.infra.discovery;
    }
    if overlay.bootstrap.audibility != default_audibility {
        merged.bootstrap.audibility = overlay.bootstrap.audibility;
    }
    if overlay.bootstrap.worker != default_worker {
        merged.bootstrap.worker = overlay.bootstrap.worker;
    }
    for (k, v) in overlay.bootstrap.rate_overrides {
        merged.bootstrap.rate_overrides.insert(k, v);
    }
    for (k, v) in overlay.bootstrap.ttl_overrides {
        merged.bootstrap.ttl_overrides.insert(k, v);
    }

    merged
}

/// Apply `NOWPLAYING_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut NowPlayingConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("NOWPLAYING_CACHE_DIR") {
        config.infra.paths.cache_dir = expand_path(&v);
        sources.env_overrides.push("NOWPLAYING_CACHE_DIR".to_string());
    }
    if let Ok(v) = env::var("NOWPLAYING_DISCOVERY_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.discovery.port = port;
            sources.env_overrides.push("NOWPLAYING_DISCOVERY_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("NOWPLAYING_MIXMODE") {
        config.bootstrap.audibility.mixmode = v;
        sources.env_overrides.push("NOWPLAYING_MIXMODE".to_string());
    }
    if let Ok(v) = env::var("NOWPLAYING_NUM_WORKERS") {
        if let Ok(n) = v.parse() {
            config.bootstrap.worker.num_workers = n;
            sources.env_overrides.push("NOWPLAYING_NUM_WORKERS".to_string());
        }
    }
}

fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(base) = directories::BaseDirs::new() {
            return base.home_dir().join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_toml_overrides_discovery_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nowplaying.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[discovery]\nport = 9999\n").unwrap();

        let config = load_from_file(&path).unwrap();
        assert_eq!(config.infra.discovery.port, 9999);
    }

    #[test]
    fn merge_prefers_overlay_when_non_default() {
        let base = NowPlayingConfig::default();
        let mut overlay = NowPlayingConfig::default();
        overlay.infra.discovery.port = 12345;

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.infra.discovery.port, 12345);
    }

    #[test]
    fn env_override_wins() {
        let mut config = NowPlayingConfig::default();
        let mut sources = ConfigSources::default();
        env::set_var("NOWPLAYING_NUM_WORKERS", "7");
        apply_env_overrides(&mut config, &mut sources);
        env::remove_var("NOWPLAYING_NUM_WORKERS");

        assert_eq!(config.bootstrap.worker.num_workers, 7);
        assert!(sources.env_overrides.contains(&"NOWPLAYING_NUM_WORKERS".to_string()));
    }
}
