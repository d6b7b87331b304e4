use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Library configuration, loadable from `~/.config/mtnet/config.toml`.
///
/// Applications may also build one programmatically and pass it to
/// `RequestManager::initialize_with`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Worker pool size. 0 selects the CPU core count (fallback 8);
    /// non-zero values are clamped to `1..=100` at initialization.
    pub max_workers: usize,
    /// Verify the TLS peer certificate on https requests. Off by default;
    /// embedding applications that need strict verification turn this on.
    pub tls_verify_peer: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            tls_verify_peer: false,
        }
    }
}

impl ManagerConfig {
    /// Resolved pool size: auto-detect when 0, then clamp to `1..=100`.
    pub fn effective_workers(&self) -> usize {
        let n = if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8)
        } else {
            self.max_workers
        };
        n.clamp(1, 100)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mtnet")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<ManagerConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ManagerConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: ManagerConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_workers_clamps() {
        let mut cfg = ManagerConfig::default();
        cfg.max_workers = 500;
        assert_eq!(cfg.effective_workers(), 100);
        cfg.max_workers = 4;
        assert_eq!(cfg.effective_workers(), 4);
        cfg.max_workers = 0;
        assert!((1..=100).contains(&cfg.effective_workers()));
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = ManagerConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ManagerConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_workers, cfg.max_workers);
        assert_eq!(parsed.tls_verify_peer, cfg.tls_verify_peer);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            max_workers = 16
            tls_verify_peer = true
        "#;
        let cfg: ManagerConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_workers, 16);
        assert!(cfg.tls_verify_peer);
    }
}
