//! Global configuration loaded from `~/.config/ddm/config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Retry/backoff knobs for segment transfer (see `retry::RetryPolicy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum consecutive transient failures before a part gives up.
    pub max_attempts: u32,
    /// Upper bound on the linear backoff delay, in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_delay_secs: 30,
        }
    }
}

/// Global configuration for the download engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdmConfig {
    /// Root directory new downloads are saved under, absent an explicit
    /// per-task override. Overridden at process start by `DOWNLOAD_DIR`.
    pub download_dir: PathBuf,
    /// Maximum number of tasks the scheduler keeps in DOWNLOADING at once.
    pub max_concurrent_downloads: usize,
    /// Default number of connections (segments) per SegmentedDownload.
    pub max_connections_per_task: usize,
    /// Default number of files a FolderAggregator downloads concurrently.
    pub max_concurrent_files_per_folder: usize,
    /// Move completed files into category subfolders
    /// (Images/Videos/Music/Archives/Programs/Documents/Others).
    pub organize_files: bool,
    /// Default per-task speed limit in kbps; 0 means unlimited.
    pub default_speed_limit_kbps: u32,
    pub retry: RetryConfig,
}

impl Default for DdmConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: 3,
            max_connections_per_task: 4,
            max_concurrent_files_per_folder: 2,
            organize_files: true,
            default_speed_limit_kbps: 0,
            retry: RetryConfig::default(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs_home().join("Downloads").join("DDM")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("ddm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
///
/// The `DOWNLOAD_DIR` environment variable, if set, always overrides the
/// persisted `download_dir` (matches the single documented environment
/// override in the external-interfaces contract).
pub fn load_or_init() -> Result<DdmConfig> {
    let path = config_path()?;
    let mut cfg = if !path.exists() {
        let default_cfg = DdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        default_cfg
    } else {
        let data = fs::read_to_string(&path)?;
        toml::from_str(&data)?
    };

    if let Some(dir) = std::env::var_os("DOWNLOAD_DIR") {
        cfg.download_dir = PathBuf::from(dir);
    }

    if !cfg.download_dir.exists() {
        fs::create_dir_all(&cfg.download_dir)?;
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = DdmConfig::default();
        assert_eq!(cfg.max_concurrent_downloads, 3);
        assert_eq!(cfg.max_connections_per_task, 4);
        assert_eq!(cfg.max_concurrent_files_per_folder, 2);
        assert!(cfg.organize_files);
        assert_eq!(cfg.default_speed_limit_kbps, 0);
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = DdmConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: DdmConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_concurrent_downloads, cfg.max_concurrent_downloads);
        assert_eq!(parsed.max_connections_per_task, cfg.max_connections_per_task);
        assert_eq!(parsed.organize_files, cfg.organize_files);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            download_dir = "/tmp/ddm-downloads"
            max_concurrent_downloads = 8
            max_connections_per_task = 16
            max_concurrent_files_per_folder = 4
            organize_files = false
            default_speed_limit_kbps = 512

            [retry]
            max_attempts = 3
            max_delay_secs = 10
        "#;
        let cfg: DdmConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_concurrent_downloads, 8);
        assert_eq!(cfg.max_connections_per_task, 16);
        assert!(!cfg.organize_files);
        assert_eq!(cfg.default_speed_limit_kbps, 512);
        assert_eq!(cfg.retry.max_attempts, 3);
    }
}
