//! Settings file and application paths
//!
//! `Settings` is a plain serde struct with `#[serde(default)]` on every group,
//! so partial or older JSON files load with defaults for missing fields.
//!
//! Path priority:
//! 1. CLI --config-dir argument
//! 2. LOTTIE_ORCHESTRA_CONFIG_DIR environment variable
//! 3. Local folder IF any config files exist (orchestra.json, orchestra.log)
//! 4. Platform-specific directory from dirs-next (default)

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "orchestra.json";
/// Default log file name inside the data directory
pub const LOG_FILE: &str = "orchestra.log";

const APP_DIR: &str = "lottie-orchestra";
const CONFIG_DIR_ENV: &str = "LOTTIE_ORCHESTRA_CONFIG_DIR";

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_size_bytes: u64,
    pub ttl_ms: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024,
            ttl_ms: 30.0 * 60.0 * 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_size: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub memory_limit_mb: f64,
    /// Fraction of the limit (0..1)
    pub warning_threshold: f64,
    /// Fraction of the limit (0..1)
    pub danger_threshold: f64,
    pub monitor_interval_ms: f64,
    pub cleanup_cooldown_ms: f64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            memory_limit_mb: 512.0,
            warning_threshold: 0.7,
            danger_threshold: 0.85,
            monitor_interval_ms: 5000.0,
            cleanup_cooldown_ms: 5000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub enabled: bool,
    /// 0 = auto (half the CPU count, at least one)
    pub max_workers: usize,
    pub timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 0,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    /// Host supports idle-time callbacks
    pub idle_callbacks: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            idle_callbacks: true,
        }
    }
}

/// Orchestration settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub pool: PoolSettings,
    pub memory: MemorySettings,
    pub workers: WorkerSettings,
    pub batch: BatchSettings,
}

impl Settings {
    /// Load from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings {}", path.display()))?;
        info!("Settings loaded from {}", path.display());
        Ok(settings)
    }

    /// Load if the file exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No settings at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write settings {}", path.display()))?;
        debug!("Settings saved to {}", path.display());
        Ok(())
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (LOTTIE_ORCHESTRA_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a configuration file
///
/// Platform paths:
/// - Linux: ~/.config/lottie-orchestra/{name}
/// - macOS: ~/Library/Application Support/lottie-orchestra/{name}
/// - Windows: %APPDATA%\lottie-orchestra\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Path to a data file (logs)
///
/// Platform paths:
/// - Linux: ~/.local/share/lottie-orchestra/{name}
/// - macOS: ~/Library/Application Support/lottie-orchestra/{name}
/// - Windows: %APPDATA%\lottie-orchestra\{name}
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Create configuration and data directories if missing
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }

    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }

    Ok(())
}

fn has_local_config_files(dir: &Path) -> bool {
    [SETTINGS_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }

    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_config_files(&current_dir) {
            return current_dir;
        }
    }

    if let Some(dir) = platform_dir {
        return dir.join(APP_DIR);
    }

    PathBuf::from(".")
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir())
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("test.json", &config), PathBuf::from("/custom/test.json"));
        assert_eq!(data_file("test.log", &config), PathBuf::from("/custom/test.log"));
    }

    #[test]
    fn test_cli_dir_wins() {
        let config = PathConfig::from_env_and_cli(Some(PathBuf::from("/from-cli")));
        assert_eq!(config.config_dir, Some(PathBuf::from("/from-cli")));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.cache.max_size_bytes, 50 * 1024 * 1024);
        assert_eq!(settings.cache.ttl_ms, 1_800_000.0);
        assert_eq!(settings.pool.max_size, 50);
        assert_eq!(settings.memory.cleanup_cooldown_ms, 5000.0);
        assert_eq!(settings.batch.max_batch_size, 10);
        assert!(settings.workers.enabled);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"pool": {"max_size": 7}, "memory": {"memory_limit_mb": 64}}"#)
            .unwrap();
        assert_eq!(settings.pool.max_size, 7);
        assert_eq!(settings.memory.memory_limit_mb, 64.0);
        assert_eq!(settings.memory.danger_threshold, 0.85);
        assert_eq!(settings.workers, WorkerSettings::default());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("lottie-orchestra-cfg-{}", uuid::Uuid::new_v4()));
        let config = PathConfig {
            config_dir: Some(dir.clone()),
        };
        ensure_dirs(&config).unwrap();
        let path = config_file(SETTINGS_FILE, &config);

        assert_eq!(Settings::load_or_default(&path).unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.workers.max_workers = 3;
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);

        std::fs::remove_dir_all(&dir).ok();
    }
}
