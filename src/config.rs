use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MAX_ENTRIES;
use crate::processing::{Backend, parse_backend};

pub const BACKEND_ENV: &str = "LUTGRADE_BACKEND";
pub const LUT_DIR_ENV: &str = "LUTGRADE_LUT_DIR";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
/// Persisted engine settings.
pub struct EngineConfig {
    pub lut_dir: Option<PathBuf>,
    pub max_cache_size: Option<usize>,
    pub backend: Option<String>,
}

impl EngineConfig {
    /// Returns the user config file path, if a config directory is available.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("lutgrade").join("config.toml"))
    }

    /// Loads config from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        toml::from_str(&contents).unwrap_or_default()
    }

    /// Writes config to disk, ignoring filesystem/serialization errors.
    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        self.save_to(&path);
    }

    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(s) = toml::to_string_pretty(self) {
            let _ = std::fs::write(path, s);
        }
    }

    /// `LUTGRADE_LUT_DIR`, then the configured directory, then the
    /// per-user data directory.
    pub fn lut_dir(&self) -> PathBuf {
        let env = std::env::var_os(LUT_DIR_ENV).map(PathBuf::from);
        self.resolve_lut_dir(env)
    }

    fn resolve_lut_dir(&self, env: Option<PathBuf>) -> PathBuf {
        env.or_else(|| self.lut_dir.clone())
            .or_else(|| dirs::data_dir().map(|d| d.join("lutgrade").join("luts")))
            .unwrap_or_else(|| PathBuf::from("assets/luts"))
    }

    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_ENTRIES)
    }

    /// `LUTGRADE_BACKEND`, then the configured backend, then auto.
    pub fn backend(&self) -> Backend {
        self.resolve_backend(std::env::var(BACKEND_ENV).ok().as_deref())
    }

    fn resolve_backend(&self, env: Option<&str>) -> Backend {
        if let Some(raw) = env {
            return parse_backend(raw);
        }
        if let Some(raw) = self.backend.as_deref() {
            return parse_backend(raw);
        }
        Backend::Auto
    }
}
