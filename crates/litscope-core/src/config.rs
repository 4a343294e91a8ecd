use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-user configuration, loaded from `~/.config/litscope/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub user: UserIdentity,
    pub runtime: RuntimeConfig,
}

/// Identity used as commit author for manual work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool size for record fan-out.
    pub cpus: usize,
    /// Timeout for upstream calls, in seconds.
    pub timeout_secs: u64,
    pub log_level: String,
}

// ─── Defaults ──────────────────────────────────────────────

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            user: UserIdentity::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for UserIdentity {
    fn default() -> Self {
        let name = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "litscope".to_string());
        Self {
            email: format!("{name}@localhost"),
            name,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

// ─── Load / Save ───────────────────────────────────────────

impl UserConfig {
    /// Standard config file path: `~/.config/litscope/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("LITSCOPE_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("litscope")
            .join("config.toml")
    }

    /// Load config from disk, falling back to defaults if file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// CPU budget, with `LITSCOPE_CPUS` taking precedence over the file.
    pub fn cpus(&self) -> usize {
        std::env::var("LITSCOPE_CPUS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(self.runtime.cpus)
            .max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let cfg = UserConfig::default();
        assert_eq!(cfg.runtime.cpus, 4);
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert!(!cfg.user.name.is_empty());
    }

    #[test]
    fn config_toml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = UserConfig::default();
        cfg.user.name = "Jane Reviewer".to_string();
        cfg.runtime.timeout_secs = 90;
        cfg.save_to(&path).unwrap();

        let loaded = UserConfig::load_from(&path).unwrap();
        assert_eq!(loaded.user.name, "Jane Reviewer");
        assert_eq!(loaded.runtime.timeout_secs, 90);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runtime]\ncpus = 2\n").unwrap();

        let loaded = UserConfig::load_from(&path).unwrap();
        assert_eq!(loaded.runtime.cpus, 2);
        assert_eq!(loaded.runtime.log_level, "info");
    }

    #[test]
    fn load_nonexistent_returns_default() {
        let cfg = UserConfig::load_from(Path::new("/tmp/nonexistent_litscope_config.toml")).unwrap();
        assert_eq!(cfg.runtime.timeout_secs, 30);
    }
}
