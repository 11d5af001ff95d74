//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use et_core::{AccountingConfig, Accumulator, FirstIntervalPolicy, ReloginPolicy, SessionManager};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Whether the login → first detection interval is credited.
    #[serde(default)]
    pub first_interval: FirstIntervalPolicy,

    /// Upper bound on the credit of a single interval, in seconds.
    #[serde(default)]
    pub idle_cap_secs: Option<u64>,

    /// What a login does to the user's still-open session.
    #[serde(default)]
    pub relogin: ReloginPolicy,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("first_interval", &self.first_interval)
            .field("idle_cap_secs", &self.idle_cap_secs)
            .field("relogin", &self.relogin)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("et.db"),
            first_interval: FirstIntervalPolicy::default(),
            idle_cap_secs: None,
            relogin: ReloginPolicy::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(config_path).extract()
    }

    fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // ET_DATABASE_PATH, ET_IDLE_CAP_SECS, ...
        figment.merge(Env::prefixed("ET_"))
    }

    pub const fn accounting(&self) -> AccountingConfig {
        AccountingConfig {
            first_interval: self.first_interval,
            idle_cap_secs: self.idle_cap_secs,
        }
    }

    /// A session manager configured with these accounting rules.
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::new(Accumulator::new(self.accounting()), self.relogin)
    }
}

/// Returns the platform-specific config directory for et.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("et"))
}

/// Returns the platform-specific data directory for et.
///
/// On Linux: `~/.local/share/et`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("et"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_data_path_ends_with_et() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "et");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("et.db"));
        assert_eq!(config.first_interval, FirstIntervalPolicy::Discard);
        assert_eq!(config.idle_cap_secs, None);
        assert_eq!(config.relogin, ReloginPolicy::Replace);
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("et.toml");
        std::fs::write(
            &path,
            "database_path = \"/tmp/custom.db\"\n\
             first_interval = \"credit_first_category\"\n\
             idle_cap_secs = 90\n\
             relogin = \"reject\"\n",
        )
        .unwrap();

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            .extract()
            .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/custom.db"));
        assert_eq!(
            config.accounting(),
            AccountingConfig {
                first_interval: FirstIntervalPolicy::CreditFirstCategory,
                idle_cap_secs: Some(90),
            }
        );
        assert_eq!(config.relogin, ReloginPolicy::Reject);
    }

    #[test]
    fn test_missing_config_file_keeps_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(temp.path().join("absent.toml")))
            .extract()
            .unwrap();
        assert_eq!(config.idle_cap_secs, None);
        assert_eq!(config.relogin, ReloginPolicy::Replace);
    }
}
