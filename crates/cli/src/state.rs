use std::str::FromStr;
use std::time::Duration;
use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use service::ServiceConfig;

pub const APP_NAME: &str = "dazaar";
pub const PATH_ENV: &str = "DAZAAR_PATH";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DB_FILE_NAME: &str = "db.sqlite";
pub const LOGS_DIR_NAME: &str = "logs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default log level, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Listen port for the peer endpoint (optional, defaults to ephemeral)
    #[serde(default)]
    pub peer_port: Option<u16>,
    /// Milliseconds between two validate calls on one session
    #[serde(default = "default_revalidate_interval_ms")]
    pub revalidate_interval_ms: u64,
    /// Also write logs to files under the state directory
    #[serde(default)]
    pub log_to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_revalidate_interval_ms() -> u64 {
    common::market::DEFAULT_REVALIDATE_INTERVAL.as_millis() as u64
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            peer_port: None,
            revalidate_interval_ms: default_revalidate_interval_ms(),
            log_to_file: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the dazaar directory (~/.dazaar)
    pub dazaar_dir: PathBuf,
    /// Path to the SQLite database
    pub db_path: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the dazaar directory path: custom, then $DAZAAR_PATH, then ~/.dazaar
    pub fn dazaar_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }
        if let Some(path) = std::env::var_os(PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Initialize a new dazaar state directory
    pub fn init(
        custom_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let dazaar_dir = Self::dazaar_dir(custom_path)?;

        if dazaar_dir.join(CONFIG_FILE_NAME).exists() {
            return Err(StateError::AlreadyInitialized);
        }
        fs::create_dir_all(&dazaar_dir)?;

        let config = config.unwrap_or_default();
        config.validate()?;
        let config_path = dazaar_dir.join(CONFIG_FILE_NAME);
        let config_toml = toml::to_string_pretty(&config)?;
        fs::write(&config_path, config_toml)?;

        // the database itself is created by the service on first open
        let db_path = dazaar_dir.join(DB_FILE_NAME);

        Ok(Self {
            dazaar_dir,
            db_path,
            config_path,
            config,
        })
    }

    /// Load existing state from the dazaar directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let dazaar_dir = Self::dazaar_dir(custom_path)?;

        if !dazaar_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = dazaar_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }

        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;
        config.validate()?;

        Ok(Self {
            db_path: dazaar_dir.join(DB_FILE_NAME),
            dazaar_dir,
            config_path,
            config,
        })
    }

    /// Service configuration for this state directory
    pub fn service_config(&self) -> Result<ServiceConfig, StateError> {
        let log_dir = self
            .config
            .log_to_file
            .then(|| self.dazaar_dir.join(LOGS_DIR_NAME));
        Ok(ServiceConfig {
            peer_port: self.config.peer_port,
            sqlite_path: Some(self.db_path.clone()),
            revalidate_interval: Duration::from_millis(self.config.revalidate_interval_ms),
            log_level: self.config.log_level()?,
            log_dir,
        })
    }
}

impl AppConfig {
    pub fn log_level(&self) -> Result<tracing::Level, StateError> {
        tracing::Level::from_str(&self.log_level)
            .map_err(|_| StateError::InvalidConfig(format!("unknown log level {}", self.log_level)))
    }

    fn validate(&self) -> Result<(), StateError> {
        self.log_level()?;
        if self.revalidate_interval_ms == 0 {
            return Err(StateError::InvalidConfig(
                "revalidate_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("dazaar directory not initialized. Run 'dazaar init' first")]
    NotInitialized,

    #[error("dazaar directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        let config = AppConfig {
            peer_port: Some(4100),
            revalidate_interval_ms: 250,
            ..Default::default()
        };
        let state = AppState::init(Some(path.clone()), Some(config.clone())).unwrap();
        assert_eq!(state.dazaar_dir, path);
        assert!(state.config_path.exists());

        let loaded = AppState::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.config, config);

        let service = loaded.service_config().unwrap();
        assert_eq!(service.peer_port, Some(4100));
        assert_eq!(service.revalidate_interval, Duration::from_millis(250));
        assert_eq!(service.sqlite_path, Some(path.join(DB_FILE_NAME)));
        assert!(service.log_dir.is_none());

        assert!(matches!(
            AppState::init(Some(path), None),
            Err(StateError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_load_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppState::load(Some(dir.path().join("missing"))),
            Err(StateError::NotInitialized)
        ));
        assert!(matches!(
            AppState::load(Some(dir.path().to_path_buf())),
            Err(StateError::MissingFile(_))
        ));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = toml::from_str("peer_port = 7000\n").unwrap();
        assert_eq!(config.peer_port, Some(7000));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.revalidate_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            AppState::init(Some(dir.path().to_path_buf()), Some(config)),
            Err(StateError::InvalidConfig(_))
        ));
    }
}
