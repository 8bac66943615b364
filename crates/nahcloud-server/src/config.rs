use crate::ServerError;
use nahcloud_store::{FileKv, StateStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// One source of settings: a config file, or flags and environment variables.
///
/// Unset fields fall through to the next layer and finally to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_body_bytes: Option<usize>,
}

impl ConfigLayer {
    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| ServerError::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Fields set in `self` win over those in `lower`.
    #[must_use]
    pub fn over(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            addr: self.addr.or(lower.addr),
            data_dir: self.data_dir.or(lower.data_dir),
            workers: self.workers.or(lower.workers),
            max_body_bytes: self.max_body_bytes.or(lower.max_body_bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: String,
    /// `None` keeps all state in memory.
    pub data_dir: Option<PathBuf>,
    pub workers: usize,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_owned(),
            data_dir: None,
            workers: DEFAULT_WORKERS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn resolve(layer: ConfigLayer) -> Result<Self, ServerError> {
        let defaults = Self::default();
        let config = Self {
            addr: layer.addr.unwrap_or(defaults.addr),
            data_dir: layer.data_dir,
            workers: layer.workers.unwrap_or(defaults.workers),
            max_body_bytes: layer.max_body_bytes.unwrap_or(defaults.max_body_bytes),
        };
        if config.addr.trim().is_empty() {
            return Err(ServerError::Config("addr must not be empty".to_owned()));
        }
        if config.workers == 0 {
            return Err(ServerError::Config("workers must be at least 1".to_owned()));
        }
        if config.max_body_bytes == 0 {
            return Err(ServerError::Config(
                "max_body_bytes must be at least 1".to_owned(),
            ));
        }
        Ok(config)
    }

    pub fn open_store(&self) -> Result<StateStore, ServerError> {
        match &self.data_dir {
            Some(dir) => Ok(StateStore::new(FileKv::open(dir)?)),
            None => Ok(StateStore::in_memory()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = ServerConfig::resolve(ConfigLayer::default()).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.addr, "0.0.0.0:8080");
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn parse_toml_file_layer() {
        let layer = ConfigLayer::parse(
            r#"
addr = "127.0.0.1:9090"
data_dir = "/var/lib/nahcloud"
workers = 8
"#,
        )
        .unwrap();
        assert_eq!(layer.addr.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(layer.data_dir, Some(PathBuf::from("/var/lib/nahcloud")));
        assert_eq!(layer.workers, Some(8));
        assert_eq!(layer.max_body_bytes, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ConfigLayer::parse("sqlite_dsn = \"x.db\"").is_err());
    }

    #[test]
    fn upper_layer_wins() {
        let flags = ConfigLayer {
            addr: Some(":1".to_owned()),
            ..ConfigLayer::default()
        };
        let file = ConfigLayer {
            addr: Some(":2".to_owned()),
            workers: Some(2),
            ..ConfigLayer::default()
        };
        let merged = flags.over(file);
        assert_eq!(merged.addr.as_deref(), Some(":1"));
        assert_eq!(merged.workers, Some(2));
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let layer = ConfigLayer {
            workers: Some(0),
            ..ConfigLayer::default()
        };
        assert!(matches!(
            ServerConfig::resolve(layer),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLayer::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn open_store_uses_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: Some(dir.path().join("state")),
            ..ServerConfig::default()
        };
        let store = config.open_store().unwrap();
        store.write("prod", b"{}").unwrap();
        assert!(dir.path().join("state").join("prod.tfstate").exists());
    }
}
