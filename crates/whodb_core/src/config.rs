use crate::{Credential, EngineError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            "off" => Self::Off,
            _ => Self::Info,
        }
    }

    /// Filter string understood by `env_logger`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// Process configuration read once from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    /// Mirror logs to `<data dir>/debug.log`.
    pub debug_file: bool,
    /// CLI mode disables server-side path rewriting for file-backed engines.
    pub cli_mode: bool,
    /// Desktop mode enables keyring-backed credential storage.
    pub desktop_mode: bool,
    pub allowed_origins: Vec<String>,
    /// Require an access token on every request.
    pub api_gateway: bool,
    /// Accepted access tokens when the gateway is on.
    pub tokens: Vec<String>,
    /// URL prefix for all routes.
    pub base_path: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            debug_file: false,
            cli_mode: false,
            desktop_mode: false,
            allowed_origins: vec!["https://*".to_string(), "http://*".to_string()],
            api_gateway: false,
            tokens: Vec::new(),
            base_path: String::new(),
            port: 8080,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let allowed_origins = match get("WHODB_ALLOWED_ORIGINS") {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => defaults.allowed_origins,
        };

        let tokens = get("WHODB_TOKENS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            log_level: get("WHODB_LOG_LEVEL")
                .map(|v| LogLevel::parse(&v))
                .unwrap_or_default(),
            debug_file: env_bool(get("WHODB_DEBUG_FILE")),
            cli_mode: env_bool(get("WHODB_CLI")),
            desktop_mode: env_bool(get("WHODB_DESKTOP")),
            allowed_origins,
            api_gateway: env_bool(get("WHODB_API_GATEWAY")),
            tokens,
            base_path: get("WHODB_BASE_PATH").unwrap_or_default(),
            port: get("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn accepts_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

fn env_bool(value: Option<String>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Process-wide configuration. The first caller (normally `main`) freezes
/// the environment snapshot; later calls see the same values.
pub fn app_config() -> &'static AppConfig {
    APP_CONFIG.get_or_init(AppConfig::from_env)
}

/// Install an explicit configuration; returns false if one was frozen.
pub fn init_app_config(config: AppConfig) -> bool {
    let mut installed = false;
    APP_CONFIG.get_or_init(|| {
        installed = true;
        config
    });
    installed
}

/// Per-user data directory (`<config dir>/whodb`), created on demand.
pub fn data_dir() -> Result<PathBuf, EngineError> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| EngineError::internal("could not determine the user config directory"))?;
    let dir = config_dir.join("whodb");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Named connection saved by the CLI (`connections add`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedConnection {
    pub name: String,
    pub credential: Credential,
}

/// On-disk config file for CLI usage. Server mode never needs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub connections: Vec<NamedConnection>,
}

pub struct ConfigStore {
    path: PathBuf,
    pub file: ConfigFile,
}

impl ConfigStore {
    pub fn load() -> Result<Self, EngineError> {
        Self::load_from(data_dir()?.join("config.json"))
    }

    pub fn load_from(path: PathBuf) -> Result<Self, EngineError> {
        let file = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| EngineError::internal(format!("corrupt config file: {e}")))?
        } else {
            ConfigFile::default()
        };
        Ok(Self { path, file })
    }

    pub fn save(&self) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(&self.file)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&NamedConnection> {
        self.file.connections.iter().find(|c| c.name == name)
    }

    pub fn add(&mut self, connection: NamedConnection) -> Result<(), EngineError> {
        if self.find(&connection.name).is_some() {
            return Err(EngineError::conflict(format!(
                "a connection named {:?} already exists",
                connection.name
            )));
        }
        self.file.connections.push(connection);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.file.connections.len();
        self.file.connections.retain(|c| c.name != name);
        self.file.connections.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabaseKind;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = AppConfig::from_lookup(|_| None);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.port, 8080);
        assert_eq!(config.allowed_origins, vec!["https://*", "http://*"]);
        assert!(!config.api_gateway);
        assert!(config.base_path.is_empty());
    }

    #[test]
    fn parses_gateway_settings() {
        let config = AppConfig::from_lookup(|name| match name {
            "WHODB_API_GATEWAY" => Some("true".into()),
            "WHODB_TOKENS" => Some("good, better ,best".into()),
            "PORT" => Some("9000".into()),
            _ => None,
        });
        assert!(config.api_gateway);
        assert!(config.accepts_token("good"));
        assert!(config.accepts_token("better"));
        assert!(!config.accepts_token("bad"));
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn config_store_round_trips_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut store = ConfigStore::load_from(path.clone()).unwrap();
        let mut credential = Credential::new(DatabaseKind::Postgres);
        credential.hostname = "db.local".into();
        store
            .add(NamedConnection {
                name: "prod".into(),
                credential,
            })
            .unwrap();
        store.save().unwrap();

        let reloaded = ConfigStore::load_from(path).unwrap();
        assert_eq!(reloaded.file.connections.len(), 1);
        assert_eq!(reloaded.find("prod").unwrap().credential.hostname, "db.local");

        let mut store = reloaded;
        assert!(store.remove("prod"));
        assert!(!store.remove("prod"));
    }
}
