// Gateway settings
// Loaded from ~/.config/tdsweb/config.toml (or the file named on the command line)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 52441;
pub const DEFAULT_DB_PORT: u16 = 1433;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub enum ConfigError {
    /// The settings file exists but could not be read.
    Io { path: PathBuf, source: io::Error },
    /// The settings file is not valid TOML for these settings.
    Parse { path: PathBuf, message: String },
    /// A setting has a value the gateway cannot run with.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read {}: {}", path.display(), source),
            Self::Parse { path, message } => write!(f, "cannot parse {}: {}", path.display(), message),
            Self::Invalid(msg) => write!(f, "invalid setting: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Listener
    pub listen_addr: String,
    pub port: u16,

    // Database
    pub db_server: String,
    pub db_port: u16,
    pub app_name: String,

    // Limits
    pub max_connections: usize,
    pub max_message_size: usize,

    // Export
    pub export_filename: String,
    pub export_sheet_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            db_server: "localhost".to_string(),
            db_port: DEFAULT_DB_PORT,
            app_name: "tdsweb".to_string(),
            max_connections: 64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            export_filename: "results.xlsx".to_string(),
            export_sheet_name: "Results".to_string(),
        }
    }
}

impl Settings {
    /// Default settings file location
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tdsweb")
            .join("config.toml")
    }

    /// Load settings.
    ///
    /// An explicit path must exist. Without one, the default location is used
    /// when present and built-in defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::config_path();
                if !path.exists() {
                    log::debug!("no settings file at {}, using defaults", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let settings = Self::from_toml_str(&contents).map_err(|message| ConfigError::Parse {
            path: path.clone(),
            message,
        })?;
        log::info!("loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parse settings from TOML text; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }

    /// Render the settings as TOML.
    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    /// Reject values the gateway cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.db_port == 0 {
            return Err(ConfigError::Invalid("db_port must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be at least 1".into()));
        }
        if self.db_server.trim().is_empty() {
            return Err(ConfigError::Invalid("db_server must not be empty".into()));
        }
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("app_name must not be empty".into()));
        }
        if self.export_filename.trim().is_empty() {
            return Err(ConfigError::Invalid("export_filename must not be empty".into()));
        }
        validate_sheet_name(&self.export_sheet_name)?;
        Ok(())
    }

    /// `listen_addr:port`, ready for `TcpListener::bind`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}

/// Excel limits sheet names to 31 characters and forbids a few punctuation marks.
fn validate_sheet_name(name: &str) -> Result<(), ConfigError> {
    const FORBIDDEN: &[char] = &['[', ']', ':', '*', '?', '/', '\\'];

    if name.is_empty() || name.chars().count() > 31 {
        return Err(ConfigError::Invalid("export_sheet_name must be 1 to 31 characters".into()));
    }
    if name.contains(FORBIDDEN) {
        return Err(ConfigError::Invalid(format!(
            "export_sheet_name must not contain any of {}",
            FORBIDDEN.iter().collect::<String>()
        )));
    }
    if name.starts_with('\'') || name.ends_with('\'') {
        return Err(ConfigError::Invalid("export_sheet_name must not start or end with an apostrophe".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.port, 52441);
        assert_eq!(settings.db_port, 1433);
        assert_eq!(settings.app_name, "tdsweb");
        assert_eq!(settings.bind_addr(), "127.0.0.1:52441");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_toml_str("port = 9000\ndb_server = \"luthien\"\n").unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.db_server, "luthien");
        assert_eq!(settings.max_connections, 64);
        assert_eq!(settings.export_sheet_name, "Results");
    }

    #[test]
    fn test_bad_toml() {
        assert!(Settings::from_toml_str("port = \"not a number\"").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut settings = Settings::default();
        settings.max_message_size = 4096;
        let text = settings.to_toml_string().unwrap();
        assert_eq!(Settings::from_toml_str(&text).unwrap(), settings);
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        settings.port = 0;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = Settings::default();
        settings.max_connections = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.db_server = "  ".into();
        let err = settings.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid setting: db_server must not be empty");

        let mut settings = Settings::default();
        settings.export_sheet_name = "a/b".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.export_sheet_name = "x".repeat(32);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let path = std::env::temp_dir().join("tdsweb-config-test-missing.toml");
        let _ = fs::remove_file(&path);
        assert!(matches!(Settings::load(Some(&path)), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!("tdsweb-config-test-{}.toml", std::process::id()));
        fs::write(&path, "listen_addr = \"0.0.0.0\"\nmax_connections = 2\n").unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(settings.listen_addr, "0.0.0.0");
        assert_eq!(settings.max_connections, 2);
    }
}
