//! Gateway settings loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//!
//! # Required fields
//! - `db.filename`
//! - `server.port`
//!
//! The `[twitter]` section is optional; when present, both keys are required.
//! Connections with twitter senders cannot start without it.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Settings types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub db: DbSettings,
    pub server: ServerSettings,
    pub twitter: Option<TwitterAppConfig>,
}

#[derive(Debug, Clone)]
pub struct DbSettings {
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
}

/// Application-level credentials for the direct-message platform.
#[derive(Debug, Clone)]
pub struct TwitterAppConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawSettings {
    db: Option<RawDbSettings>,
    server: Option<RawServerSettings>,
    twitter: Option<RawTwitterSettings>,
}

#[derive(Debug, Deserialize)]
struct RawDbSettings {
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServerSettings {
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawTwitterSettings {
    consumer_key: Option<String>,
    consumer_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Example settings file, printed when the gateway is started without one.
pub fn sample_settings() -> &'static str {
    "[db]\n\
     filename = \"/var/lib/courier/courier.db\"\n\
     \n\
     [server]\n\
     port = 8000\n\
     \n\
     [twitter]\n\
     consumer_key = \"put-your-application-consumer-key-here\"\n\
     consumer_secret = \"put-your-application-consumer-secret-here\"\n"
}

/// Load settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading settings file '{}': {}", path.display(), e)))?;
    load_settings_from_str(&toml_str)
}

/// Load settings from a TOML string.
pub fn load_settings_from_str(toml_str: &str) -> Result<Settings, ConfigError> {
    let raw: RawSettings =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_db = raw
        .db
        .ok_or_else(|| ConfigError::MissingField("db".to_owned()))?;
    let filename = raw_db
        .filename
        .ok_or_else(|| ConfigError::MissingField("db.filename".to_owned()))?;
    if filename.is_empty() {
        return Err(ConfigError::InvalidValue(
            "db.filename must not be empty".to_owned(),
        ));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let port = raw_server
        .port
        .ok_or_else(|| ConfigError::MissingField("server.port".to_owned()))?;

    let twitter = match raw.twitter {
        None => None,
        Some(t) => Some(TwitterAppConfig {
            consumer_key: t
                .consumer_key
                .ok_or_else(|| ConfigError::MissingField("twitter.consumer_key".to_owned()))?,
            consumer_secret: t
                .consumer_secret
                .ok_or_else(|| ConfigError::MissingField("twitter.consumer_secret".to_owned()))?,
        }),
    };

    Ok(Settings {
        db: DbSettings { filename },
        server: ServerSettings { port },
        twitter,
    })
}
