use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default cap on a single inbound frame (100 MiB), large enough for
/// base64-encoded images.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

/// Runtime settings, read from `MURMUR_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8765,
            db_path: PathBuf::from("murmur.db"),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let port = match lookup("MURMUR_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("MURMUR_PORT is not a valid port: {:?}", raw))?,
            None => defaults.port,
        };
        let max_message_bytes = match lookup("MURMUR_MAX_MESSAGE_BYTES") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("MURMUR_MAX_MESSAGE_BYTES is not a byte count: {:?}", raw))?,
            None => defaults.max_message_bytes,
        };

        Ok(Self {
            host: lookup("MURMUR_HOST").unwrap_or(defaults.host),
            port,
            db_path: lookup("MURMUR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            max_message_bytes,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
