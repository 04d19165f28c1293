//! Server configuration: optional TOML file, flags override.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [storage]
//! db = "/var/lib/concord/concord.sqlite3"
//!
//! [admin]
//! email = "ops@example.com"
//! ```

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DB: &str = "concord.sqlite3";

#[derive(Debug, Parser)]
#[command(name = "server", about = "Concord dispatch server")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Bind host; overrides the config file.
    #[arg(long)]
    pub host: Option<String>,
    /// Bind port; overrides the config file.
    #[arg(long)]
    pub port: Option<u16>,
    /// SQLite database path; overrides the config file.
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Grant administrator rights to this account at startup.
    #[arg(long)]
    pub admin_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db: PathBuf,
    pub admin_email: Option<String>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server: Option<RawServerSection>,
    storage: Option<RawStorageSection>,
    admin: Option<RawAdminSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerSection {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorageSection {
    db: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAdminSection {
    email: Option<String>,
}

/// Resolve the effective config: defaults, then the TOML file, then flags.
pub fn load(cli: &Cli) -> Result<ServerConfig, ConfigError> {
    let raw = match &cli.config {
        Some(path) => parse_file(path)?,
        None => RawConfig::default(),
    };
    let server = raw.server.unwrap_or_default();
    let storage = raw.storage.unwrap_or_default();
    let admin = raw.admin.unwrap_or_default();

    Ok(ServerConfig {
        host: cli
            .host
            .clone()
            .or(server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_owned()),
        port: cli.port.or(server.port).unwrap_or(DEFAULT_PORT),
        db: cli
            .db
            .clone()
            .or(storage.db)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
        admin_email: cli.admin_email.clone().or(admin.email),
    })
}

fn parse_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("server").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_apply_without_file_or_flags() {
        let config = load(&cli(&[])).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.db, PathBuf::from(DEFAULT_DB));
        assert_eq!(config.admin_email, None);
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            "[server]\nhost = \"127.0.0.1\"\nport = 9000\n\n[admin]\nemail = \"file@x\"\n",
        )
        .unwrap();

        let config = load(&cli(&[
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9100",
            "--admin-email",
            "flag@x",
        ]))
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
        assert_eq!(config.admin_email.as_deref(), Some("flag@x"));
    }

    #[test]
    fn missing_config_file_is_a_startup_error() {
        let result = load(&cli(&["--config", "/nonexistent/concord.toml"]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
