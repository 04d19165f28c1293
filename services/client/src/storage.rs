//! Client-side persisted state: `servers.json` and `config.json`.
//!
//! Both files live under the per-user data directory and are written
//! atomically (write `<name>.tmp`, then rename) so a crash mid-write never
//! leaves a torn file behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use concord_protocol::{ChannelId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::events::EndpointId;

pub const STORAGE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported storage version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCredentials {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub remember: bool,
}

/// A remote endpoint as this client knows it. The id is client-generated
/// and stable across restarts; the remote server never sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientServerInfo {
    pub id: EndpointId,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_credentials: Option<SavedCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl ClientServerInfo {
    pub fn new(name: &str, address: &str, port: u16, use_tls: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            address: address.to_owned(),
            port,
            use_tls,
            last_connected: None,
            saved_credentials: None,
            user_id: None,
        }
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/ws", self.address, self.port)
    }

    pub fn http_base(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPreferences {
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub remember_credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersFile {
    pub version: u32,
    pub servers: Vec<ClientServerInfo>,
    #[serde(default)]
    pub default_preferences: DefaultPreferences,
}

impl Default for ServersFile {
    fn default() -> Self {
        Self {
            version: STORAGE_VERSION,
            servers: Vec::new(),
            default_preferences: DefaultPreferences::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiConfig {
    pub theme: String,
    #[serde(default)]
    pub show_members_list: bool,
    /// server id → category id → collapsed.
    #[serde(default)]
    pub collapsed_categories: HashMap<String, HashMap<String, bool>>,
    #[serde(default)]
    pub muted_channels: Vec<ChannelId>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            theme: "dark".to_owned(),
            show_members_list: true,
            collapsed_categories: HashMap::new(),
            muted_channels: Vec::new(),
        }
    }
}

/// The local identity used by auto-connect: login first, register as a
/// fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub alias: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self { version: STORAGE_VERSION, ui: UiConfig::default(), identity: None }
    }
}

fn default_version() -> u32 {
    STORAGE_VERSION
}

/// Per-user data directory, created on demand.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("concord")
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn check_version(version: u32) -> Result<(), StorageError> {
    if version != STORAGE_VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }
    Ok(())
}

pub fn load_servers(path: &Path) -> Result<ServersFile, StorageError> {
    if !path.exists() {
        return Ok(ServersFile::default());
    }
    let text = std::fs::read_to_string(path)?;
    let file: ServersFile = serde_json::from_str(&text)?;
    check_version(file.version)?;
    Ok(file)
}

pub fn save_servers(path: &Path, file: &ServersFile) -> Result<(), StorageError> {
    write_atomic(path, &serde_json::to_string_pretty(file)?)
}

pub fn load_config(path: &Path) -> Result<ConfigFile, StorageError> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let text = std::fs::read_to_string(path)?;
    let file: ConfigFile = serde_json::from_str(&text)?;
    check_version(file.version)?;
    Ok(file)
}

pub fn save_config(path: &Path, file: &ConfigFile) -> Result<(), StorageError> {
    write_atomic(path, &serde_json::to_string_pretty(file)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_file_round_trips_structurally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let mut file = ServersFile::default();
        let mut info = ClientServerInfo::new("home", "chat.example.com", 8443, true);
        info.saved_credentials = Some(SavedCredentials {
            email: "a@x".to_owned(),
            token: Some("tok".to_owned()),
            auto_connect: true,
            remember: true,
        });
        info.last_connected = Some(Utc::now());
        file.servers.push(info);
        file.default_preferences.auto_connect = true;

        save_servers(&path, &file).unwrap();
        let loaded = load_servers(&path).unwrap();
        assert_eq!(loaded, file);
        // No stray temp file after the rename.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn config_file_round_trips_with_identity_and_mutes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut file = ConfigFile::default();
        file.ui.theme = "light".to_owned();
        file.ui.muted_channels.push(Uuid::new_v4());
        file.ui
            .collapsed_categories
            .entry("srv-1".to_owned())
            .or_default()
            .insert("cat-1".to_owned(), true);
        file.identity = Some(Identity {
            alias: "alice".to_owned(),
            email: "a@x".to_owned(),
            password: "pw12345678".to_owned(),
        });

        save_config(&path, &file).unwrap();
        assert_eq!(load_config(&path).unwrap(), file);
    }

    #[test]
    fn missing_files_load_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let servers = load_servers(&dir.path().join("servers.json")).unwrap();
        assert!(servers.servers.is_empty());
        assert_eq!(servers.version, STORAGE_VERSION);

        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.ui.theme, "dark");
        assert!(config.identity.is_none());
    }

    #[test]
    fn future_versions_are_refused_rather_than_mangled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, r#"{"version":2,"servers":[]}"#).unwrap();
        assert!(matches!(
            load_servers(&path),
            Err(StorageError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn ws_and_http_urls_follow_the_tls_flag() {
        let plain = ClientServerInfo::new("a", "h", 80, false);
        assert_eq!(plain.ws_url(), "ws://h:80/ws");
        assert_eq!(plain.http_base(), "http://h:80");
        let tls = ClientServerInfo::new("b", "h", 443, true);
        assert_eq!(tls.ws_url(), "wss://h:443/ws");
        assert_eq!(tls.http_base(), "https://h:443");
    }
}
