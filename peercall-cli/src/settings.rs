//! Settings file handling
//!
//! Settings live in a JSON file under the platform config directory unless
//! `--config` points elsewhere. Command-line flags and `PEERCALL_*` variables
//! override whatever the file says.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use peercall_core::{CallManagerConfig, MediaPreferences, ServiceConfig, TransportConfig, UserId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "settings.json";

/// Effective client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Our user id on the chat server
    pub user: Option<String>,
    /// Signaling server base URL
    pub server: String,
    /// Auth token for the socket.io connect packet
    pub token: Option<String>,
    /// Handshake limit in milliseconds
    pub connect_timeout_ms: u64,
    /// Media offered when calling without `--audio`/`--video`
    pub default_media: MediaPreferences,
    /// Call manager tuning
    pub call: CallManagerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user: None,
            server: "http://localhost:3000".to_string(),
            token: None,
            connect_timeout_ms: 10_000,
            default_media: MediaPreferences::default(),
            call: CallManagerConfig::default(),
        }
    }
}

impl Settings {
    /// `settings.json` in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "peercall", "peercall")
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Load settings
    ///
    /// An explicit path must exist. The default path is optional and falls
    /// back to built-in defaults when absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::read(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::read(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing settings in {}", path.display()))
    }

    /// Write settings as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }

    /// Apply command-line / environment overrides
    pub fn apply_overrides(
        &mut self,
        user: Option<String>,
        server: Option<String>,
        token: Option<String>,
    ) {
        if user.is_some() {
            self.user = user;
        }
        if let Some(server) = server {
            self.server = server;
        }
        if token.is_some() {
            self.token = token;
        }
    }

    /// Parsed local user id
    pub fn user_id(&self) -> Result<UserId> {
        let Some(raw) = self.user.as_deref() else {
            bail!("no user id configured; pass --user or set PEERCALL_USER");
        };
        raw.parse::<UserId>()
            .with_context(|| format!("invalid user id {raw:?}"))
    }

    /// Transport configuration for the signaling server
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.server.clone(),
            token: self.token.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    /// Call service configuration
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            default_media: self.default_media,
            call_config: self.call.clone(),
        }
    }
}
