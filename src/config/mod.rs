//! Configuration and identity storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::call::noise::NoiseGateOptions;

fn default_relay_url() -> String {
    "wss://relay.kaiwa.app/rt".to_string()
}

fn default_rendezvous_url() -> String {
    "https://peers.kaiwa.app".to_string()
}

fn default_rendezvous_key() -> String {
    "kaiwa".to_string()
}

fn default_true() -> bool {
    true
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Participant id on the platform (set by `init`)
    pub user_id: Option<String>,
    /// Name shown to counterparts
    pub display_name: Option<String>,
    /// Realtime relay endpoint (signaling)
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Peer rendezvous service base URL
    #[serde(default = "default_rendezvous_url")]
    pub rendezvous_url: String,
    /// Rendezvous API key
    #[serde(default = "default_rendezvous_key")]
    pub rendezvous_key: String,
    /// Apply the noise gate to captured audio
    #[serde(default = "default_true")]
    pub noise_reduction: bool,
    /// Noise gate tuning
    #[serde(default)]
    pub noise_gate: NoiseGateOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: None,
            display_name: None,
            relay_url: default_relay_url(),
            rendezvous_url: default_rendezvous_url(),
            rendezvous_key: default_rendezvous_key(),
            noise_reduction: true,
            noise_gate: NoiseGateOptions::default(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("app", "kaiwa", "kaiwa-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Config holds the participant identity — keep it private.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// The configured identity, or an instruction to run `init`.
    pub fn identity(&self) -> Result<(String, String)> {
        let user = self
            .user_id
            .clone()
            .context("No identity configured. Run `kaiwa-cli init --user <id>` first.")?;
        let display = self.display_name.clone().unwrap_or_else(|| user.clone());
        Ok((user, display))
    }
}
