//! Process-wide configuration, read once at startup from
//! `<config dir>/config.json`.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

pub const CONFIG_FILE: &str = "config.json";

/// Subdirectory of the config dir holding profiles and libraries.
pub const DATABASE_DIR: &str = "database";

pub const DEFAULT_OPENRGB_PORT: u16 = 6743;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub config_path: PathBuf,
    pub debug: bool,
    /// Disables the speed controller; duties stay where they were.
    pub manual: bool,
    /// Speed profiles interpolate curves instead of looking up bands.
    pub graph_profiles: bool,
    #[serde(rename = "enableOpenRgbTargetServer")]
    pub enable_openrgb_target_server: bool,
    pub listen_address: String,
    #[serde(rename = "openRgbPort")]
    pub openrgb_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: default_config_dir(),
            debug: false,
            manual: false,
            graph_profiles: false,
            enable_openrgb_target_server: false,
            listen_address: "127.0.0.1".to_string(),
            openrgb_port: DEFAULT_OPENRGB_PORT,
        }
    }
}

/// `$XDG_CONFIG_HOME/open-link-hub`, falling back to `~/.config` and then
/// `/etc`.
pub fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join("open-link-hub");
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home).join(".config").join("open-link-hub");
    }
    PathBuf::from("/etc/open-link-hub")
}

impl Config {
    /// Load `<dir>/config.json`. A missing file yields the defaults; the
    /// returned config always points at `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let mut config = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<Config>(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config unreadable");
                return Err(e.into());
            }
        };
        config.config_path = dir.to_path_buf();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.config_path)?;
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        fs::write(self.config_path.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Root of the profile store.
    pub fn database_dir(&self) -> PathBuf {
        self.config_path.join(DATABASE_DIR)
    }
}
