//! Host directory resolution for uefi-vmtest.
//!
//! Only two locations are persistent: the user config file and the log
//! directory. Everything a run touches lives in temporary directories owned
//! by that run.
//!
//! - Config: `$XDG_CONFIG_HOME/uefi-vmtest/vmtest.toml` or `~/.config/uefi-vmtest/`
//! - Logs:   `$XDG_STATE_HOME/uefi-vmtest/` or `~/.local/state/uefi-vmtest/`

use std::path::{Path, PathBuf};

const APP_NAME: &str = "uefi-vmtest";

/// Resolved user config file path. Does not check that it exists.
pub fn config_file() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok().map(PathBuf::from)?;
    Some(resolve_config_dir(&home).join(crate::config::CONFIG_FILE))
}

/// Directory for the optional file log.
pub fn log_dir() -> Option<PathBuf> {
    if let Ok(state) = std::env::var("XDG_STATE_HOME") {
        return Some(PathBuf::from(state).join(APP_NAME));
    }
    let home = std::env::var("HOME").ok().map(PathBuf::from)?;
    Some(home.join(".local").join("state").join(APP_NAME))
}

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}
