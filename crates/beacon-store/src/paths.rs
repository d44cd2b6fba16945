use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::error::{Result, StoreError};

pub const DATA_DIR_ENV: &str = "BEACON_DATA_DIR";
pub const DATABASE_FILE: &str = "queue.db";
pub const CONFIG_FILE: &str = "beacon.toml";

/// `~/.beacon`, falling back to the working directory when no home is set.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".beacon")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Explicit override, then `BEACON_DATA_DIR`, then the default.
pub fn resolve_base_dir(explicit: Option<&Path>) -> PathBuf {
    pick_base_dir(explicit, env::var_os(DATA_DIR_ENV).map(PathBuf::from))
}

fn pick_base_dir(explicit: Option<&Path>, from_env: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    match from_env {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => default_base_dir(),
    }
}

/// Create the data directory if it does not exist yet.
pub fn ensure_base_dir(base: &Path) -> Result<()> {
    fs::create_dir_all(base).map_err(|e| {
        StoreError::InvalidData(format!("failed to create {}: {e}", base.display()))
    })
}

pub fn database_path(base: &Path) -> PathBuf {
    base.join(DATABASE_FILE)
}

pub fn config_path(base: &Path) -> PathBuf {
    base.join(CONFIG_FILE)
}
