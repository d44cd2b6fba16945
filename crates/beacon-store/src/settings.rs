use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use beacon_core::BeaconConfig;

use crate::error::{Result, StoreError};

/// Read `beacon.toml`. A missing file means defaults; a present but invalid
/// file is an error rather than a silent fallback.
pub fn load_config(path: &Path) -> Result<BeaconConfig> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(BeaconConfig::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: BeaconConfig = toml::from_str(&text)
        .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
    config
        .validate()
        .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
    Ok(config)
}

/// The effective configuration as TOML, for `beacon config`.
pub fn render_config(config: &BeaconConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| StoreError::Config(e.to_string()))
}
