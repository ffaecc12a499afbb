use std::path::{Path, PathBuf};

use crate::models::settings::CoreSettings;

const CONFIG_FILE: &str = "settings.json";

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("crescendo"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE)
}

/// Loads settings, falling back to defaults on a missing or unreadable
/// file — a broken config must never keep the player from starting.
pub fn load_settings(path: &Path) -> CoreSettings {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return CoreSettings::default(),
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "ignoring malformed settings file");
        CoreSettings::default()
    })
}

pub fn save_settings(path: &Path, settings: &CoreSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, raw)?;
    Ok(())
}
