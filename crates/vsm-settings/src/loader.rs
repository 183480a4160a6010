use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{Framing, VsmSettings};

/// `~/.vsm/settings.json`, falling back to `/tmp` when `HOME` is unset.
pub fn settings_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".vsm")
        .join("settings.json")
}

/// Defaults, then the user file, then `VSM_*` environment overrides.
pub fn load_settings() -> Result<VsmSettings> {
    load_settings_from_path(&settings_path())
}

pub fn load_settings_from_path(path: &Path) -> Result<VsmSettings> {
    let mut settings = load_file_over_defaults(path)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Deep-merge the file at `path` over compiled defaults. A missing file
/// yields the defaults.
pub fn load_file_over_defaults(path: &Path) -> Result<VsmSettings> {
    let defaults = serde_json::to_value(VsmSettings::default())?;
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no settings file, using defaults");
            return Ok(serde_json::from_value(defaults)?);
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let overlay: Value = serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_value(deep_merge(defaults, overlay))?)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// scalars and arrays in `overlay` replace.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Apply `VSM_*` overrides read through `lookup`.
pub fn apply_env_overrides(settings: &mut VsmSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(family) = lookup("VSM_PROVIDER") {
        settings.provider.family = family;
    }
    if let Some(model) = lookup("VSM_MODEL") {
        settings.provider.model = model;
    }
    if let Some(url) = lookup("VSM_BASE_URL") {
        settings.provider.base_url = Some(url);
    }
    if let Some(level) = lookup("VSM_LOG") {
        settings.logging.level = level;
    }
    if lookup("VSM_MCP_LSP").as_deref() == Some("1") {
        settings.mcp.framing = Framing::ContentLength;
    }
    if lookup("VSM_MCP_DEBUG").as_deref() == Some("1") {
        settings.mcp.debug = true;
    }
}
