//! # vsm-settings
//!
//! Layered configuration for the runtime:
//! 1. **Compiled defaults** ([`VsmSettings::default()`])
//! 2. **User file** (`~/.vsm/settings.json`, deep-merged over defaults)
//! 3. **Environment** (`VSM_*` overrides, highest priority)
//!
//! Settings are loaded once by the binary and handed to each consumer.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
