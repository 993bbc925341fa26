//! # tailweb-settings
//!
//! Layered configuration for tailweb.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TailwebSettings::default()`]
//! 2. **User file**: `~/.tailweb/settings.json` or `--config` (deep-merged over defaults)
//! 3. **Environment variables**: `TAILWEB_*` overrides
//!
//! The binary layers CLI flags on top and then calls
//! [`TailwebSettings::validate`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::{HubSettings, LoggingSettings, ServerSettings, TailSettings, TailwebSettings};
