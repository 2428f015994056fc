//! # roomcast-settings
//!
//! Server configuration loaded from three layers (in priority order):
//!
//! 1. **Compiled defaults**: [`ServerSettings::default()`]
//! 2. **Settings file**: `~/.roomcast/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `ROOMCAST_*` overrides
//!
//! [`ServerSettings::validate`] enforces the rules the server checks before it
//! binds, most importantly that `secure` mode names both TLS files.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::ServerSettings;
