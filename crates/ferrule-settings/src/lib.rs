//! # ferrule-settings
//!
//! Configuration for the ferrule client runtime.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **Caller-supplied JSON**: deep-merged over defaults ([`settings_from_json`])
//! 3. **Environment variables**: `FERRULE_*` overrides (highest priority)
//!
//! Reading configuration files is left to the embedding application.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, apply_overrides, deep_merge, load_settings, settings_from_json};
pub use types::{ClientSettings, ContainerSettings, ThreadPoolConfig};
