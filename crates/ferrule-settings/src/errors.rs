//! Settings error types.

use thiserror::Error;

/// Errors that can occur when resolving or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to (de)serialize settings JSON.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., zero pool size).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
