// src/error.rs

//! Unified error handling for the catalog crawler and mirror distributor.

use std::fmt;

use thiserror::Error;

/// Result type alias for pilgrim operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Scan range is empty, inverted or negative
    #[error("Invalid scan range [{start}, {end}): start must be >= 0 and below end")]
    InvalidRange { start: i64, end: i64 },

    /// Explicit folder policy leaves a folder without a destination
    #[error("Folder range policy does not cover folder {folder}")]
    PolicyGap { folder: u32 },

    /// Explicit folder policy assigns a folder to two ranges
    #[error("Folder range policy overlaps at folder {folder}: {first} and {second}")]
    PolicyOverlap {
        folder: u32,
        first: String,
        second: String,
    },

    /// Another run owns the store
    #[error("Run lock {path} is held (age {age_secs}s); another run is in progress")]
    LockHeld { path: String, age_secs: u64 },

    /// Catalog lookup failed in a way worth retrying
    #[error("Transient fetch error for id {id}: {message}")]
    TransientFetch { id: u64, message: String },

    /// Catalog lookup failed permanently
    #[error("Fetch error for id {id}: {message}")]
    Fetch { id: u64, message: String },

    /// Pushing to a single mirror destination failed
    #[error("Push to destination {destination} failed: {message}")]
    DestinationPush {
        destination: String,
        message: String,
    },

    /// A git invocation failed
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a retryable fetch error.
    pub fn transient(id: u64, message: impl fmt::Display) -> Self {
        Self::TransientFetch {
            id,
            message: message.to_string(),
        }
    }

    /// Create a non-retryable fetch error.
    pub fn fetch(id: u64, message: impl fmt::Display) -> Self {
        Self::Fetch {
            id,
            message: message.to_string(),
        }
    }

    /// Create a per-destination push error.
    pub fn push(destination: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::DestinationPush {
            destination: destination.into(),
            message: message.to_string(),
        }
    }

    /// Create a git command error.
    pub fn git(command: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Git {
            command: command.into(),
            message: message.to_string(),
        }
    }

    /// Whether a catalog lookup that produced this error should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientFetch { .. } => true,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.is_body()
                    || e.is_decode()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            Self::Json(_) => true,
            _ => false,
        }
    }

    /// Whether this error means another run owns the store.
    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }

    /// Bad input detected before the store was touched.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Self::InvalidRange { .. }
                | Self::PolicyGap { .. }
                | Self::PolicyOverlap { .. }
                | Self::Config(_)
                | Self::Validation(_)
                | Self::Toml(_)
                | Self::Url(_)
        )
    }
}
