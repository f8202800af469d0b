//! Error types for the voice core

use thiserror::Error;

/// Result type alias for voice core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio subsystem or background worker could not be created
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Microphone access denied or unavailable
    #[error("permission error: {0}")]
    Permission(String),

    /// Transient audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Durable cache store read/write failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Eviction removed more or fewer entries than its trigger required
    #[error("eviction invariant violated: {0}")]
    EvictionInvariant(String),

    /// Database pool error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
