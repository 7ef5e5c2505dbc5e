// src/error.rs

use thiserror::Error;

/// Core error types for pkgtx
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Package record (de)serialization errors
    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Malformed or unsupported package file
    #[error("Package format error: {0}")]
    PackageFormat(String),

    /// Payload extraction failed
    #[error("Archive error on {path}: {message}")]
    Archive { path: String, message: String },

    /// A scriptlet could not be run or exited unsuccessfully
    #[error("{name} scriptlet failed: {message}")]
    Scriptlet { name: String, message: String },

    /// Transaction-level failure (sanity problems, aborted run)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Rollback transaction could not be assembled or run
    #[error("Rollback error: {0}")]
    Rollback(String),

    /// Relocation request that cannot be honored
    #[error("Relocation error: {0}")]
    Relocation(String),
}

impl Error {
    /// Build an archive error for a path
    pub fn archive(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Archive {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a scriptlet error
    pub fn scriptlet(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Scriptlet {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using pkgtx's Error type
pub type Result<T> = std::result::Result<T, Error>;
