//! Error type definitions for the scale store
//!
//! Errors are layered: substrate and scaler failures have their own enums
//! which convert into the top-level [`ScaleError`] surfaced to callers.

use thiserror::Error;

/// Top-level error type returned by the scale store
#[derive(Error, Debug)]
pub enum ScaleError {
    /// The scaling function failed; no partial state was committed
    #[error("Scale generation error: {0}")]
    Generation(#[from] ScaleGenerationError),

    /// The persistence substrate failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Failures of the external scaling function
#[derive(Error, Debug)]
pub enum ScaleGenerationError {
    /// Parameters the scaler cannot honour (e.g. no target dimensions)
    #[error("Invalid scaling parameters: {message}")]
    InvalidParameters { message: String },

    /// Original image bytes could not be decoded
    #[error("Failed to decode original image: {0}")]
    Decode(String),

    /// Scaled image could not be encoded
    #[error("Failed to encode scaled image: {0}")]
    Encode(String),

    /// The blocking scaling task panicked or was cancelled
    #[error("Scaling task failed: {0}")]
    Task(String),
}

/// Failures of the blob persistence substrate
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key rejected by the substrate's validation
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Stored blob could not be interpreted
    #[error("Corrupt blob {key:?}: {message}")]
    Corrupt { key: String, message: String },
}

/// An index entry for these exact parameters already exists
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Scale parameters already indexed: {fingerprint}")]
pub struct DuplicateParametersError {
    pub fingerprint: String,
}

impl ScaleError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error came from the scaling function
    pub fn is_generation(&self) -> bool {
        matches!(self, Self::Generation(_))
    }
}

impl ScaleGenerationError {
    /// Create an invalid parameters error
    pub fn invalid_parameters<S: Into<String>>(message: S) -> Self {
        Self::InvalidParameters {
            message: message.into(),
        }
    }
}

impl PersistenceError {
    /// Create an invalid key error
    pub fn invalid_key<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt blob error
    pub fn corrupt<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }
}
