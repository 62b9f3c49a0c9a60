//! Realm error types
//!
//! Error definitions with transient/permanent classification for the
//! retry-once policy applied by the authentication orchestrator.

use thiserror::Error;

/// Error that can occur during realm operations.
#[derive(Debug, Error)]
pub enum RealmError {
    // Configuration errors (permanent, fatal at configuration time)
    /// Realm configuration is invalid.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    // Connection errors
    /// Failed to open a connection to the directory server.
    #[error("directory connect failed: {message}")]
    ConnectFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Directory errors (transient, retried once)
    /// A directory operation failed after the connection was established.
    #[error("directory operation failed: {message}")]
    Directory {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The directory returned a partial result set and AD compatibility
    /// mode is disabled.
    #[error("directory returned a partial result set")]
    PartialResult,

    // Authentication-class directory errors (permanent)
    /// The directory rejected the bound identity for this operation.
    #[error("directory rejected credentials: {message}")]
    AuthenticationRejected { message: String },

    /// A distinguished name could not be parsed or composed.
    #[error("invalid distinguished name: {name}")]
    InvalidName { name: String },

    /// The configured driver does not support the requested operation.
    #[error("unsupported operation: {message}")]
    Unsupported { message: String },
}

impl RealmError {
    /// Check if this error is transient and the whole resolve/verify/role
    /// sequence should be retried once on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RealmError::Directory { .. } | RealmError::PartialResult
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            RealmError::Configuration { .. } => "INVALID_CONFIG",
            RealmError::ConnectFailed { .. } => "CONNECT_FAILED",
            RealmError::Directory { .. } => "DIRECTORY_ERROR",
            RealmError::PartialResult => "PARTIAL_RESULT",
            RealmError::AuthenticationRejected { .. } => "AUTH_REJECTED",
            RealmError::InvalidName { .. } => "INVALID_NAME",
            RealmError::Unsupported { .. } => "UNSUPPORTED",
        }
    }

    // Convenience constructors

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        RealmError::Configuration {
            message: message.into(),
        }
    }

    /// Create a connect failed error.
    pub fn connect_failed(message: impl Into<String>) -> Self {
        RealmError::ConnectFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connect failed error with source.
    pub fn connect_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RealmError::ConnectFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a directory error.
    pub fn directory(message: impl Into<String>) -> Self {
        RealmError::Directory {
            message: message.into(),
            source: None,
        }
    }

    /// Create a directory error with source.
    pub fn directory_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RealmError::Directory {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication rejected error.
    pub fn auth_rejected(message: impl Into<String>) -> Self {
        RealmError::AuthenticationRejected {
            message: message.into(),
        }
    }

    /// Create an invalid name error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        RealmError::InvalidName { name: name.into() }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        RealmError::Unsupported {
            message: message.into(),
        }
    }
}

/// Result type for realm operations.
pub type RealmResult<T> = Result<T, RealmError>;
