use thiserror::Error;

/// Unified error type for the entire Procession library
#[derive(Debug, Error)]
pub enum ProcessionError {
    /// A called-element expression could not be evaluated against the
    /// supplied variables
    #[error("Failed to resolve expression '{expression}' on call activity '{call_activity_id}': {message}")]
    ExpressionResolution {
        expression: String,
        call_activity_id: String,
        message: String,
    },

    /// The referenced process definition does not exist in the catalog
    #[error("No process definition found for key '{key}'{}", .version.map(|v| format!(" version {}", v)).unwrap_or_default())]
    DefinitionNotFound { key: String, version: Option<i32> },

    /// The named activity does not exist in the resolved definition
    #[error("Activity '{activity_id}' does not exist in process definition '{definition_id}'")]
    ActivityNotFound {
        activity_id: String,
        definition_id: String,
    },

    /// No leaf execution currently sits at the stated source activity
    #[error("No active execution found at activity '{activity_id}' in process instance '{instance_id}'")]
    SourceTokenNotFound {
        activity_id: String,
        instance_id: String,
    },

    /// The post-mutation concurrency self-check failed; fatal, never
    /// user-recoverable
    #[error("Internal consistency violation: {message}")]
    InternalConsistency {
        message: String,
        instance_id: Option<String>,
    },

    /// Request/input validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Concurrency errors (lock acquisition, queue backpressure)
    #[error("Concurrency error: {operation}")]
    Concurrency {
        operation: String,
        timeout_ms: Option<u64>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProcessionError {
    /// Create an expression resolution error
    pub fn expression_resolution<E, C, M>(expression: E, call_activity_id: C, message: M) -> Self
    where
        E: Into<String>,
        C: Into<String>,
        M: Into<String>,
    {
        Self::ExpressionResolution {
            expression: expression.into(),
            call_activity_id: call_activity_id.into(),
            message: message.into(),
        }
    }

    /// Create a definition-not-found error for the latest version of a key
    pub fn definition_not_found<K: Into<String>>(key: K) -> Self {
        Self::DefinitionNotFound {
            key: key.into(),
            version: None,
        }
    }

    /// Create a definition-not-found error for a pinned version
    pub fn definition_version_not_found<K: Into<String>>(key: K, version: i32) -> Self {
        Self::DefinitionNotFound {
            key: key.into(),
            version: Some(version),
        }
    }

    /// Create an activity-not-found error
    pub fn activity_not_found<A: Into<String>, D: Into<String>>(
        activity_id: A,
        definition_id: D,
    ) -> Self {
        Self::ActivityNotFound {
            activity_id: activity_id.into(),
            definition_id: definition_id.into(),
        }
    }

    /// Create a source-token-not-found error
    pub fn source_token_not_found<A: Into<String>, I: Into<String>>(
        activity_id: A,
        instance_id: I,
    ) -> Self {
        Self::SourceTokenNotFound {
            activity_id: activity_id.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Create an internal consistency violation
    pub fn internal_consistency<M: Into<String>>(message: M) -> Self {
        Self::InternalConsistency {
            message: message.into(),
            instance_id: None,
        }
    }

    /// Create an internal consistency violation scoped to an instance
    pub fn internal_consistency_in<M: Into<String>, I: Into<String>>(
        message: M,
        instance_id: I,
    ) -> Self {
        Self::InternalConsistency {
            message: message.into(),
            instance_id: Some(instance_id.into()),
        }
    }

    /// Create a validation error
    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<M: Into<String>, F: Into<String>>(message: M, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration<M: Into<String>>(message: M) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a serialization error
    pub fn serialization<F, E>(format: F, source: E) -> Self
    where
        F: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<O: Into<String>>(operation: O, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a concurrency error
    pub fn concurrency<O: Into<String>>(operation: O) -> Self {
        Self::Concurrency {
            operation: operation.into(),
            timeout_ms: None,
        }
    }

    /// Create a concurrency error that hit a timeout
    pub fn concurrency_timeout<O: Into<String>>(operation: O, timeout_ms: u64) -> Self {
        Self::Concurrency {
            operation: operation.into(),
            timeout_ms: Some(timeout_ms),
        }
    }

    /// Create an internal error
    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is recoverable by resubmitting a corrected request
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ExpressionResolution { .. }
            | Self::DefinitionNotFound { .. }
            | Self::ActivityNotFound { .. }
            | Self::SourceTokenNotFound { .. }
            | Self::Validation { .. } => true,
            Self::Concurrency { .. } => true,
            Self::InternalConsistency { .. } => false,
            Self::Configuration { .. } => false,
            _ => false,
        }
    }

    /// Fatal errors abort the surrounding transaction and must never be
    /// retried automatically
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalConsistency { .. })
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ExpressionResolution { .. } => "expression",
            Self::DefinitionNotFound { .. } => "definition",
            Self::ActivityNotFound { .. } => "activity",
            Self::SourceTokenNotFound { .. } => "source_token",
            Self::InternalConsistency { .. } => "consistency",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Concurrency { .. } => "concurrency",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ProcessionError>;

/// Convert from common error types
impl From<std::io::Error> for ProcessionError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ProcessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ProcessionError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
