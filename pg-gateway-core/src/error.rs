use thiserror::Error;

/// The closed error taxonomy every pipeline stage maps into.
///
/// Every variant carries exactly the fields needed to build the wire-level
/// error response (`message`, `suggestion`, `sql`, `validation_details`).
/// Nothing below the pipeline boundary is allowed to leak a foreign error
/// type past this enum.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("unknown database: {message}")]
    UnknownDatabase {
        message: String,
        suggestion: Option<String>,
    },

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
        suggestion: Option<String>,
    },

    #[error("schema not loaded: {message}")]
    SchemaNotLoaded {
        message: String,
        suggestion: Option<String>,
    },

    #[error("draft failed: {message}")]
    AiDraftFailed {
        message: String,
        suggestion: Option<String>,
    },

    #[error("draft empty: {message}")]
    AiDraftEmpty {
        message: String,
        suggestion: Option<String>,
    },

    #[error("sql validation failed: {message}")]
    SqlValidationFailed {
        message: String,
        sql: String,
        suggestion: Option<String>,
    },

    #[error("access denied: {message}")]
    AccessDenied {
        message: String,
        sql: Option<String>,
        validation_details: Option<String>,
        suggestion: Option<String>,
    },

    #[error("execution failed: {message}")]
    ExecutionFailed {
        message: String,
        sql: String,
        suggestion: Option<String>,
    },

    #[error("query timeout: {message}")]
    QueryTimeout {
        message: String,
        suggestion: Option<String>,
    },

    #[error("result implausible: {message}")]
    ResultImplausible {
        message: String,
        sql: String,
        reason: Option<String>,
        suggestion: Option<String>,
    },

    #[error("internal error: {message}")]
    InternalError {
        message: String,
        suggestion: Option<String>,
    },
}

impl GatewayError {
    /// The `kind-string` identifier used in wire responses and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownDatabase { .. } => "unknown-database",
            Self::RateLimited { .. } => "rate-limited",
            Self::SchemaNotLoaded { .. } => "schema-not-loaded",
            Self::AiDraftFailed { .. } => "ai-draft-failed",
            Self::AiDraftEmpty { .. } => "ai-draft-empty",
            Self::SqlValidationFailed { .. } => "sql-validation-failed",
            Self::AccessDenied { .. } => "access-denied",
            Self::ExecutionFailed { .. } => "execution-failed",
            Self::QueryTimeout { .. } => "query-timeout",
            Self::ResultImplausible { .. } => "result-implausible",
            Self::InternalError { .. } => "internal-error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::UnknownDatabase { message }
            | Self::SchemaNotLoaded { message }
            | Self::AiDraftFailed { message }
            | Self::AiDraftEmpty { message }
            | Self::QueryTimeout { message }
            | Self::InternalError { message } => message,
            Self::RateLimited { message, .. } => message,
            Self::SqlValidationFailed { message, .. } => message,
            Self::AccessDenied { message, .. } => message,
            Self::ExecutionFailed { message, .. } => message,
            Self::ResultImplausible { message, .. } => message,
        }
    }

    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::SqlValidationFailed { sql, .. } => Some(sql),
            Self::AccessDenied { sql, .. } => sql.as_deref(),
            Self::ExecutionFailed { sql, .. } => Some(sql),
            Self::ResultImplausible { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// The optional remediation hint surfaced in wire responses, mirroring
    /// `query_processor.py`'s per-branch `suggestion=` text.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::UnknownDatabase { suggestion, .. }
            | Self::RateLimited { suggestion, .. }
            | Self::SchemaNotLoaded { suggestion, .. }
            | Self::AiDraftFailed { suggestion, .. }
            | Self::AiDraftEmpty { suggestion, .. }
            | Self::SqlValidationFailed { suggestion, .. }
            | Self::AccessDenied { suggestion, .. }
            | Self::ExecutionFailed { suggestion, .. }
            | Self::QueryTimeout { suggestion, .. }
            | Self::ResultImplausible { suggestion, .. }
            | Self::InternalError { suggestion, .. } => suggestion.as_deref(),
        }
    }

    /// Extra diagnostic detail beyond `message`: the failing `EXPLAIN` plan
    /// line for `AccessDenied`'s cost gate, or the sanity oracle's stated
    /// reason for `ResultImplausible`.
    pub fn validation_details(&self) -> Option<&str> {
        match self {
            Self::AccessDenied { validation_details, .. } => validation_details.as_deref(),
            Self::ResultImplausible { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    pub fn unknown_database(name: &str, known: &[String]) -> Self {
        Self::UnknownDatabase {
            message: format!("database '{name}' is not registered (known: {known:?})"),
            suggestion: Some(format!(
                "Check the 'databases' list for a valid name; known databases: {known:?}"
            )),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
            suggestion: Some("Please contact the system administrator".to_string()),
        }
    }

    /// HTTP status code per spec.md §6's mapping table, used only by the
    /// server crate's transport layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::SqlValidationFailed { .. } | Self::AccessDenied { .. } => 400,
            Self::UnknownDatabase { .. } => 404,
            Self::QueryTimeout { .. } => 408,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_database_carries_a_suggestion() {
        let err = GatewayError::unknown_database("ghost", &["alpha".to_string()]);
        assert!(err.suggestion().unwrap().contains("alpha"));
    }

    #[test]
    fn validation_details_surfaces_only_for_access_denied_and_result_implausible() {
        let denied = GatewayError::AccessDenied {
            message: "blocked".to_string(),
            sql: None,
            validation_details: Some("cost=0..500".to_string()),
            suggestion: None,
        };
        assert_eq!(denied.validation_details(), Some("cost=0..500"));

        let timeout = GatewayError::QueryTimeout {
            message: "slow".to_string(),
            suggestion: None,
        };
        assert_eq!(timeout.validation_details(), None);
    }
}
