use thiserror::Error;

/// Canonical ktable error taxonomy used across crates.
///
/// Classification guidance:
/// - [`KtableError::Parse`]: malformed query text or OQS document, never retried
/// - [`KtableError::Compile`]: well-formed tree with an unsupported operator/type/column
/// - [`KtableError::NotFound`]: missing table, schema or blob on the server
/// - [`KtableError::Transport`]: transient network/5xx failures (retried only by select paging)
/// - [`KtableError::Server`]: the server aborted the operation (batch-stream `error` signal)
/// - [`KtableError::Cache`]: local cache IO, downgraded to a miss by the blob path
#[derive(Debug, Error)]
pub enum KtableError {
    /// Query text or OQS document could not be parsed.
    ///
    /// `at` holds the offending excerpt with a caret under the failing position.
    #[error("parse error: {message}\n{at}")]
    Parse {
        /// What the parser expected or found.
        message: String,
        /// Excerpt of the input around the failure.
        at: String,
    },

    /// Valid expression tree that cannot be lowered or rewritten.
    ///
    /// Examples:
    /// - `intersects` on a non-geometry column
    /// - arithmetic between a string and a number
    /// - unknown function or column
    #[error("compile error: {0}")]
    Compile(String),

    /// Missing table, schema or blob.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure or 5xx response; safe to retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error signaled by the server, either in-stream or as a 4xx response.
    #[error("server error: {0}")]
    Server(String),

    /// Local cache failure (disk full, permissions, corrupt entry).
    #[error("cache error: {0}")]
    Cache(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Caller violated an API contract.
    ///
    /// Examples:
    /// - `replace` without a query
    /// - value longer than a non-big column allows
    /// - transaction used after commit
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Arrow kernel, IPC or JSON conversion failures at runtime.
    #[error("execution error: {0}")]
    Execution(String),

    /// Valid request for a shape not implemented in this client.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KtableError {
    /// Returns true when the failure is worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, KtableError::Transport(_))
    }

    /// Returns true for missing table/schema/blob.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, KtableError::NotFound(_))
    }
}

/// Standard ktable result alias.
pub type Result<T> = std::result::Result<T, KtableError>;

#[cfg(test)]
mod tests {
    use super::KtableError;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(KtableError::Transport("503".to_string()).is_transient());
        assert!(!KtableError::Server("boom".to_string()).is_transient());
        assert!(!KtableError::NotFound("t".to_string()).is_transient());
    }

    #[test]
    fn parse_error_renders_excerpt() {
        let err = KtableError::Parse {
            message: "unexpected token".to_string(),
            at: "a == \n     ^".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("unexpected token"));
        assert!(msg.contains('^'));
    }
}
