use crate::hybrid_store::WriteReport;
use thiserror::Error;

/// Failure reported by a single backend adapter.
///
/// A missing value is never an `AdapterError`; adapters encode it as a `NotFound` row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Transient failure talking to the backend. The caller may retry the whole call.
    #[error("connection error: {0}")]
    Connection(String),
    /// Stored or submitted data does not match what the backend expects.
    #[error("schema error: {0}")]
    Schema(String),
}

impl AdapterError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sqlx::Error> for AdapterError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => Self::Connection(err.to_string()),
            other => Self::Schema(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for AdapterError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            Self::Connection(err.to_string())
        } else {
            Self::Schema(err.to_string())
        }
    }
}

impl From<prost::DecodeError> for AdapterError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Schema(format!("failed to decode stored value: {}", err))
    }
}

/// Errors surfaced by the hybrid store facade and its collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "no backend is bound to feature views [{}] and no default backend is configured",
        .views.join(", ")
    )]
    UnroutableViews { views: Vec<String> },

    #[error("backend '{name}' is not registered")]
    UnknownBackend { name: String },

    #[error("backend '{name}' is already registered")]
    DuplicateBackend { name: String },

    #[error("backend '{name}' has been closed")]
    BackendClosed { name: String },

    #[error("backend '{backend}' failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: AdapterError,
    },

    #[error("schema mismatch: {}", .problems.join("; "))]
    Schema { problems: Vec<String> },

    #[error("write failed on backends [{}]", .0.describe_failures())]
    PartialWrite(WriteReport),

    #[error("teardown failed on backends: {}", describe_teardown(.failures))]
    Teardown { failures: Vec<(String, AdapterError)> },

    #[error("invalid configuration: {}", .problems.join("; "))]
    Config { problems: Vec<String> },
}

fn describe_teardown(failures: &[(String, AdapterError)]) -> String {
    failures
        .iter()
        .map(|(backend, err)| format!("{}: {}", backend, err))
        .collect::<Vec<_>>()
        .join(", ")
}

impl StoreError {
    pub fn unroutable(mut views: Vec<String>) -> Self {
        views.sort();
        views.dedup();
        Self::UnroutableViews { views }
    }

    pub fn unknown_backend(name: impl Into<String>) -> Self {
        Self::UnknownBackend { name: name.into() }
    }

    pub fn backend(backend: impl Into<String>, source: AdapterError) -> Self {
        Self::Backend {
            backend: backend.into(),
            source,
        }
    }

    /// Whether retrying the same call may succeed without a configuration change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { source, .. } => source.is_retryable(),
            Self::PartialWrite(report) => report
                .failed()
                .all(|outcome| outcome.error.as_ref().is_some_and(AdapterError::is_retryable)),
            _ => false,
        }
    }

    pub fn is_configuration_defect(&self) -> bool {
        matches!(
            self,
            Self::UnroutableViews { .. }
                | Self::UnknownBackend { .. }
                | Self::DuplicateBackend { .. }
                | Self::Config { .. }
        )
    }
}
