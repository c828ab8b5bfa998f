use ulid::Ulid;

use crate::source::SourceError;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed date, non-positive duration, or a duration longer than the
    /// business day. Raised before the cache or any source is touched.
    InvalidQuery(String),
    /// Booking or service data could not be read. Never treated as "no conflicts".
    DataSourceUnavailable(String),
    ServiceNotFound(Ulid),
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Stable code used in wire replies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidQuery(_) => "invalid_query",
            EngineError::DataSourceUnavailable(_) => "data_source_unavailable",
            EngineError::ServiceNotFound(_) => "service_not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl From<SourceError> for EngineError {
    fn from(e: SourceError) -> Self {
        EngineError::DataSourceUnavailable(e.to_string())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidQuery(msg) => write!(f, "invalid query: {msg}"),
            EngineError::DataSourceUnavailable(msg) => {
                write!(f, "data source unavailable: {msg}")
            }
            EngineError::ServiceNotFound(id) => write!(f, "service not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
