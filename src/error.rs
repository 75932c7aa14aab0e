use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Scanner,
    RowLock,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Scanner => write!(f, "scanner"),
            SessionKind::RowLock => write!(f, "row lock"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotServingRegion,
    InvalidRequest,
    RowBusy,
    UnknownSession,
    Interrupted,
    ExecutionFailure,
    TypeMismatch,
    Io,
    Encode,
    Decode,
    Corruption,
    Cancelled,
    InvalidConfig,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotServingRegion => "not_serving_region",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::RowBusy => "row_busy",
            ErrorCode::UnknownSession => "unknown_session",
            ErrorCode::Interrupted => "interrupted",
            ErrorCode::ExecutionFailure => "execution_failure",
            ErrorCode::TypeMismatch => "type_mismatch",
            ErrorCode::Io => "io",
            ErrorCode::Encode => "encode",
            ErrorCode::Decode => "decode",
            ErrorCode::Corruption => "corruption",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Debug, Error)]
pub enum RegionServerError {
    #[error("region '{region}' is not served by this server")]
    NotServingRegion { region: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("row {row} in region '{region}' is locked")]
    RowBusy { region: String, row: String },
    #[error("unknown {kind} id {id}")]
    UnknownSession { kind: SessionKind, id: u64 },
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error("task '{task}' failed: {source}")]
    ExecutionFailure {
        task: String,
        #[source]
        source: Box<RegionServerError>,
    },
    #[error("type mismatch at {row}/{column}: expected {expected}-byte value, found {actual} bytes")]
    TypeMismatch {
        row: String,
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
}

impl RegionServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegionServerError::NotServingRegion { .. } => ErrorCode::NotServingRegion,
            RegionServerError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            RegionServerError::RowBusy { .. } => ErrorCode::RowBusy,
            RegionServerError::UnknownSession { .. } => ErrorCode::UnknownSession,
            RegionServerError::Interrupted(_) => ErrorCode::Interrupted,
            RegionServerError::ExecutionFailure { .. } => ErrorCode::ExecutionFailure,
            RegionServerError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            RegionServerError::Io(_) => ErrorCode::Io,
            RegionServerError::Encode(_) => ErrorCode::Encode,
            RegionServerError::Decode(_) => ErrorCode::Decode,
            RegionServerError::Corruption(_) => ErrorCode::Corruption,
            RegionServerError::Cancelled => ErrorCode::Cancelled,
            RegionServerError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Only `NotServingRegion` is worth retrying, after the caller refreshes
    /// its location cache.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegionServerError::NotServingRegion { .. })
    }

    pub(crate) fn not_serving(region: impl Into<String>) -> Self {
        RegionServerError::NotServingRegion {
            region: region.into(),
        }
    }

    pub(crate) fn unknown_scanner(id: u64) -> Self {
        RegionServerError::UnknownSession {
            kind: SessionKind::Scanner,
            id,
        }
    }

    pub(crate) fn unknown_row_lock(id: u64) -> Self {
        RegionServerError::UnknownSession {
            kind: SessionKind::RowLock,
            id,
        }
    }

    pub(crate) fn row_busy(region: &str, row: &[u8]) -> Self {
        RegionServerError::RowBusy {
            region: region.to_string(),
            row: hex::encode(row),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, RegionServerError, SessionKind};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::NotServingRegion.as_str(), "not_serving_region");
        assert_eq!(ErrorCode::UnknownSession.as_str(), "unknown_session");
        assert_eq!(ErrorCode::ExecutionFailure.as_str(), "execution_failure");
    }

    #[test]
    fn execution_failure_keeps_cause() {
        let err = RegionServerError::ExecutionFailure {
            task: "create t1,,1".into(),
            source: Box::new(RegionServerError::Io(std::io::Error::other("disk gone"))),
        };
        assert_eq!(err.code(), ErrorCode::ExecutionFailure);
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("disk gone"));
    }

    #[test]
    fn only_not_serving_region_is_retryable() {
        assert!(RegionServerError::not_serving("t,,1").is_retryable());
        let unknown = RegionServerError::UnknownSession {
            kind: SessionKind::Scanner,
            id: 7,
        };
        assert!(!unknown.is_retryable());
        assert_eq!(unknown.to_string(), "unknown scanner id 7");
    }
}
