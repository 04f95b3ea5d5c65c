// crates/crawlflow/src/error.rs
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FetchError,
    RateLimit,
    DataShape,
    PartitionWrite,
    SessionExpired,
    Transport,
    Browser,
    InvalidJobName,
    BadPayload,
    Timeout,
    Storage,
    Cache,
    Config,
    Stalled,
    Unknown,
}

impl ErrorCode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "FETCH_ERROR" => Self::FetchError,
            "RATE_LIMIT" => Self::RateLimit,
            "DATA_SHAPE" => Self::DataShape,
            "PARTITION_WRITE" => Self::PartitionWrite,
            "SESSION_EXPIRED" => Self::SessionExpired,
            "TRANSPORT" => Self::Transport,
            "BROWSER" => Self::Browser,
            "INVALID_JOB_NAME" => Self::InvalidJobName,
            "BAD_PAYLOAD" => Self::BadPayload,
            "TIMEOUT" => Self::Timeout,
            "STORAGE" => Self::Storage,
            "CACHE" => Self::Cache,
            "CONFIG" => Self::Config,
            "STALLED" => Self::Stalled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchError => "FETCH_ERROR",
            Self::RateLimit => "RATE_LIMIT",
            Self::DataShape => "DATA_SHAPE",
            Self::PartitionWrite => "PARTITION_WRITE",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Transport => "TRANSPORT",
            Self::Browser => "BROWSER",
            Self::InvalidJobName => "INVALID_JOB_NAME",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::Timeout => "TIMEOUT",
            Self::Storage => "STORAGE",
            Self::Cache => "CACHE",
            Self::Config => "CONFIG",
            Self::Stalled => "STALLED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidJobName | Self::BadPayload | Self::PartitionWrite | Self::Config => {
                ErrorClass::NonRetryable
            }
            _ => ErrorClass::Retryable,
        }
    }

    /// Conditions that affect the whole process rather than one job.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Transport | Self::Browser)
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::parse(code) {
        ErrorCode::FetchError => "Source answered with an error. Check endpoint, params and source status.",
        ErrorCode::RateLimit => {
            "Back off. Lower queue concurrency or the rate limiter, spread load across proxies."
        }
        ErrorCode::DataShape => {
            "Payload shape changed or is partial. Compare with the previous run before replaying."
        }
        ErrorCode::PartitionWrite => {
            "Constraint violation outside the conflict key. Inspect the table definition."
        }
        ErrorCode::SessionExpired => "Session token lapsed. Harvester should re-navigate and refresh.",
        ErrorCode::Transport => "Proxy or network is down. Check proxy credentials and egress.",
        ErrorCode::Browser => "Headless browser crashed or stopped answering. Restart the browser.",
        ErrorCode::InvalidJobName => "Non-retryable. A producer enqueued a name with no handler.",
        ErrorCode::BadPayload => "Non-retryable. Fix the producer of this payload.",
        ErrorCode::Timeout => "Handler exceeded its timeout. Check source latency.",
        ErrorCode::Storage => "Database unavailable or slow. Retry is OK.",
        ErrorCode::Cache => "Cache unavailable. Retry is OK.",
        ErrorCode::Config => "Non-retryable. Catalogue or environment is inconsistent.",
        ErrorCode::Stalled => {
            "Lease expired too often. Check for worker crashes or handlers blocking the runtime."
        }
        ErrorCode::Unknown => "Inspect error_message and logs.",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fetch failed with status {status} (error_code={error_code:?}): {message}")]
pub struct FetchError {
    pub status: u16,
    pub error_code: Option<String>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("rate limited by {origin}: {message}")]
    RateLimited { origin: String, message: String },

    #[error("data shape mismatch: {0}")]
    DataShape(String),

    #[error("partition write failed on {table}: {message}")]
    PartitionWrite { table: String, message: String },

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("invalid job name: {0}")]
    InvalidJobName(String),

    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("timed out after {0}ms")]
    Timeout(u128),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CrawlError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Fetch(_) => ErrorCode::FetchError,
            Self::RateLimited { .. } => ErrorCode::RateLimit,
            Self::DataShape(_) => ErrorCode::DataShape,
            Self::PartitionWrite { .. } => ErrorCode::PartitionWrite,
            Self::SessionExpired(_) => ErrorCode::SessionExpired,
            Self::Transport(_) => ErrorCode::Transport,
            Self::Browser(_) => ErrorCode::Browser,
            Self::InvalidJobName(_) => ErrorCode::InvalidJobName,
            Self::BadPayload(_) => ErrorCode::BadPayload,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Storage(_) => ErrorCode::Storage,
            Self::Cache(_) => ErrorCode::Cache,
            Self::Config(_) => ErrorCode::Config,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.code().class()
    }

    pub fn is_systemic(&self) -> bool {
        self.code().is_systemic()
    }
}

impl From<anyhow::Error> for CrawlError {
    fn from(e: anyhow::Error) -> Self {
        Self::Storage(format!("{e:#}"))
    }
}

impl From<redis::RedisError> for CrawlError {
    fn from(e: redis::RedisError) -> Self {
        Self::Cache(e.to_string())
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadPayload(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_their_names() {
        for code in [
            ErrorCode::FetchError,
            ErrorCode::RateLimit,
            ErrorCode::DataShape,
            ErrorCode::PartitionWrite,
            ErrorCode::SessionExpired,
            ErrorCode::Transport,
            ErrorCode::Browser,
            ErrorCode::InvalidJobName,
            ErrorCode::BadPayload,
            ErrorCode::Timeout,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
        assert_eq!(ErrorCode::parse("what"), ErrorCode::Unknown);
    }

    #[test]
    fn structural_errors_are_not_retried() {
        assert_eq!(
            CrawlError::InvalidJobName("nope".into()).class(),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            CrawlError::PartitionWrite {
                table: "whales".into(),
                message: "check violation".into()
            }
            .class(),
            ErrorClass::NonRetryable
        );
        // shape mismatches may be transient, job attempts still apply
        assert_eq!(
            CrawlError::DataShape("3 != 100".into()).class(),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn transport_and_browser_are_systemic() {
        assert!(CrawlError::Transport("proxy refused".into()).is_systemic());
        assert!(CrawlError::Browser("target crashed".into()).is_systemic());
        assert!(!CrawlError::RateLimited {
            origin: "src".into(),
            message: "429".into()
        }
        .is_systemic());
    }

    #[test]
    fn rate_limit_suggests_backing_off() {
        assert!(suggested_action("RATE_LIMIT").to_lowercase().contains("back off"));
    }
}
