use std::time::Duration;

use derive_builder::UninitializedFieldError;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure surfaced by the client.
///
/// Codec and payload errors abort only the batch or record in progress; query
/// and subscription errors terminate only their own sequence.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport could not reach the server.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The server answered with a non-2xx status. `message` is taken verbatim
    /// from the `x-reduct-error` header.
    #[error("Status {status}: {message}")]
    Http { status: u16, message: String },

    /// The response did not follow the expected header/body framing.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Incomplete read: expected {expected} bytes, received {received}")]
    IncompleteRead { expected: u64, received: u64 },

    #[error("Read past the declared size of {expected} bytes")]
    OverRead { expected: u64 },

    #[error("Deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// The server no longer knows the query cursor.
    #[error("Query {0} expired or no longer exists")]
    CursorExpired(u64),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Status code of the failed request, if the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Failures caused by the network rather than by the request itself. The
    /// client never retries; callers use this to drive their own policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Parse the `<status>,<message>` form used by per-record error headers.
    pub fn from_header(value: &str) -> Result<Self> {
        let (status, message) = value.split_once(',').unwrap_or((value, ""));
        let status = status
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::protocol(format!("Invalid error header '{value}'")))?;
        Ok(Self::http(status, message))
    }
}

impl From<UninitializedFieldError> for Error {
    fn from(e: UninitializedFieldError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_header() {
        let err = Error::from_header("409,A record with timestamp 1000 already exists").unwrap();
        assert_eq!(err.status(), Some(409));
        assert_eq!(
            err.to_string(),
            "Status 409: A record with timestamp 1000 already exists"
        );

        // the message keeps its own commas
        let err = Error::from_header("500,a,b").unwrap();
        assert!(matches!(err, Error::Http { status: 500, ref message } if message == "a,b"));

        assert!(matches!(
            Error::from_header("oops,message"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::Connection("refused".to_string()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!Error::http(404, "not found").is_transient());
    }
}
