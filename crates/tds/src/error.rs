use std::fmt;

/// A result callback refused to accept more output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SinkError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The server rejected the credentials.
    Authentication(String),
    /// Socket-level failure. The connection is gone.
    Io(String),
    /// The server raised an error for the submitted batch.
    Server { code: u32, message: String },
    /// Unexpected bytes on the wire. The connection is unusable.
    Protocol(String),
    /// A result callback failed and the run was abandoned.
    Handler(SinkError),
    /// The local async runtime could not be created or driven.
    Runtime(String),
}

impl DbError {
    /// True if the handle cannot be used for further runs after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Io(_) | DbError::Protocol(_) | DbError::Runtime(_))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication(msg) => write!(f, "{msg}"),
            Self::Io(msg) => write!(f, "connection error: {msg}"),
            Self::Server { code, message } => write!(f, "server error {code}: {message}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Handler(err) => write!(f, "result handler failed: {err}"),
            Self::Runtime(msg) => write!(f, "runtime error: {msg}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<SinkError> for DbError {
    fn from(err: SinkError) -> Self {
        DbError::Handler(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DbError::Io("reset".into()).is_fatal());
        assert!(DbError::Protocol("bad token".into()).is_fatal());
        assert!(!DbError::Server { code: 208, message: "Invalid object name 'x'.".into() }.is_fatal());
        assert!(!DbError::Handler(SinkError("closed".into())).is_fatal());
        assert!(!DbError::Authentication("Login failed for user 'u'.".into()).is_fatal());
    }

    #[test]
    fn test_authentication_display_is_server_text() {
        let err = DbError::Authentication("Login failed for user 'u'.".into());
        assert_eq!(err.to_string(), "Login failed for user 'u'.");
    }
}
