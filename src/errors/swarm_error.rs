use serde::Serialize;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Unreachable,
    Protocol,
    HostKey,
    Prerequisite,
    Bind,
    NotFound,
    Conflict,
    Execution,
    PartialFailure,
    InvalidSpec,
    Engine,
    Config,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("ssh protocol error: {0}")]
    Protocol(String),

    #[error("host key rejected: {0}")]
    HostKey(String),

    #[error("remote prerequisite unavailable: {0}")]
    Prerequisite(String),

    #[error("cannot bind local endpoint: {0}")]
    Bind(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("remote execution failed: {0}")]
    Execution(String),

    #[error("{}", partial_message(.completed, .removed, .failed, .source))]
    PartialFailure {
        completed: Vec<String>,
        /// Items destroyed on the way and not brought back.
        removed: Vec<String>,
        failed: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid stack spec: {0}")]
    InvalidSpec(String),

    #[error("engine request failed: {0}")]
    Engine(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Unreachable(_) => ErrorKind::Unreachable,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::HostKey(_) => ErrorKind::HostKey,
            Error::Prerequisite(_) => ErrorKind::Prerequisite,
            Error::Bind(_) => ErrorKind::Bind,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Execution(_) => ErrorKind::Execution,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Error::Engine(_) => ErrorKind::Engine,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Error::Execution(message.into())
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Error::InvalidSpec(message.into())
    }

    /// Wraps `source` as a partial failure when some items were already applied.
    pub fn partial(completed: Vec<String>, failed: impl Into<String>, source: Error) -> Self {
        Self::partial_with_removed(completed, Vec::new(), failed, source)
    }

    /// Like [`Error::partial`], also naming items that were removed and
    /// not recreated. Any progress at all makes this a partial failure.
    pub fn partial_with_removed(
        completed: Vec<String>,
        removed: Vec<String>,
        failed: impl Into<String>,
        source: Error,
    ) -> Self {
        if completed.is_empty() && removed.is_empty() {
            return source;
        }
        Error::PartialFailure {
            completed,
            removed,
            failed: failed.into(),
            source: Box::new(source),
        }
    }
}

fn partial_message(completed: &[String], removed: &[String], failed: &str, source: &Error) -> String {
    let mut text = format!("partially applied: completed [{}]", completed.join(", "));
    if !removed.is_empty() {
        text.push_str(&format!(", removed without replacement [{}]", removed.join(", ")));
    }
    text.push_str(&format!(", failed on {}: {}", failed, source));
    text
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Error::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => Error::Conflict(message),
            other => Error::Engine(other.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidSpec(err.to_string())
    }
}
