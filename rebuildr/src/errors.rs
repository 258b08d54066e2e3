//! Errors!
//!
//! One crate-wide error enum in the house style. Every variant resolves to a
//! canonical [`ErrorKind`][] so the HTTP boundary can map errors to status
//! codes uniformly; the structured variants exist where a caller needs to
//! branch (conflicts, mismatches, rate limits), and everything else folds into
//! the transparent adapters.

use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// An alias for the common Result type for this crate
pub type RebuildResult<T> = std::result::Result<T, RebuildError>;

/// The canonical error taxonomy, mirroring gRPC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller's request was malformed
    InvalidArgument,
    /// The referenced entity does not exist
    NotFound,
    /// A bundle (or other write-once object) already exists
    AlreadyExists,
    /// The rebuild did not match upstream
    FailedPrecondition,
    /// The requested combination is not supported
    Unimplemented,
    /// Something on our side broke
    Internal,
    /// An upstream dependency is down
    Unavailable,
    /// An upstream dependency is rate-limiting us
    ResourceExhausted,
    /// A deadline elapsed before the work finished
    DeadlineExceeded,
    /// The caller went away
    Canceled,
}

impl ErrorKind {
    /// The HTTP status code this kind maps to at the request boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::FailedPrecondition => 412,
            ErrorKind::ResourceExhausted => 429,
            ErrorKind::Canceled => 499,
            ErrorKind::Internal => 500,
            ErrorKind::Unimplemented => 501,
            ErrorKind::Unavailable => 503,
            ErrorKind::DeadlineExceeded => 504,
        }
    }

    /// The canonical code name, for logs and JSON error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::Internal => "internal",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Canceled => "canceled",
        }
    }
}

/// Errors rebuildr can have
#[derive(Debug, Error, Diagnostic)]
pub enum RebuildError {
    /// The caller's request was malformed
    #[error("{message}")]
    InvalidArgument {
        /// what was wrong with it
        message: String,
    },

    /// The referenced entity does not exist
    #[error("not found: {message}")]
    NotFound {
        /// what was missing
        message: String,
    },

    /// A write-once object already exists
    #[error("already exists: {message}")]
    AlreadyExists {
        /// what already existed
        message: String,
    },

    /// A precondition failed; notably the rebuild-vs-upstream comparison
    #[error("{message}")]
    FailedPrecondition {
        /// why
        message: String,
    },

    /// The requested combination is not supported
    #[error("unimplemented: {message}")]
    Unimplemented {
        /// what combination
        message: String,
    },

    /// An upstream dependency is down
    #[error("unavailable: {message}")]
    Unavailable {
        /// which dependency and how
        message: String,
        /// how long the upstream asked us to back off
        retry_after: Option<Duration>,
    },

    /// An upstream dependency is rate-limiting us
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// which dependency
        message: String,
        /// how long the upstream asked us to back off
        retry_after: Option<Duration>,
    },

    /// A deadline elapsed before the work finished
    #[error("deadline exceeded: {message}")]
    DeadlineExceeded {
        /// which phase timed out
        message: String,
    },

    /// The caller cancelled the request
    #[error("canceled: {message}")]
    Canceled {
        /// which phase observed the cancellation
        message: String,
    },

    /// The remote worker reported a non-success terminal status
    #[error("remote build {status}: {detail}")]
    BuildFailed {
        /// terminal worker status (FAILURE, TIMEOUT, ...)
        status: String,
        /// worker-reported detail
        detail: String,
    },

    /// Something on our side broke
    #[error("internal: {message}")]
    Internal {
        /// what broke
        message: String,
    },

    /// random i/o error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// random subprocess error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cmd(#[from] axoprocess::AxoprocessError),

    /// random http error
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// random json error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// random yaml error
    #[error(transparent)]
    Yaml(#[from] serde_yml::Error),

    /// random zip error
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    /// random url parse error
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// random regex compile error
    #[error(transparent)]
    Regex(#[from] regex::Error),

    /// random glob compile error
    #[error(transparent)]
    Glob(#[from] globset::Error),

    /// malformed target
    #[error(transparent)]
    Target(#[from] rebuildr_schema::TargetError),

    /// malformed strategy oneof
    #[error(transparent)]
    OneOf(#[from] rebuildr_schema::strategy::OneOfError),

    /// malformed envelope or bundle
    #[error(transparent)]
    Envelope(#[from] rebuildr_schema::attestation::EnvelopeError),
}

impl RebuildError {
    /// Shorthand for [`RebuildError::InvalidArgument`][].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        RebuildError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`RebuildError::NotFound`][].
    pub fn not_found(message: impl Into<String>) -> Self {
        RebuildError::NotFound {
            message: message.into(),
        }
    }

    /// Shorthand for [`RebuildError::AlreadyExists`][].
    pub fn already_exists(message: impl Into<String>) -> Self {
        RebuildError::AlreadyExists {
            message: message.into(),
        }
    }

    /// Shorthand for [`RebuildError::FailedPrecondition`][].
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        RebuildError::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Shorthand for [`RebuildError::Unimplemented`][].
    pub fn unimplemented(message: impl Into<String>) -> Self {
        RebuildError::Unimplemented {
            message: message.into(),
        }
    }

    /// Shorthand for [`RebuildError::Internal`][].
    pub fn internal(message: impl Into<String>) -> Self {
        RebuildError::Internal {
            message: message.into(),
        }
    }

    /// Wrap with a short cause prefix, the crate's propagation convention.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            RebuildError::Internal { message } => RebuildError::Internal {
                message: format!("{prefix}: {message}"),
            },
            other => RebuildError::Internal {
                message: format!("{prefix}: {other}"),
            },
        }
    }

    /// The canonical kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RebuildError::InvalidArgument { .. }
            | RebuildError::Target(_)
            | RebuildError::OneOf(_)
            | RebuildError::Url(_) => ErrorKind::InvalidArgument,
            RebuildError::NotFound { .. } => ErrorKind::NotFound,
            RebuildError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            RebuildError::FailedPrecondition { .. } => ErrorKind::FailedPrecondition,
            RebuildError::Unimplemented { .. } => ErrorKind::Unimplemented,
            RebuildError::Unavailable { .. } => ErrorKind::Unavailable,
            RebuildError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            RebuildError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            RebuildError::Canceled { .. } => ErrorKind::Canceled,
            RebuildError::BuildFailed { .. }
            | RebuildError::Internal { .. }
            | RebuildError::Cmd(_)
            | RebuildError::Io(_)
            | RebuildError::Http(_)
            | RebuildError::Json(_)
            | RebuildError::Yaml(_)
            | RebuildError::Zip(_)
            | RebuildError::Regex(_)
            | RebuildError::Glob(_)
            | RebuildError::Envelope(_) => ErrorKind::Internal,
        }
    }

    /// The retry delay an upstream asked us to propagate, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RebuildError::Unavailable { retry_after, .. }
            | RebuildError::ResourceExhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
