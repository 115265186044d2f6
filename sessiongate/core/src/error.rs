use std::fmt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure surfaced by discovery, credential minting, the registry and
/// the reconciler.
///
/// Callers decide between retrying, aborting and reporting by inspecting
/// [`Error::kind`] rather than the message.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{what} is ambiguous: {count} matches found")]
    Ambiguous { what: String, count: usize },

    #[error("{0} is still pending")]
    Pending(String),

    #[error("{context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("{context}: {source}")]
    Fatal {
        context: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Ambiguous,
    Pending,
    Transient,
    Fatal,
}

// === impl Error ===

impl Error {
    pub fn invalid(field: &'static str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            field,
            reason: reason.to_string(),
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn transient(context: impl fmt::Display, source: impl Into<BoxError>) -> Self {
        Self::Transient {
            context: context.to_string(),
            source: source.into(),
        }
    }

    pub fn fatal(context: impl fmt::Display, source: impl Into<BoxError>) -> Self {
        Self::Fatal {
            context: context.to_string(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid { .. } => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Ambiguous { .. } => ErrorKind::Ambiguous,
            Self::Pending(_) => ErrorKind::Pending,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Pending and transient failures may succeed if the same request is
    /// issued again later; everything else needs a changed input or an
    /// operator.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Pending | ErrorKind::Transient)
    }

    /// Classifies an HTTP status returned by an upstream API.
    pub fn from_status(status: u16, context: impl fmt::Display, source: impl Into<BoxError>) -> Self {
        match status {
            404 => Self::NotFound(context.to_string()),
            408 | 409 | 429 | 500..=599 => Self::transient(context, source),
            _ => Self::fatal(context, source),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Ambiguous => "ambiguous",
            Self::Pending => "pending",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}
