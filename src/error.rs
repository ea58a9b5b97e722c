use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the tensor codecs, envelopes, and metadata carriers.
///
/// Loaders never substitute defaults on failure: every structural problem is
/// reported as [`Error::Format`] with the offending extension, key, or member
/// named in the message.
#[derive(Debug, Error)]
pub enum Error {
    /// The payload does not match the expected binary layout.
    #[error("{message}")]
    Format {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The base64 text is not valid RFC 4648 (standard alphabet, padded).
    #[error("invalid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Network retrieval failed (non-2xx status, timeout, connection error).
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A save prefix resolved outside the output directory.
    #[error("invalid save path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// A format error with no underlying cause.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
            source: None,
        }
    }

    /// A format error wrapping the cause that triggered it.
    pub fn format_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Format {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a pre-flight input check.
///
/// Validators never return `Err`: the orchestrator inspects the outcome and
/// rejects the input before the main operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Rejected(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// The rejection message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Valid => None,
            Self::Rejected(msg) => Some(msg),
        }
    }
}
