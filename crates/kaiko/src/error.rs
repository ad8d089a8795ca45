use thiserror::Error;

use crate::dash::TrackKind;

#[derive(Error, Debug)]
pub enum KaikoError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Manifest fetch failed after {0} attempt(s)")]
    ManifestFetchError(u32),

    #[error("Invalid manifest: {0}")]
    MpdParsing(String),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error("No {0} representation found in manifest")]
    NoRepresentationFound(TrackKind),

    #[error("Initialization segment unavailable: {0}")]
    InitSegmentUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Merge failed: {0}")]
    MergeError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    MissingExecutable(#[from] which::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl KaikoError {
    /// Whether another attempt of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(status) => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
            }
            Self::RequestError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
            }
            Self::ManifestFetchError(_) | Self::IOError(_) => true,
            _ => false,
        }
    }
}

pub type KaikoResult<T> = Result<T, KaikoError>;
