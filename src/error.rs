//! Crate-wide error types and `Result` alias.

// std
use std::{path::PathBuf, time::Duration};
// crates.io
use reqwest::StatusCode;
use url::Url;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the fetcher crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Invalid configuration for {field}: {reason}")]
	Config { field: &'static str, reason: String },
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: StatusCode, url: Url, retry_after: Option<Duration>, body: Option<String> },
	#[error("Invalid destination path {path:?}: {reason}")]
	Path { path: PathBuf, reason: String },
	#[error("Session is closed; no further fetch operations are permitted.")]
	SessionClosed,
	#[error("Revalidation store at {path:?} is corrupted: {source}")]
	StoreCorrupt { path: PathBuf, source: serde_json::Error },
}
impl Error {
	/// Whether a failed attempt may be retried under the backoff policy.
	///
	/// Transport-level failures (connect errors, timeouts) and origin signals
	/// that indicate a transient condition (429, 5xx) are retryable; every
	/// other failure is terminal for the resource.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Reqwest(err) => err.is_timeout() || err.is_connect() || err.is_request(),
			Self::HttpStatus { status, .. } =>
				*status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
			_ => false,
		}
	}

	/// Origin-supplied delay hint (`Retry-After`) when one was advertised.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::HttpStatus { retry_after, .. } => *retry_after,
			_ => None,
		}
	}
}
