//! Concurrent conditional HTTP fetcher with ETag revalidation, bounded
//! concurrency, and retry backoff — built for bulk reference-data pipelines.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod config;
pub mod http;
pub mod store;

mod error;
mod session;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

pub use crate::{
	config::{FetchConfig, JitterStrategy, RetryPolicy},
	error::{Error, Result},
	session::{DownloadOutcome, DownloadResult, FetchOutcome, FetchResult, Session},
	store::{RevalidationEntry, RevalidationStore},
};
