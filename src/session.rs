//! Fetch session owning the transport, the concurrency gate, and the
//! revalidation store.

// std
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::atomic::{AtomicBool, Ordering},
};
// crates.io
use bytes::Bytes;
use reqwest::{
	Client,
	header::{AUTHORIZATION, HeaderMap, HeaderValue},
	redirect::Policy,
};
use tokio::{
	fs,
	sync::{RwLock, Semaphore},
};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::FetchConfig,
	http::{client::fetch_conditional, retry::RetryExecutor},
	store::{RevalidationStore, staging_path},
};

/// Terminal outcome for a single in-memory fetch.
#[derive(Clone, Debug)]
pub enum FetchOutcome {
	/// Origin returned new content.
	Fetched(Bytes),
	/// Origin confirmed the cached validators are still current. The payload
	/// is present when this session has already seen a body for the URL.
	Unchanged(Option<Bytes>),
	/// Retries exhausted or an unrecoverable error occurred.
	Failed {
		/// Final error cause, rendered for reporting.
		reason: String,
	},
}

/// Per-URL result of [`Session::fetch_many`].
#[derive(Clone, Debug)]
pub struct FetchResult {
	/// Originating URL.
	pub url: Url,
	/// Number of HTTP attempts issued for this resource.
	pub attempts: u32,
	/// Terminal outcome.
	pub outcome: FetchOutcome,
}
impl FetchResult {
	/// Payload bytes when available (fresh, or replayed from this session).
	pub fn bytes(&self) -> Option<&Bytes> {
		match &self.outcome {
			FetchOutcome::Fetched(bytes) => Some(bytes),
			FetchOutcome::Unchanged(bytes) => bytes.as_ref(),
			FetchOutcome::Failed { .. } => None,
		}
	}

	/// Whether the resource ended in failure.
	pub fn is_failed(&self) -> bool {
		matches!(self.outcome, FetchOutcome::Failed { .. })
	}
}

/// Terminal outcome for a single download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
	/// Payload changed and was written to the destination.
	Written,
	/// Conditional request confirmed no change; the destination was left
	/// untouched.
	Unchanged,
	/// Retries exhausted, an unrecoverable error, or an invalid destination.
	Failed {
		/// Final error cause, rendered for reporting.
		reason: String,
	},
}

/// Per-target result of [`Session::download_many`].
#[derive(Clone, Debug)]
pub struct DownloadResult {
	/// Originating URL.
	pub url: Url,
	/// Destination path supplied by the caller.
	pub path: PathBuf,
	/// Number of HTTP attempts issued for this resource.
	pub attempts: u32,
	/// Terminal outcome.
	pub outcome: DownloadOutcome,
}
impl DownloadResult {
	/// Whether the target ended in failure.
	pub fn is_failed(&self) -> bool {
		matches!(self.outcome, DownloadOutcome::Failed { .. })
	}
}

#[derive(Debug)]
enum ResourceOutcome {
	Fresh(Bytes),
	Unchanged,
}

/// A fetch session: connection-pooled HTTP client, concurrency gate, and the
/// loaded revalidation store.
///
/// Open explicitly with [`Session::open`]; call [`Session::close`] on every
/// exit path so the store is flushed. A single resource failing never fails
/// a whole batch — per-resource failures are values in the result sequence.
///
/// [`Session::fetch_many`] retains each fetched body for the lifetime of the
/// session so a later 304 can replay it; the cache is never evicted. Scope a
/// session per batch, or use [`Session::download_many`] (which retains
/// nothing), when the payload volume is large.
#[derive(Clone, Debug)]
pub struct Session {
	config: Arc<FetchConfig>,
	client: Client,
	gate: Arc<Semaphore>,
	store: Arc<RwLock<RevalidationStore>>,
	bodies: Arc<RwLock<HashMap<String, Bytes>>>,
	closed: Arc<AtomicBool>,
}
impl Session {
	/// Validate the configuration, build the transport, and load the store.
	pub async fn open(config: FetchConfig) -> Result<Self> {
		config.validate()?;

		let mut headers = HeaderMap::new();

		if let Some(token) = config.resolve_bearer_token()? {
			let mut value =
				HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| Error::Config {
					field: "bearer_token",
					reason: format!("Not a valid header value: {err}."),
				})?;

			value.set_sensitive(true);
			headers.insert(AUTHORIZATION, value);
		}

		let mut builder = Client::builder()
			.default_headers(headers)
			.redirect(Policy::limited(10))
			.user_agent(config.user_agent.clone())
			.connect_timeout(Duration::from_secs(5));

		if !config.http2 {
			builder = builder.http1_only();
		}

		let client = builder.build()?;
		let store = RevalidationStore::load(&config.store_path).await?;
		let gate = Arc::new(Semaphore::new(config.concurrency));

		tracing::debug!(
			concurrency = config.concurrency,
			entries = store.len(),
			"session opened"
		);

		Ok(Self {
			config: Arc::new(config),
			client,
			gate,
			store: Arc::new(RwLock::new(store)),
			bodies: Arc::new(RwLock::new(HashMap::new())),
			closed: Arc::new(AtomicBool::new(false)),
		})
	}

	/// Whether [`Session::close`] has been called.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Flush the revalidation store (full overwrite) and tear down the gate.
	///
	/// Idempotent; fetch operations issued after the first close fail with
	/// [`Error::SessionClosed`].
	pub async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		// Queued gate acquisitions fail immediately; tasks mid-backoff
		// observe the closed flag before issuing another attempt.
		self.gate.close();

		let store = self.store.read().await;

		store.flush().await?;

		tracing::debug!(entries = store.len(), "session closed");

		Ok(())
	}

	/// Fetch every URL concurrently, returning results in input order
	/// regardless of completion order. Duplicates are fetched independently.
	pub async fn fetch_many(&self, urls: &[Url]) -> Result<Vec<FetchResult>> {
		self.ensure_open()?;

		let handles: Vec<_> = urls
			.iter()
			.cloned()
			.map(|url| {
				let session = self.clone();

				tokio::spawn(async move { session.fetch_one(url).await })
			})
			.collect();
		let mut results = Vec::with_capacity(handles.len());

		for (handle, url) in handles.into_iter().zip(urls) {
			results.push(match handle.await {
				Ok(result) => result,
				Err(err) => FetchResult {
					url: url.clone(),
					attempts: 0,
					outcome: FetchOutcome::Failed { reason: format!("fetch task aborted: {err}") },
				},
			});
		}

		Ok(results)
	}

	/// Download every target concurrently, writing payloads to disk via a
	/// staging file and an atomic rename; results are returned in input
	/// order. Payloads are never retained in memory.
	pub async fn download_many(&self, targets: &[(Url, PathBuf)]) -> Result<Vec<DownloadResult>> {
		self.ensure_open()?;

		let handles: Vec<_> = targets
			.iter()
			.cloned()
			.map(|(url, path)| {
				let session = self.clone();

				tokio::spawn(async move { session.download_one(url, path).await })
			})
			.collect();
		let mut results = Vec::with_capacity(handles.len());

		for (handle, (url, path)) in handles.into_iter().zip(targets) {
			results.push(match handle.await {
				Ok(result) => result,
				Err(err) => DownloadResult {
					url: url.clone(),
					path: path.clone(),
					attempts: 0,
					outcome: DownloadOutcome::Failed {
						reason: format!("download task aborted: {err}"),
					},
				},
			});
		}

		Ok(results)
	}

	fn ensure_open(&self) -> Result<()> {
		if self.is_closed() { Err(Error::SessionClosed) } else { Ok(()) }
	}

	async fn fetch_one(self, url: Url) -> FetchResult {
		let (attempts, outcome) = self.fetch_with_retry(&url, true).await;
		let outcome = match outcome {
			Ok(ResourceOutcome::Fresh(bytes)) => {
				self.bodies.write().await.insert(url.as_str().to_owned(), bytes.clone());

				FetchOutcome::Fetched(bytes)
			},
			Ok(ResourceOutcome::Unchanged) => {
				let cached = self.bodies.read().await.get(url.as_str()).cloned();

				FetchOutcome::Unchanged(cached)
			},
			Err(err) => FetchOutcome::Failed { reason: err.to_string() },
		};

		FetchResult { url, attempts, outcome }
	}

	async fn download_one(self, url: Url, path: PathBuf) -> DownloadResult {
		let existing = fs::metadata(&path).await.ok();

		if let Some(metadata) = &existing
			&& !metadata.is_file()
		{
			let err = Error::Path {
				path: path.clone(),
				reason: "Destination exists and is not a regular file.".into(),
			};

			tracing::warn!(%url, path = %path.display(), "destination collides with a non-file entry");

			return DownloadResult {
				url,
				path,
				attempts: 0,
				outcome: DownloadOutcome::Failed { reason: err.to_string() },
			};
		}

		// Without a local copy a 304 would leave nothing to serve, so the
		// conditional headers are only sent when the destination is present.
		let send_validators = existing.is_some();
		let (attempts, outcome) = self.fetch_with_retry(&url, send_validators).await;
		let outcome = match outcome {
			Ok(ResourceOutcome::Fresh(bytes)) => match write_atomic(&path, &bytes).await {
				Ok(()) => DownloadOutcome::Written,
				Err(err) => DownloadOutcome::Failed { reason: err.to_string() },
			},
			Ok(ResourceOutcome::Unchanged) => DownloadOutcome::Unchanged,
			Err(err) => DownloadOutcome::Failed { reason: err.to_string() },
		};

		DownloadResult { url, path, attempts, outcome }
	}

	/// Per-resource fetch algorithm: acquire a gate permit, replay stored
	/// validators, and retry transient failures with backoff. Returns the
	/// number of attempts issued alongside the terminal outcome.
	#[tracing::instrument(skip(self, url), fields(url = %url))]
	async fn fetch_with_retry(
		&self,
		url: &Url,
		send_validators: bool,
	) -> (u32, Result<ResourceOutcome>) {
		// The permit is the sole backpressure mechanism. It is held across
		// all attempts of this resource and released by drop on every path,
		// so a failing resource can never leak a slot.
		let _permit = match self.gate.clone().acquire_owned().await {
			Ok(permit) => permit,
			Err(_) => return (0, Err(Error::SessionClosed)),
		};
		let validators = if send_validators {
			self.store.read().await.get(url.as_str()).cloned()
		} else {
			None
		};
		let mut executor = RetryExecutor::new(&self.config.retry);

		loop {
			let attempt = executor.begin_attempt();
			let fetch =
				fetch_conditional(&self.client, url, validators.as_ref(), self.config.request_timeout)
					.await;

			match fetch {
				Ok(fetch) => {
					let mut store = self.store.write().await;
					let outcome = match fetch.body {
						Some(bytes) => {
							store.upsert(url.as_str(), fetch.etag, fetch.last_modified);

							ResourceOutcome::Fresh(bytes)
						},
						None => {
							store.touch(url.as_str(), fetch.etag, fetch.last_modified);

							ResourceOutcome::Unchanged
						},
					};

					return (attempt, Ok(outcome));
				},
				Err(err) if err.is_retryable() => {
					if self.is_closed() {
						tracing::debug!("session closing; abandoning retries");

						return (attempt, Err(err));
					}

					match executor.next_backoff(err.retry_after()) {
						Some(delay) => {
							tracing::warn!(attempt, ?delay, error = %err, "transient failure; will retry");

							executor.sleep_backoff(delay).await;

							// A close may have landed during the sleep; the
							// next attempt must not be issued.
							if self.is_closed() {
								tracing::debug!("session closing; abandoning retries");

								return (attempt, Err(err));
							}
						},
						None => {
							tracing::warn!(attempt, error = %err, "retries exhausted");

							return (attempt, Err(err));
						},
					}
				},
				Err(err) => {
					tracing::warn!(attempt, error = %err, "unrecoverable failure");

					return (attempt, Err(err));
				},
			}
		}
	}
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
	if let Some(parent) = path.parent()
		&& !parent.as_os_str().is_empty()
	{
		fs::create_dir_all(parent).await?;
	}

	let staging = staging_path(path);

	fs::write(&staging, bytes).await?;
	fs::rename(&staging, path).await?;

	Ok(())
}
