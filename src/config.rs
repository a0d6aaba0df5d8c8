//! Session configuration and retry policy validation.

// std
use std::{cell::RefCell, env, path::PathBuf};
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Default number of concurrent in-flight requests.
pub const DEFAULT_CONCURRENCY: usize = 12;
/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Environment variable consulted for a bearer token when auth is enabled
/// and no token was supplied in the configuration.
pub const TOKEN_ENV_VAR: &str = "REFFETCH_TOKEN";

/// Supported jitter strategies for retry policies.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
	/// No jitter; deterministic backoff schedule.
	None,
	/// Full jitter; randomize delay between 0 and current backoff.
	#[default]
	Full,
	/// Decorrelated jitter per AWS architecture guidance.
	Decorrelated,
}

/// Retry configuration for HTTP fetch operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Maximum number of retry attempts to perform after the initial request.
	pub max_retries: u32,
	/// Initial delay before retrying after a failure.
	pub initial_backoff: Duration,
	/// Upper bound applied to exponential backoff growth.
	pub max_backoff: Duration,
	/// Strategy used to randomize the computed backoff.
	#[serde(default)]
	pub jitter: JitterStrategy,
}
impl RetryPolicy {
	/// Validate invariants for retry configuration.
	pub fn validate(&self) -> Result<()> {
		if self.initial_backoff.is_zero() {
			return Err(Error::Config {
				field: "retry.initial_backoff",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_backoff < self.initial_backoff {
			return Err(Error::Config {
				field: "retry.max_backoff",
				reason: "Must be greater than or equal to initial_backoff.".into(),
			});
		}

		Ok(())
	}

	/// Compute backoff for a retry attempt using the selected jitter strategy.
	///
	/// `attempt` counts failed attempts so far, zero-based: the delay doubles
	/// from `initial_backoff` per attempt until it reaches `max_backoff`.
	pub fn compute_backoff(&self, attempt: u32) -> Duration {
		let exponent = attempt.min(32);
		let base = self.initial_backoff.mul_f64(2f64.powi(exponent as i32));
		let bounded = base.min(self.max_backoff).max(self.initial_backoff);

		self.apply_jitter(bounded, attempt)
	}

	fn apply_jitter(&self, bounded: Duration, attempt: u32) -> Duration {
		match self.jitter {
			JitterStrategy::None => bounded,
			JitterStrategy::Full => {
				let lower = bounded.mul_f64(0.8).max(self.initial_backoff);
				let upper = bounded.min(self.max_backoff);

				random_within(lower, upper)
			},
			JitterStrategy::Decorrelated => {
				let prev = if attempt == 0 { self.initial_backoff } else { bounded };
				let ceiling = self.max_backoff.min(prev.mul_f64(3.0));

				random_within(self.initial_backoff, ceiling.max(self.initial_backoff))
			},
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_backoff: Duration::from_millis(500),
			max_backoff: Duration::from_secs(8),
			jitter: JitterStrategy::Full,
		}
	}
}

/// Configuration for a fetch session. Immutable once the session is opened.
#[derive(Clone, Debug)]
pub struct FetchConfig {
	/// Upper bound on simultaneous in-flight requests.
	pub concurrency: usize,
	/// Retry and backoff configuration applied per resource.
	pub retry: RetryPolicy,
	/// Whether to allow the multiplexed HTTP/2 transport; when false the
	/// client is pinned to HTTP/1.1.
	pub http2: bool,
	/// Whether to attach a bearer `Authorization` header to every request.
	pub auth: bool,
	/// Explicit bearer token; falls back to [`TOKEN_ENV_VAR`] when unset.
	pub bearer_token: Option<String>,
	/// Path of the revalidation store file.
	pub store_path: PathBuf,
	/// Timeout applied to each individual HTTP attempt.
	pub request_timeout: Duration,
	/// `User-Agent` header sent with every request.
	pub user_agent: String,
}
impl FetchConfig {
	/// Construct a configuration with defaults and the given store path.
	pub fn new(store_path: impl Into<PathBuf>) -> Self {
		Self { store_path: store_path.into(), ..Default::default() }
	}

	/// Validate the documented constraints; called by `Session::open`.
	pub fn validate(&self) -> Result<()> {
		if self.concurrency < 1 {
			return Err(Error::Config {
				field: "concurrency",
				reason: "Must be at least 1.".into(),
			});
		}
		if self.request_timeout.is_zero() {
			return Err(Error::Config {
				field: "request_timeout",
				reason: "Must be greater than zero.".into(),
			});
		}

		self.retry.validate()
	}

	/// Resolve the bearer token for this session, consulting the environment
	/// when no explicit token was configured.
	pub(crate) fn resolve_bearer_token(&self) -> Result<Option<String>> {
		if !self.auth {
			return Ok(None);
		}
		if let Some(token) = &self.bearer_token {
			return Ok(Some(token.clone()));
		}

		match env::var(TOKEN_ENV_VAR) {
			Ok(token) if !token.is_empty() => Ok(Some(token)),
			_ => Err(Error::Config {
				field: "bearer_token",
				reason: format!("Auth is enabled but no token was supplied and {TOKEN_ENV_VAR} is unset."),
			}),
		}
	}
}
impl Default for FetchConfig {
	fn default() -> Self {
		Self {
			concurrency: DEFAULT_CONCURRENCY,
			retry: RetryPolicy::default(),
			http2: true,
			auth: false,
			bearer_token: None,
			store_path: PathBuf::from(".reffetch-store.json"),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			user_agent: format!("reffetch/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

fn random_within(min: Duration, max: Duration) -> Duration {
	if max <= min {
		return max;
	}
	SMALL_RNG.with(|cell| {
		let mut rng = cell.borrow_mut();
		let nanos = max.as_nanos() - min.as_nanos();
		let jitter = rng.random_range(0..=nanos.min(u64::MAX as u128));

		min + Duration::from_nanos(jitter as u64)
	})
}
