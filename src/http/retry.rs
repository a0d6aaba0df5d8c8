//! Retry budgeting for fetch attempts.

// crates.io
use tokio::time;
// self
use crate::{_prelude::*, config::RetryPolicy};

/// Tracks attempt accounting and backoff progression for one resource.
#[derive(Debug)]
pub struct RetryExecutor<'a> {
	policy: &'a RetryPolicy,
	attempts: u32,
}
impl<'a> RetryExecutor<'a> {
	/// Create a new executor respecting the supplied retry policy.
	pub fn new(policy: &'a RetryPolicy) -> Self {
		Self { policy, attempts: 0 }
	}

	/// Record the start of a request attempt and return its ordinal (1-based).
	pub fn begin_attempt(&mut self) -> u32 {
		self.attempts = self.attempts.saturating_add(1);

		self.attempts
	}

	/// Number of attempts issued so far.
	pub fn attempts(&self) -> u32 {
		self.attempts
	}

	/// Whether another attempt is permitted under the policy.
	pub fn can_retry(&self) -> bool {
		self.attempts <= self.policy.max_retries
	}

	/// Compute the backoff before the next attempt, honoring an origin
	/// supplied hint when it exceeds the computed delay; `None` when the
	/// retry budget is exhausted.
	pub fn next_backoff(&self, origin_hint: Option<Duration>) -> Option<Duration> {
		if !self.can_retry() {
			tracing::debug!(attempts = self.attempts, "retry budget exhausted");

			return None;
		}

		let computed = self.policy.compute_backoff(self.attempts.saturating_sub(1));
		let delay = match origin_hint {
			Some(hint) => computed.max(hint),
			None => computed,
		};

		tracing::debug!(attempt = self.attempts, ?delay, "retry backoff computed");

		Some(delay)
	}

	/// Sleep for the computed backoff window.
	pub async fn sleep_backoff(&self, delay: Duration) {
		if !delay.is_zero() {
			time::sleep(delay).await;
		}
	}
}
