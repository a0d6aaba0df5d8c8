//! Conditional HTTP request execution.

// crates.io
use bytes::Bytes;
use reqwest::{
	Client, StatusCode,
	header::{
		ETAG, HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
		RETRY_AFTER,
	},
};
use url::Url;
// self
use crate::{_prelude::*, store::RevalidationEntry};

/// Outcome of a single conditional HTTP exchange (200 or 304).
#[derive(Clone, Debug)]
pub struct HttpFetch {
	/// Response payload when the origin returned content; `None` on 304.
	pub body: Option<Bytes>,
	/// Entity tag advertised by the origin.
	pub etag: Option<String>,
	/// `Last-Modified` header value, captured verbatim for later replay.
	pub last_modified: Option<String>,
	/// Status code of the exchange.
	pub status: StatusCode,
}

/// Issue one conditional GET for `url`, replaying stored validators if any.
///
/// Non-2xx statuses other than 304 are returned as [`Error::HttpStatus`],
/// carrying the origin's `Retry-After` hint when one was advertised so the
/// caller's backoff can honor it.
pub async fn fetch_conditional(
	client: &Client,
	url: &Url,
	validators: Option<&RevalidationEntry>,
	timeout: Duration,
) -> Result<HttpFetch> {
	let mut builder = client.get(url.clone()).timeout(timeout);

	if let Some(entry) = validators {
		if let Some(etag) = &entry.etag
			&& let Ok(value) = HeaderValue::from_str(etag)
		{
			builder = builder.header(IF_NONE_MATCH, value);
		}
		if let Some(last_modified) = &entry.last_modified
			&& let Ok(value) = HeaderValue::from_str(last_modified)
		{
			builder = builder.header(IF_MODIFIED_SINCE, value);
		}
	}

	let start = Instant::now();
	let response = builder.send().await?;
	let status = response.status();
	let etag = header_string(response.headers(), &ETAG);
	let last_modified = header_string(response.headers(), &LAST_MODIFIED);

	if status == StatusCode::NOT_MODIFIED {
		tracing::debug!(%url, elapsed = ?start.elapsed(), "not modified");

		return Ok(HttpFetch { body: None, etag, last_modified, status });
	}
	if !status.is_success() {
		let retry_after = retry_after_hint(response.headers());
		let body = response.text().await.ok();

		return Err(Error::HttpStatus { status, url: url.clone(), retry_after, body });
	}

	let body = response.bytes().await?;

	tracing::debug!(%url, %status, bytes = body.len(), elapsed = ?start.elapsed(), "fetch complete");

	Ok(HttpFetch { body: Some(body), etag, last_modified, status })
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
	headers.get(name).and_then(|value| value.to_str().ok()).map(|s| s.to_string())
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
	// Only the delay-seconds form is honored; an HTTP-date hint falls back
	// to the computed backoff.
	headers
		.get(RETRY_AFTER)
		.and_then(|value| value.to_str().ok())
		.and_then(|raw| raw.trim().parse::<u64>().ok())
		.map(Duration::from_secs)
}
