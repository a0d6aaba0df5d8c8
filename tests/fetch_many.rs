//! Integration tests for concurrent in-memory fetching.

// std
use std::{
	path::Path,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::{Duration, Instant},
};
// crates.io
use reffetch::{Error, FetchConfig, FetchOutcome, JitterStrategy, Result, RetryPolicy, Session};
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, method, path},
};

fn test_config(store: &Path) -> FetchConfig {
	let mut config = FetchConfig::new(store);

	config.retry = RetryPolicy {
		max_retries: 1,
		initial_backoff: Duration::from_millis(10),
		max_backoff: Duration::from_millis(40),
		jitter: JitterStrategy::None,
	};
	config.http2 = false;

	config
}

#[tokio::test]
async fn results_preserve_input_order_and_attempt_counts() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/a.csv"))
		.respond_with(ResponseTemplate::new(200).set_body_bytes("alpha"))
		.mount(&server)
		.await;

	let b_calls = Arc::new(AtomicUsize::new(0));
	let b_counter = b_calls.clone();

	Mock::given(method("GET"))
		.and(path("/b.csv"))
		.respond_with(move |_: &wiremock::Request| {
			if b_counter.fetch_add(1, Ordering::SeqCst) == 0 {
				ResponseTemplate::new(500)
			} else {
				ResponseTemplate::new(200).set_body_bytes("bravo")
			}
		})
		.mount(&server)
		.await;

	Mock::given(method("GET"))
		.and(path("/c.csv"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let mut config = test_config(&dir.path().join("store.json"));

	config.concurrency = 2;

	let session = Session::open(config).await?;
	let urls = vec![
		Url::parse(&format!("{}/a.csv", server.uri()))?,
		Url::parse(&format!("{}/b.csv", server.uri()))?,
		Url::parse(&format!("{}/c.csv", server.uri()))?,
	];
	let results = session.fetch_many(&urls).await?;

	assert_eq!(results.len(), urls.len());

	for (result, url) in results.iter().zip(&urls) {
		assert_eq!(&result.url, url);
	}

	match &results[0].outcome {
		FetchOutcome::Fetched(bytes) => assert_eq!(bytes.as_ref(), b"alpha"),
		other => panic!("expected fetched outcome for A, got {other:?}"),
	}
	assert_eq!(results[0].attempts, 1);

	match &results[1].outcome {
		FetchOutcome::Fetched(bytes) => assert_eq!(bytes.as_ref(), b"bravo"),
		other => panic!("expected fetched outcome for B, got {other:?}"),
	}
	assert_eq!(results[1].attempts, 2);

	assert!(results[2].is_failed());
	assert_eq!(results[2].attempts, 2);

	session.close().await?;
	Ok(())
}

#[tokio::test]
async fn gate_serializes_requests_at_concurrency_one() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let delay = Duration::from_millis(100);

	Mock::given(method("GET"))
		.and(path("/slow.csv"))
		.respond_with(ResponseTemplate::new(200).set_body_bytes("x").set_delay(delay))
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let mut config = test_config(&dir.path().join("store.json"));

	config.concurrency = 1;

	let session = Session::open(config).await?;
	let url = Url::parse(&format!("{}/slow.csv", server.uri()))?;
	let urls = vec![url.clone(), url.clone(), url];
	let started = Instant::now();
	let results = session.fetch_many(&urls).await?;

	// With a single gate slot the three requests cannot overlap.
	assert!(started.elapsed() >= delay * 3);
	assert!(results.iter().all(|result| !result.is_failed()));

	session.close().await?;
	Ok(())
}

#[tokio::test]
async fn auth_header_is_attached_when_enabled() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/auth.csv"))
		.and(header("authorization", "Bearer sesame"))
		.respond_with(ResponseTemplate::new(200).set_body_bytes("ok"))
		.expect(1)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let mut config = test_config(&dir.path().join("store.json"));

	config.auth = true;
	config.bearer_token = Some("sesame".into());

	let session = Session::open(config).await?;
	let urls = vec![Url::parse(&format!("{}/auth.csv", server.uri()))?];
	let results = session.fetch_many(&urls).await?;

	assert!(!results[0].is_failed());

	session.close().await?;
	server.verify().await;
	Ok(())
}

#[tokio::test]
async fn non_retryable_status_fails_without_retry() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/gone.csv"))
		.respond_with(ResponseTemplate::new(404))
		.expect(1)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let session = Session::open(test_config(&dir.path().join("store.json"))).await?;
	let urls = vec![Url::parse(&format!("{}/gone.csv", server.uri()))?];
	let results = session.fetch_many(&urls).await?;

	assert!(results[0].is_failed());
	// The retry budget allows a second attempt, but 404 is not transient.
	assert_eq!(results[0].attempts, 1);

	session.close().await?;
	server.verify().await;
	Ok(())
}

#[tokio::test]
async fn rate_limit_hint_is_honored_end_to_end() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();

	Mock::given(method("GET"))
		.and(path("/throttled.csv"))
		.respond_with(move |_: &wiremock::Request| {
			if counter.fetch_add(1, Ordering::SeqCst) == 0 {
				ResponseTemplate::new(429).insert_header("retry-after", "1")
			} else {
				ResponseTemplate::new(200).set_body_bytes("caught up")
			}
		})
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let session = Session::open(test_config(&dir.path().join("store.json"))).await?;
	let urls = vec![Url::parse(&format!("{}/throttled.csv", server.uri()))?];
	let started = Instant::now();
	let results = session.fetch_many(&urls).await?;

	match &results[0].outcome {
		FetchOutcome::Fetched(bytes) => assert_eq!(bytes.as_ref(), b"caught up"),
		other => panic!("expected fetched outcome, got {other:?}"),
	}
	assert_eq!(results[0].attempts, 2);
	// The origin hint (1s) outranks the 10ms computed backoff.
	assert!(started.elapsed() >= Duration::from_secs(1));

	session.close().await?;
	Ok(())
}

#[tokio::test]
async fn close_during_backoff_stops_further_attempts() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();

	Mock::given(method("GET"))
		.and(path("/flaky.csv"))
		.respond_with(move |_: &wiremock::Request| {
			counter.fetch_add(1, Ordering::SeqCst);

			ResponseTemplate::new(500)
		})
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let mut config = test_config(&dir.path().join("store.json"));

	config.retry = RetryPolicy {
		max_retries: 3,
		initial_backoff: Duration::from_millis(400),
		max_backoff: Duration::from_millis(400),
		jitter: JitterStrategy::None,
	};

	let session = Session::open(config).await?;
	let worker = session.clone();
	let urls = vec![Url::parse(&format!("{}/flaky.csv", server.uri()))?];
	let batch = tokio::spawn(async move { worker.fetch_many(&urls).await });

	// Land the close inside the first backoff sleep.
	tokio::time::sleep(Duration::from_millis(150)).await;
	session.close().await?;

	let results = batch.await.expect("join")?;

	assert!(results[0].is_failed());
	assert_eq!(calls.load(Ordering::SeqCst), 1);

	// No second attempt may be issued once the session is closed.
	tokio::time::sleep(Duration::from_millis(600)).await;
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	Ok(())
}

#[tokio::test]
async fn fetching_after_close_is_rejected() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let dir = tempfile::tempdir().expect("tempdir");
	let session = Session::open(test_config(&dir.path().join("store.json"))).await?;

	session.close().await?;
	// Second close is a no-op, not an error.
	session.close().await?;

	let urls = vec![Url::parse("http://localhost:9/unreachable.csv")?];

	assert!(matches!(session.fetch_many(&urls).await, Err(Error::SessionClosed)));
	assert!(matches!(session.download_many(&[]).await, Err(Error::SessionClosed)));
	Ok(())
}

#[tokio::test]
async fn empty_input_yields_empty_output() -> Result<()> {
	let dir = tempfile::tempdir().expect("tempdir");
	let session = Session::open(test_config(&dir.path().join("store.json"))).await?;
	let results = session.fetch_many(&[]).await?;

	assert!(results.is_empty());

	session.close().await?;
	Ok(())
}
