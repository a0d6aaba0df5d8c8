//! Durable revalidation store mapping resource URLs to their last-seen
//! cache validators.
//!
//! The store is a single pretty-printed JSON file so diffs between pipeline
//! runs stay reviewable. An absent or empty file is a valid empty store;
//! malformed contents are a fatal startup error, because silently dropping
//! validators would cause mass re-downloads without any diagnosis.

// std
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::fs;
// self
use crate::_prelude::*;

/// Cache validators remembered for a single resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevalidationEntry {
	/// Entity tag advertised by the origin, replayed as `If-None-Match`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub etag: Option<String>,
	/// `Last-Modified` value stored verbatim, replayed as `If-Modified-Since`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_modified: Option<String>,
	/// UTC timestamp of the most recent response that touched this entry.
	pub last_seen_at: DateTime<Utc>,
}

/// In-memory view of the persisted URL → validator mapping.
#[derive(Debug)]
pub struct RevalidationStore {
	path: PathBuf,
	entries: HashMap<String, RevalidationEntry>,
}
impl RevalidationStore {
	/// Load the store from disk. A missing or empty file yields an empty
	/// store; malformed contents fail with [`Error::StoreCorrupt`].
	pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let entries = match fs::read(&path).await {
			Ok(raw) if raw.iter().all(|byte| byte.is_ascii_whitespace()) => HashMap::new(),
			Ok(raw) => serde_json::from_slice(&raw)
				.map_err(|source| Error::StoreCorrupt { path: path.clone(), source })?,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
			Err(err) => return Err(err.into()),
		};

		tracing::debug!(path = %path.display(), entries = entries.len(), "revalidation store loaded");

		Ok(Self { path, entries })
	}

	/// Look up the validators recorded for a URL.
	pub fn get(&self, url: &str) -> Option<&RevalidationEntry> {
		self.entries.get(url)
	}

	/// Record the validators returned with fresh content. Entries without any
	/// validator are not recorded; replacement is last-write-wins per key.
	pub fn upsert(&mut self, url: &str, etag: Option<String>, last_modified: Option<String>) {
		if etag.is_none() && last_modified.is_none() {
			return;
		}

		self.entries.insert(
			url.to_owned(),
			RevalidationEntry { etag, last_modified, last_seen_at: Utc::now() },
		);
	}

	/// Refresh an entry after a not-modified response: `last_seen_at` always
	/// advances, and validators are replaced only when the origin advertised
	/// them again — an established validator is never dropped.
	pub fn touch(&mut self, url: &str, etag: Option<String>, last_modified: Option<String>) {
		if let Some(entry) = self.entries.get_mut(url) {
			if etag.is_some() {
				entry.etag = etag;
			}
			if last_modified.is_some() {
				entry.last_modified = last_modified;
			}

			entry.last_seen_at = Utc::now();
		} else {
			self.upsert(url, etag, last_modified);
		}
	}

	/// Number of recorded entries.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the store holds no entries.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Persist the store as pretty JSON, overwriting the previous file via a
	/// staging file and an atomic rename.
	pub async fn flush(&self) -> Result<()> {
		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			fs::create_dir_all(parent).await?;
		}

		let json = serde_json::to_vec_pretty(&self.entries)?;
		let staging = staging_path(&self.path);

		fs::write(&staging, &json).await?;
		fs::rename(&staging, &self.path).await?;

		tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "revalidation store flushed");

		Ok(())
	}
}

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sibling path used to stage a write before the atomic rename. Each call
/// yields a distinct path, so concurrent writers racing toward the same
/// destination cannot interleave within one staging file.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
	let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
	let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "staging".into());

	name.push(format!(".{}.{seq}.part", std::process::id()));

	path.with_file_name(name)
}
