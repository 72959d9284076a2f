//! Object store abstraction
//!
//! The repository adapter talks to its backing store through this trait.
//! Two implementations exist: [`s3::S3Store`] over the AWS SDK, and
//! [`memory::MemoryStore`], which backs the integration tests and dry-run
//! scratch work.

pub mod memory;
pub mod s3;

use crate::error::{QfsError, QfsResult};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

/// One listed object
#[derive(Clone, PartialEq, Debug)]
pub struct ObjectMeta {
	pub key: String,
	pub size: u64,
	/// Object last-modified time, milliseconds since the epoch
	pub last_modified_ms: i64,
}

/// One entry from a version listing
#[derive(Clone, PartialEq, Debug)]
pub struct ObjectVersion {
	pub key: String,
	pub version_id: String,
	pub last_modified_ms: i64,
	pub size: u64,
	pub is_latest: bool,
	/// Delete markers have no content
	pub delete_marker: bool,
}

/// Result of a delimiter listing: objects directly under the prefix plus
/// the common prefixes one level down
#[derive(Clone, Debug, Default)]
pub struct DelimitedListing {
	pub objects: Vec<ObjectMeta>,
	pub prefixes: Vec<String>,
}

/// Largest number of keys a single delete request may carry
pub const DELETE_BATCH: usize = 1000;

#[async_trait]
pub trait ObjectStore: Send + Sync {
	/// Paginate every key under `prefix`, emitting page-sized batches
	async fn list(&self, prefix: &str, batches: mpsc::Sender<Vec<ObjectMeta>>) -> QfsResult<()>;

	/// One delimiter-bounded page walk: direct children and common prefixes
	async fn list_delimited(&self, prefix: &str, delimiter: &str) -> QfsResult<DelimitedListing>;

	/// Metadata for one key, or `None` if absent
	async fn head(&self, key: &str) -> QfsResult<Option<ObjectMeta>>;

	/// Fetch an object body into memory
	async fn get(&self, key: &str) -> QfsResult<Vec<u8>>;

	/// Stream an object body to a local file
	async fn get_to_file(&self, key: &str, dest: &Path) -> QfsResult<()>;

	/// Upload a local file
	async fn put_file(&self, key: &str, src: &Path) -> QfsResult<()>;

	/// Upload an in-memory body; an empty body makes a zero-byte object
	async fn put_bytes(&self, key: &str, body: Vec<u8>) -> QfsResult<()>;

	/// Delete keys, splitting into requests of at most [`DELETE_BATCH`]
	async fn delete(&self, keys: &[String]) -> QfsResult<()>;

	/// Server-side copy
	async fn copy(&self, from_key: &str, to_key: &str) -> QfsResult<()>;

	/// Every version of every key under `prefix`
	async fn list_versions(&self, prefix: &str) -> QfsResult<Vec<ObjectVersion>>;

	/// Fetch one specific version to a local file
	async fn get_version(&self, key: &str, version_id: &str, dest: &Path) -> QfsResult<()>;
}

/// Collect a full listing into memory
pub async fn list_all(store: &dyn ObjectStore, prefix: &str) -> QfsResult<Vec<ObjectMeta>> {
	let (tx, mut rx) = mpsc::channel(16);
	let mut out = Vec::new();
	let listing = store.list(prefix, tx);
	tokio::pin!(listing);
	loop {
		tokio::select! {
			batch = rx.recv() => match batch {
				Some(mut b) => out.append(&mut b),
				None => break,
			},
			res = &mut listing => {
				res?;
				// Listing finished; drain whatever is still buffered
				while let Some(mut b) = rx.recv().await {
					out.append(&mut b);
				}
				break;
			}
		}
	}
	Ok(out)
}

/// Split an `s3://bucket/prefix` URL
pub fn parse_s3_url(url: &str) -> QfsResult<(String, String)> {
	let rest = url.strip_prefix("s3://").ok_or_else(|| QfsError::Config {
		message: format!("expected s3://bucket/prefix, got {:?}", url),
	})?;
	let (bucket, prefix) = match rest.split_once('/') {
		Some((b, p)) => (b, p.trim_end_matches('/')),
		None => (rest, ""),
	};
	if bucket.is_empty() {
		return Err(QfsError::Config { message: format!("missing bucket in {:?}", url) });
	}
	Ok((bucket.to_string(), prefix.to_string()))
}


// vim: ts=4
