//! In-memory object store
//!
//! A versioned key/value store with the same observable behavior as the S3
//! backend: millisecond last-modified stamps, paginated listing, delimiter
//! listing, batch deletes, and a version history per key. The integration
//! tests and dry-run scratch destinations run against this.

use super::{DelimitedListing, ObjectMeta, ObjectStore, ObjectVersion};
use crate::error::{QfsError, QfsResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::{mpsc, Mutex};

const PAGE_SIZE: usize = 1000;

#[derive(Clone)]
struct Stored {
	data: Vec<u8>,
	last_modified_ms: i64,
}

#[derive(Clone)]
struct Version {
	version_id: String,
	data: Option<Vec<u8>>, // None marks a delete
	last_modified_ms: i64,
}

#[derive(Default)]
struct State {
	objects: BTreeMap<String, Stored>,
	versions: BTreeMap<String, Vec<Version>>,
	clock_ms: i64,
	version_seq: u64,
}

pub struct MemoryStore {
	state: Mutex<State>,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	pub fn new() -> MemoryStore {
		MemoryStore {
			state: Mutex::new(State { clock_ms: 1_700_000_000_000, ..State::default() }),
		}
	}

	/// Advance the fake clock; later writes get later stamps
	pub async fn set_clock_ms(&self, clock_ms: i64) {
		self.state.lock().await.clock_ms = clock_ms;
	}

	/// Store a body with an explicit last-modified stamp
	pub async fn put_bytes_at(&self, key: &str, body: Vec<u8>, last_modified_ms: i64) {
		let mut st = self.state.lock().await;
		record(&mut st, key, body, last_modified_ms);
	}

	/// Snapshot of all keys, for assertions
	pub async fn keys(&self) -> Vec<String> {
		self.state.lock().await.objects.keys().cloned().collect()
	}

	pub async fn contains(&self, key: &str) -> bool {
		self.state.lock().await.objects.contains_key(key)
	}

	pub async fn body(&self, key: &str) -> Option<Vec<u8>> {
		self.state.lock().await.objects.get(key).map(|s| s.data.clone())
	}
}

fn record(st: &mut State, key: &str, data: Vec<u8>, last_modified_ms: i64) {
	st.version_seq += 1;
	let version_id = format!("v{}", st.version_seq);
	st.versions.entry(key.to_string()).or_default().push(Version {
		version_id,
		data: Some(data.clone()),
		last_modified_ms,
	});
	st.objects.insert(key.to_string(), Stored { data, last_modified_ms });
}

fn tick(st: &mut State) -> i64 {
	st.clock_ms += 1;
	st.clock_ms
}

#[async_trait]
impl ObjectStore for MemoryStore {
	async fn list(&self, prefix: &str, batches: mpsc::Sender<Vec<ObjectMeta>>) -> QfsResult<()> {
		let metas: Vec<ObjectMeta> = {
			let st = self.state.lock().await;
			st.objects
				.range(prefix.to_string()..)
				.take_while(|(k, _)| k.starts_with(prefix))
				.map(|(k, s)| ObjectMeta {
					key: k.clone(),
					size: s.data.len() as u64,
					last_modified_ms: s.last_modified_ms,
				})
				.collect()
		};
		for page in metas.chunks(PAGE_SIZE) {
			if batches.send(page.to_vec()).await.is_err() {
				break;
			}
		}
		Ok(())
	}

	async fn list_delimited(&self, prefix: &str, delimiter: &str) -> QfsResult<DelimitedListing> {
		let st = self.state.lock().await;
		let mut out = DelimitedListing::default();
		let mut last_common: Option<String> = None;
		for (k, s) in
			st.objects.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix))
		{
			let rest = &k[prefix.len()..];
			match rest.find(delimiter) {
				Some(idx) => {
					let common = format!("{}{}", prefix, &rest[..idx + delimiter.len()]);
					if last_common.as_deref() != Some(common.as_str()) {
						out.prefixes.push(common.clone());
						last_common = Some(common);
					}
				}
				None => out.objects.push(ObjectMeta {
					key: k.clone(),
					size: s.data.len() as u64,
					last_modified_ms: s.last_modified_ms,
				}),
			}
		}
		Ok(out)
	}

	async fn head(&self, key: &str) -> QfsResult<Option<ObjectMeta>> {
		let st = self.state.lock().await;
		Ok(st.objects.get(key).map(|s| ObjectMeta {
			key: key.to_string(),
			size: s.data.len() as u64,
			last_modified_ms: s.last_modified_ms,
		}))
	}

	async fn get(&self, key: &str) -> QfsResult<Vec<u8>> {
		let st = self.state.lock().await;
		st.objects
			.get(key)
			.map(|s| s.data.clone())
			.ok_or_else(|| QfsError::store_msg(format!("no such key: {}", key)))
	}

	async fn get_to_file(&self, key: &str, dest: &Path) -> QfsResult<()> {
		let body = self.get(key).await?;
		if let Some(dir) = dest.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
		}
		tokio::fs::write(dest, body).await.map_err(|e| QfsError::io(dest.to_path_buf(), e))
	}

	async fn put_file(&self, key: &str, src: &Path) -> QfsResult<()> {
		let body =
			tokio::fs::read(src).await.map_err(|e| QfsError::io(src.to_path_buf(), e))?;
		self.put_bytes(key, body).await
	}

	async fn put_bytes(&self, key: &str, body: Vec<u8>) -> QfsResult<()> {
		let mut st = self.state.lock().await;
		let now = tick(&mut st);
		record(&mut st, key, body, now);
		Ok(())
	}

	async fn delete(&self, keys: &[String]) -> QfsResult<()> {
		let mut st = self.state.lock().await;
		for key in keys {
			if st.objects.remove(key).is_some() {
				let now = tick(&mut st);
				st.version_seq += 1;
				let version_id = format!("v{}", st.version_seq);
				st.versions.entry(key.clone()).or_default().push(Version {
					version_id,
					data: None,
					last_modified_ms: now,
				});
			}
		}
		Ok(())
	}

	async fn copy(&self, from_key: &str, to_key: &str) -> QfsResult<()> {
		let mut st = self.state.lock().await;
		let data = st
			.objects
			.get(from_key)
			.map(|s| s.data.clone())
			.ok_or_else(|| QfsError::store_msg(format!("no such key: {}", from_key)))?;
		let now = tick(&mut st);
		record(&mut st, to_key, data, now);
		Ok(())
	}

	async fn list_versions(&self, prefix: &str) -> QfsResult<Vec<ObjectVersion>> {
		let st = self.state.lock().await;
		let mut out = Vec::new();
		for (key, versions) in
			st.versions.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix))
		{
			for (idx, v) in versions.iter().enumerate() {
				out.push(ObjectVersion {
					key: key.clone(),
					version_id: v.version_id.clone(),
					last_modified_ms: v.last_modified_ms,
					size: v.data.as_ref().map(|d| d.len() as u64).unwrap_or(0),
					is_latest: idx == versions.len() - 1,
					delete_marker: v.data.is_none(),
				});
			}
		}
		Ok(out)
	}

	async fn get_version(&self, key: &str, version_id: &str, dest: &Path) -> QfsResult<()> {
		let body = {
			let st = self.state.lock().await;
			let versions = st
				.versions
				.get(key)
				.ok_or_else(|| QfsError::store_msg(format!("no such key: {}", key)))?;
			versions
				.iter()
				.find(|v| v.version_id == version_id)
				.and_then(|v| v.data.clone())
				.ok_or_else(|| {
					QfsError::store_msg(format!("no such version: {} {}", key, version_id))
				})?
		};
		if let Some(dir) = dest.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
		}
		tokio::fs::write(dest, body).await.map_err(|e| QfsError::io(dest.to_path_buf(), e))
	}
}


// vim: ts=4
