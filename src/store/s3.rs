//! S3 object store backend
//!
//! Credentials and region come from the ambient AWS configuration chain.
//! Listing uses ListObjectsV2 pagination, which reports millisecond
//! last-modified stamps; that precision is what the repository key scheme
//! leans on.

use super::{DelimitedListing, ObjectMeta, ObjectStore, ObjectVersion, DELETE_BATCH};
use crate::error::{QfsError, QfsResult};
use crate::logging::debug;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::sync::mpsc;

pub struct S3Store {
	client: Client,
	bucket: String,
}

impl S3Store {
	/// Build a store over the ambient AWS configuration
	pub async fn connect(bucket: &str) -> S3Store {
		let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
		S3Store { client: Client::new(&config), bucket: bucket.to_string() }
	}

	pub fn with_client(client: Client, bucket: &str) -> S3Store {
		S3Store { client, bucket: bucket.to_string() }
	}

	pub fn bucket(&self) -> &str {
		&self.bucket
	}
}

fn millis(dt: Option<&aws_smithy_types::DateTime>) -> i64 {
	dt.map(|d| d.to_millis().unwrap_or(0)).unwrap_or(0)
}

/// Percent-encode a key for use in an x-amz-copy-source header
fn encode_copy_source(bucket: &str, key: &str) -> String {
	let mut out = String::with_capacity(bucket.len() + key.len() + 1);
	out.push_str(bucket);
	out.push('/');
	for b in key.bytes() {
		match b {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
				out.push(b as char)
			}
			_ => out.push_str(&format!("%{:02X}", b)),
		}
	}
	out
}

#[async_trait]
impl ObjectStore for S3Store {
	async fn list(&self, prefix: &str, batches: mpsc::Sender<Vec<ObjectMeta>>) -> QfsResult<()> {
		let mut pages = self
			.client
			.list_objects_v2()
			.bucket(&self.bucket)
			.prefix(prefix)
			.into_paginator()
			.send();
		while let Some(page) = pages.next().await {
			let page = page.map_err(|e| QfsError::store(format!("list {}", prefix), e))?;
			let batch: Vec<ObjectMeta> = page
				.contents()
				.iter()
				.filter_map(|o| {
					o.key().map(|k| ObjectMeta {
						key: k.to_string(),
						size: o.size().unwrap_or(0).max(0) as u64,
						last_modified_ms: millis(o.last_modified()),
					})
				})
				.collect();
			debug!("listed {} keys under {}", batch.len(), prefix);
			if batches.send(batch).await.is_err() {
				break;
			}
		}
		Ok(())
	}

	async fn list_delimited(&self, prefix: &str, delimiter: &str) -> QfsResult<DelimitedListing> {
		let mut out = DelimitedListing::default();
		let mut token: Option<String> = None;
		loop {
			let resp = self
				.client
				.list_objects_v2()
				.bucket(&self.bucket)
				.prefix(prefix)
				.delimiter(delimiter)
				.set_continuation_token(token.take())
				.send()
				.await
				.map_err(|e| QfsError::store(format!("list {}", prefix), e))?;
			for o in resp.contents() {
				if let Some(k) = o.key() {
					out.objects.push(ObjectMeta {
						key: k.to_string(),
						size: o.size().unwrap_or(0).max(0) as u64,
						last_modified_ms: millis(o.last_modified()),
					});
				}
			}
			for p in resp.common_prefixes() {
				if let Some(p) = p.prefix() {
					out.prefixes.push(p.to_string());
				}
			}
			match resp.next_continuation_token() {
				Some(t) => token = Some(t.to_string()),
				None => break,
			}
		}
		Ok(out)
	}

	async fn head(&self, key: &str) -> QfsResult<Option<ObjectMeta>> {
		match self.client.head_object().bucket(&self.bucket).key(key).send().await {
			Ok(resp) => Ok(Some(ObjectMeta {
				key: key.to_string(),
				size: resp.content_length().unwrap_or(0).max(0) as u64,
				last_modified_ms: millis(resp.last_modified()),
			})),
			Err(e) => {
				let service = e.into_service_error();
				if service.is_not_found() {
					Ok(None)
				} else {
					Err(QfsError::store(format!("head {}", key), service))
				}
			}
		}
	}

	async fn get(&self, key: &str) -> QfsResult<Vec<u8>> {
		let resp = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| QfsError::store(format!("get {}", key), e))?;
		let data = resp
			.body
			.collect()
			.await
			.map_err(|e| QfsError::store(format!("get {}", key), e))?;
		Ok(data.into_bytes().to_vec())
	}

	async fn get_to_file(&self, key: &str, dest: &Path) -> QfsResult<()> {
		let resp = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| QfsError::store(format!("get {}", key), e))?;
		if let Some(dir) = dest.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
		}
		let mut body = resp.body.into_async_read();
		let mut file = tokio::fs::File::create(dest)
			.await
			.map_err(|e| QfsError::io(dest.to_path_buf(), e))?;
		tokio::io::copy(&mut body, &mut file)
			.await
			.map_err(|e| QfsError::io(dest.to_path_buf(), e))?;
		Ok(())
	}

	async fn put_file(&self, key: &str, src: &Path) -> QfsResult<()> {
		let body = ByteStream::from_path(src)
			.await
			.map_err(|e| QfsError::store(format!("read {}", src.display()), e))?;
		self.client
			.put_object()
			.bucket(&self.bucket)
			.key(key)
			.body(body)
			.send()
			.await
			.map_err(|e| QfsError::store(format!("put {}", key), e))?;
		Ok(())
	}

	async fn put_bytes(&self, key: &str, body: Vec<u8>) -> QfsResult<()> {
		self.client
			.put_object()
			.bucket(&self.bucket)
			.key(key)
			.body(ByteStream::from(body))
			.send()
			.await
			.map_err(|e| QfsError::store(format!("put {}", key), e))?;
		Ok(())
	}

	async fn delete(&self, keys: &[String]) -> QfsResult<()> {
		for chunk in keys.chunks(DELETE_BATCH) {
			let mut ids = Vec::with_capacity(chunk.len());
			for key in chunk {
				ids.push(
					ObjectIdentifier::builder()
						.key(key)
						.build()
						.map_err(|e| QfsError::store(format!("delete {}", key), e))?,
				);
			}
			let delete = Delete::builder()
				.set_objects(Some(ids))
				.quiet(true)
				.build()
				.map_err(|e| QfsError::store("delete batch", e))?;
			self.client
				.delete_objects()
				.bucket(&self.bucket)
				.delete(delete)
				.send()
				.await
				.map_err(|e| QfsError::store("delete batch", e))?;
		}
		Ok(())
	}

	async fn copy(&self, from_key: &str, to_key: &str) -> QfsResult<()> {
		self.client
			.copy_object()
			.bucket(&self.bucket)
			.key(to_key)
			.copy_source(encode_copy_source(&self.bucket, from_key))
			.send()
			.await
			.map_err(|e| QfsError::store(format!("copy {} -> {}", from_key, to_key), e))?;
		Ok(())
	}

	async fn list_versions(&self, prefix: &str) -> QfsResult<Vec<ObjectVersion>> {
		let mut out = Vec::new();
		let mut key_marker: Option<String> = None;
		let mut version_marker: Option<String> = None;
		loop {
			let resp = self
				.client
				.list_object_versions()
				.bucket(&self.bucket)
				.prefix(prefix)
				.set_key_marker(key_marker.take())
				.set_version_id_marker(version_marker.take())
				.send()
				.await
				.map_err(|e| QfsError::store(format!("list-versions {}", prefix), e))?;
			for v in resp.versions() {
				if let (Some(key), Some(vid)) = (v.key(), v.version_id()) {
					out.push(ObjectVersion {
						key: key.to_string(),
						version_id: vid.to_string(),
						last_modified_ms: millis(v.last_modified()),
						size: v.size().unwrap_or(0).max(0) as u64,
						is_latest: v.is_latest().unwrap_or(false),
						delete_marker: false,
					});
				}
			}
			for d in resp.delete_markers() {
				if let (Some(key), Some(vid)) = (d.key(), d.version_id()) {
					out.push(ObjectVersion {
						key: key.to_string(),
						version_id: vid.to_string(),
						last_modified_ms: millis(d.last_modified()),
						size: 0,
						is_latest: d.is_latest().unwrap_or(false),
						delete_marker: true,
					});
				}
			}
			if resp.is_truncated().unwrap_or(false) {
				key_marker = resp.next_key_marker().map(|s| s.to_string());
				version_marker = resp.next_version_id_marker().map(|s| s.to_string());
			} else {
				break;
			}
		}
		Ok(out)
	}

	async fn get_version(&self, key: &str, version_id: &str, dest: &Path) -> QfsResult<()> {
		let resp = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.version_id(version_id)
			.send()
			.await
			.map_err(|e| QfsError::store(format!("get {} @{}", key, version_id), e))?;
		if let Some(dir) = dest.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
		}
		let mut body = resp.body.into_async_read();
		let mut file = tokio::fs::File::create(dest)
			.await
			.map_err(|e| QfsError::io(dest.to_path_buf(), e))?;
		tokio::io::copy(&mut body, &mut file)
			.await
			.map_err(|e| QfsError::io(dest.to_path_buf(), e))?;
		Ok(())
	}
}


// vim: ts=4
