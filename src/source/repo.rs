//! Repository-backed source
//!
//! Wraps a completed repository scan so the traverser, diff, and scan
//! commands can treat a repository prefix like any other tree. Listing and
//! stat answer from the snapshot; `open` fetches the object body.

use super::Source;
use crate::db::Database;
use crate::error::{QfsError, QfsResult};
use crate::repo::Repo;
use crate::types::{FileInfo, FileType};
use crate::util::{basename, parent};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub struct RepoSource {
	repo: Repo,
	snapshot: Database,
	children: BTreeMap<String, Vec<String>>,
}

impl RepoSource {
	/// Build a source over a scan snapshot
	pub fn new(repo: Repo, snapshot: Database) -> RepoSource {
		let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
		for path in snapshot.paths() {
			if path == "." {
				continue;
			}
			if let Some(dir) = parent(path) {
				children.entry(dir.to_string()).or_default().push(basename(path).to_string());
			}
		}
		for names in children.values_mut() {
			names.sort();
		}
		RepoSource { repo, snapshot, children }
	}

	pub fn snapshot(&self) -> &Database {
		&self.snapshot
	}
}

#[async_trait]
impl Source for RepoSource {
	async fn list_dir(&self, path: &str) -> QfsResult<Vec<String>> {
		if self.snapshot.get(path).map(|r| r.ftype) != Some(FileType::Directory) {
			return Err(QfsError::other(format!("{}: not a repository directory", path)));
		}
		Ok(self.children.get(path).cloned().unwrap_or_default())
	}

	async fn stat(&self, path: &str) -> QfsResult<FileInfo> {
		self.snapshot
			.get(path)
			.cloned()
			.ok_or_else(|| QfsError::other(format!("{}: not in repository", path)))
	}

	async fn open(&self, path: &str) -> QfsResult<Vec<u8>> {
		let info = self.stat(path).await?;
		if info.ftype != FileType::File {
			return Err(QfsError::other(format!("{}: not a regular file", path)));
		}
		self.repo.store().get(&self.repo.key_for(&info)).await
	}

	async fn remove(&self, path: &str) -> QfsResult<()> {
		let info = self.stat(path).await?;
		self.repo.remove_records(std::slice::from_ref(&info)).await
	}

	fn device(&self) -> u64 {
		0
	}
}


// vim: ts=4
