//! Local filesystem source

use super::Source;
use crate::error::{QfsError, QfsResult};
use crate::types::FileInfo;
use async_trait::async_trait;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// A tree rooted at a local directory
pub struct LocalSource {
	root: PathBuf,
	root_dev: u64,
}

impl LocalSource {
	/// Open a root directory; fails when the root cannot be stated
	pub fn open(root: &Path) -> QfsResult<LocalSource> {
		let meta =
			std::fs::metadata(root).map_err(|e| QfsError::io(root.to_path_buf(), e))?;
		if !meta.is_dir() {
			return Err(QfsError::other(format!("{}: not a directory", root.display())));
		}
		Ok(LocalSource { root: root.to_path_buf(), root_dev: meta.dev() })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Absolute location of a relative tree path
	pub fn resolve(&self, path: &str) -> PathBuf {
		if path == "." {
			self.root.clone()
		} else {
			self.root.join(path)
		}
	}
}

#[async_trait]
impl Source for LocalSource {
	async fn list_dir(&self, path: &str) -> QfsResult<Vec<String>> {
		let abs = self.resolve(path);
		let mut rd =
			tokio::fs::read_dir(&abs).await.map_err(|e| QfsError::io(abs.clone(), e))?;
		let mut names = Vec::new();
		while let Some(entry) =
			rd.next_entry().await.map_err(|e| QfsError::io(abs.clone(), e))?
		{
			match entry.file_name().into_string() {
				Ok(name) => names.push(name),
				Err(os) => {
					return Err(QfsError::other(format!(
						"{}: non-UTF-8 name {:?}",
						abs.display(),
						os
					)));
				}
			}
		}
		names.sort();
		Ok(names)
	}

	async fn stat(&self, path: &str) -> QfsResult<FileInfo> {
		let abs = self.resolve(path);
		let meta = tokio::fs::symlink_metadata(&abs)
			.await
			.map_err(|e| QfsError::io(abs.clone(), e))?;
		let mut info = FileInfo::from_metadata(path, &meta);
		if meta.file_type().is_symlink() {
			let target = tokio::fs::read_link(&abs)
				.await
				.map_err(|e| QfsError::io(abs.clone(), e))?;
			info.special = target.to_string_lossy().into_owned();
		}
		Ok(info)
	}

	async fn open(&self, path: &str) -> QfsResult<Vec<u8>> {
		let abs = self.resolve(path);
		tokio::fs::read(&abs).await.map_err(|e| QfsError::io(abs, e))
	}

	async fn remove(&self, path: &str) -> QfsResult<()> {
		let abs = self.resolve(path);
		tokio::fs::remove_file(&abs).await.map_err(|e| QfsError::io(abs, e))
	}

	fn device(&self) -> u64 {
		self.root_dev
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_list_and_stat() {
		let tmp = TempDir::new().unwrap();
		fs::write(tmp.path().join("b.txt"), b"bb").unwrap();
		fs::create_dir(tmp.path().join("a")).unwrap();
		let src = LocalSource::open(tmp.path()).unwrap();

		let names = src.list_dir(".").await.unwrap();
		assert_eq!(names, vec!["a", "b.txt"]);

		let info = src.stat("b.txt").await.unwrap();
		assert_eq!(info.size, 2);
		assert_eq!(info.path, "b.txt");
	}

	#[tokio::test]
	async fn test_stat_link_reads_target() {
		let tmp = TempDir::new().unwrap();
		std::os::unix::fs::symlink("else@where", tmp.path().join("ln")).unwrap();
		let src = LocalSource::open(tmp.path()).unwrap();
		let info = src.stat("ln").await.unwrap();
		assert_eq!(info.ftype, crate::types::FileType::Link);
		assert_eq!(info.special, "else@where");
	}

	#[tokio::test]
	async fn test_remove() {
		let tmp = TempDir::new().unwrap();
		fs::write(tmp.path().join("junk~"), b"").unwrap();
		let src = LocalSource::open(tmp.path()).unwrap();
		src.remove("junk~").await.unwrap();
		assert!(!tmp.path().join("junk~").exists());
	}

	#[test]
	fn test_open_requires_directory() {
		let tmp = TempDir::new().unwrap();
		let file = tmp.path().join("f");
		fs::write(&file, b"").unwrap();
		assert!(LocalSource::open(&file).is_err());
		assert!(LocalSource::open(&tmp.path().join("missing")).is_err());
	}
}

// vim: ts=4
