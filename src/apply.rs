//! Apply a diff to a local destination tree
//!
//! Three phases, in the order the diff was built for: removals (deepest
//! first), retrieval of new and changed entries through a worker pool, and
//! a bottom-up meta pass that settles final permissions, ownership, and
//! modification times.
//!
//! Retrieval is idempotent: a file whose mtime and size already match the
//! target record is not fetched again. Read-only files are chmod'd
//! user-writable for the overwrite and restored by the meta pass; when a
//! parent directory refuses the write, it is temporarily widened and its
//! mode restored afterwards.
//!
//! The caller's in-memory view of the destination is mutated to reflect
//! exactly what was applied, so the database it later uploads matches the
//! tree it actually produced.

use crate::concurrent::{run_pool, DEFAULT_WORKERS};
use crate::db::Database;
use crate::diff::{Diff, MetaChange};
use crate::error::{QfsError, QfsResult};
use crate::logging::{debug, info, warn};
use crate::repo::Repo;
use crate::types::{FileInfo, FileType};
use crate::util;
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where retrieved content comes from
#[async_trait]
pub trait ContentFetcher: Send + Sync {
	/// Write the record's body to `dest`, creating parent directories
	async fn fetch(&self, rec: &FileInfo, dest: &Path) -> QfsResult<()>;
}

#[async_trait]
impl ContentFetcher for Repo {
	async fn fetch(&self, rec: &FileInfo, dest: &Path) -> QfsResult<()> {
		self.fetch_record(rec, dest).await
	}
}

/// Copies bodies from another local tree (the sync command)
pub struct TreeFetcher {
	root: PathBuf,
}

impl TreeFetcher {
	pub fn new(root: &Path) -> TreeFetcher {
		TreeFetcher { root: root.to_path_buf() }
	}
}

#[async_trait]
impl ContentFetcher for TreeFetcher {
	async fn fetch(&self, rec: &FileInfo, dest: &Path) -> QfsResult<()> {
		let src = self.root.join(&rec.path);
		if let Some(dir) = dest.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
		}
		tokio::fs::copy(&src, dest).await.map_err(|e| QfsError::io(src, e))?;
		Ok(())
	}
}

#[derive(Clone, Copy, Default)]
pub struct ApplyOptions {
	pub no_special: bool,
	pub no_ownerships: bool,
	/// Worker pool size; 0 means the default
	pub workers: usize,
}

/// What an apply actually did
#[derive(Default, Debug)]
pub struct ApplyStats {
	pub removed: usize,
	pub dirs_created: usize,
	pub retrieved: usize,
	pub skipped: usize,
	pub meta_applied: usize,
	/// Non-fatal per-entry failures
	pub errors: Vec<QfsError>,
}

/// Apply `diff` beneath `dest_root`, mutating `view` to the applied state
pub async fn apply_local(
	dest_root: &Path,
	diff: &Diff,
	fetcher: Arc<dyn ContentFetcher>,
	view: &mut Database,
	options: ApplyOptions,
) -> QfsResult<ApplyStats> {
	let mut stats = ApplyStats::default();
	let workers = if options.workers == 0 { DEFAULT_WORKERS } else { options.workers };

	// Phase 1: removals, children before parents
	for rec in &diff.rm {
		let abs = resolve(dest_root, &rec.path);
		let result = match tokio::fs::symlink_metadata(&abs).await {
			Err(_) => Ok(()), // already absent
			Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&abs).await,
			Ok(_) => tokio::fs::remove_file(&abs).await,
		};
		match result {
			Ok(()) => {
				debug!("rm {}", rec.path);
				view.remove(&rec.path);
				stats.removed += 1;
			}
			Err(e) => stats.errors.push(QfsError::io(abs, e)),
		}
	}

	// Phase 2a: directories, parents before children
	for rec in &diff.mkdir {
		let abs = resolve(dest_root, &rec.path);
		match tokio::fs::create_dir(&abs).await {
			Ok(()) => {
				debug!("mkdir {}", rec.path);
				view.insert(rec.clone());
				stats.dirs_created += 1;
			}
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
				view.insert(rec.clone());
			}
			Err(e) => stats.errors.push(QfsError::io(abs, e)),
		}
	}

	// Phase 2b: retrieval worker pool
	let widened: Arc<Mutex<HashMap<PathBuf, u32>>> = Arc::new(Mutex::new(HashMap::new()));
	let applied: Arc<Mutex<Vec<FileInfo>>> = Arc::new(Mutex::new(Vec::new()));
	let skipped = Arc::new(std::sync::atomic::AtomicUsize::new(0));

	let work: Vec<FileInfo> = diff
		.add
		.iter()
		.chain(diff.change.iter())
		.filter(|r| r.ftype != FileType::Directory)
		.filter(|r| !(options.no_special && r.ftype.is_special()))
		.cloned()
		.collect();

	let root = dest_root.to_path_buf();
	let errors = {
		let applied = Arc::clone(&applied);
		let widened = Arc::clone(&widened);
		let skipped = Arc::clone(&skipped);
		run_pool(work, workers, move |rec: FileInfo| {
			let root = root.clone();
			let fetcher = Arc::clone(&fetcher);
			let applied = Arc::clone(&applied);
			let widened = Arc::clone(&widened);
			let skipped = Arc::clone(&skipped);
			async move {
				let abs = resolve(&root, &rec.path);
				match retrieve_one(&abs, &rec, fetcher.as_ref(), &widened).await? {
					true => applied.lock().await.push(rec),
					false => {
						skipped.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
					}
				}
				Ok(())
			}
		})
		.await
	};
	stats.errors.extend(errors);
	stats.skipped = skipped.load(std::sync::atomic::Ordering::SeqCst);
	{
		let mut applied = applied.lock().await;
		stats.retrieved = applied.len();
		for rec in applied.drain(..) {
			view.insert(rec);
		}
	}

	// Restore directories widened for the writes, deepest first
	{
		let mut widened = widened.lock().await;
		let mut entries: Vec<(PathBuf, u32)> = widened.drain().collect();
		entries.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
		for (dir, mode) in entries {
			if let Err(e) =
				tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode)).await
			{
				stats.errors.push(QfsError::io(dir, e));
			}
		}
	}

	// Phase 3: meta pass, bottom-up
	let mut meta: Vec<MetaChange> = diff.meta.clone();
	for rec in &diff.mkdir {
		meta.push(MetaChange::Chmod { path: rec.path.clone(), mode: rec.mode });
		meta.push(MetaChange::Mtime { path: rec.path.clone(), mtime_ms: rec.mtime_ms });
	}
	meta.sort_by(|a, b| {
		util::depth(b.path()).cmp(&util::depth(a.path())).then_with(|| a.path().cmp(b.path()))
	});
	for m in &meta {
		let abs = resolve(dest_root, m.path());
		let result = match m {
			MetaChange::Chmod { mode, .. } => {
				tokio::fs::set_permissions(&abs, std::fs::Permissions::from_mode(*mode))
					.await
					.map_err(|e| QfsError::io(abs.clone(), e))
					.map(|_| {
						if let Some(rec) = view.get_mut(m.path()) {
							rec.mode = *mode;
						}
					})
			}
			MetaChange::Chown { uid, gid, .. } => {
				if options.no_ownerships {
					Ok(())
				} else {
					util::lchown(&abs, *uid, *gid)
						.map_err(|e| QfsError::io(abs.clone(), e))
						.map(|_| {
							if let Some(rec) = view.get_mut(m.path()) {
								rec.uid = *uid;
								rec.gid = *gid;
							}
						})
				}
			}
			MetaChange::Mtime { mtime_ms, .. } => util::set_mtime_ms(&abs, *mtime_ms)
				.map_err(|e| QfsError::io(abs.clone(), e))
				.map(|_| {
					if let Some(rec) = view.get_mut(m.path()) {
						rec.mtime_ms = *mtime_ms;
					}
				}),
		};
		match result {
			Ok(()) => stats.meta_applied += 1,
			Err(e) => {
				warn!("{}", e);
				stats.errors.push(e);
			}
		}
	}

	info!(
		"applied: {} removed, {} dirs, {} retrieved, {} up to date",
		stats.removed, stats.dirs_created, stats.retrieved, stats.skipped
	);
	Ok(stats)
}

fn resolve(root: &Path, path: &str) -> PathBuf {
	if path == "." {
		root.to_path_buf()
	} else {
		root.join(path)
	}
}

/// Fetch one non-directory entry; returns false when it was already current
async fn retrieve_one(
	abs: &Path,
	rec: &FileInfo,
	fetcher: &dyn ContentFetcher,
	widened: &Mutex<HashMap<PathBuf, u32>>,
) -> QfsResult<bool> {
	let existing = tokio::fs::symlink_metadata(abs).await.ok();

	if rec.ftype == FileType::File {
		if let Some(meta) = &existing {
			if meta.is_file()
				&& crate::types::mtime_ms_from_metadata(meta) == rec.mtime_ms
				&& meta.len() == rec.size
			{
				debug!("up to date: {}", rec.path);
				return Ok(false);
			}
			// Widen a read-only file before overwriting it
			let mode = meta.permissions().mode() & 0o7777;
			if meta.is_file() && mode & 0o200 == 0 {
				tokio::fs::set_permissions(abs, std::fs::Permissions::from_mode(mode | 0o200))
					.await
					.map_err(|e| QfsError::io(abs.to_path_buf(), e))?;
			}
		}
		if existing.as_ref().map(|m| !m.is_file()).unwrap_or(false) {
			remove_any(abs).await?;
		}
		match fetcher.fetch(rec, abs).await {
			Ok(()) => {}
			Err(first) => {
				// A read-only parent blocks the write; widen it and retry
				if !widen_parent(abs, widened).await? {
					return Err(first);
				}
				fetcher.fetch(rec, abs).await?;
			}
		}
		tokio::fs::set_permissions(abs, std::fs::Permissions::from_mode(rec.mode))
			.await
			.map_err(|e| QfsError::io(abs.to_path_buf(), e))?;
		util::set_mtime_ms(abs, rec.mtime_ms).map_err(|e| QfsError::io(abs.to_path_buf(), e))?;
		return Ok(true);
	}

	// Links and device nodes are recreated outright
	if existing.is_some() {
		remove_any(abs).await?;
	}
	if let Some(dir) = abs.parent() {
		tokio::fs::create_dir_all(dir).await.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
	}
	match rec.ftype {
		FileType::Link => {
			tokio::fs::symlink(&rec.special, abs)
				.await
				.map_err(|e| QfsError::io(abs.to_path_buf(), e))?;
		}
		FileType::BlockDev | FileType::CharDev => {
			let (major, minor) = parse_device(&rec.special).ok_or_else(|| {
				QfsError::other(format!("{}: bad device numbers {:?}", rec.path, rec.special))
			})?;
			util::mknod(abs, rec.ftype == FileType::BlockDev, rec.mode, major, minor)
				.map_err(|e| QfsError::io(abs.to_path_buf(), e))?;
		}
		FileType::Pipe | FileType::Socket | FileType::Unknown => {
			return Err(QfsError::other(format!(
				"{}: cannot create {} entries",
				rec.path, rec.ftype
			)));
		}
		FileType::File | FileType::Directory => unreachable!(),
	}
	util::set_mtime_ms(abs, rec.mtime_ms).map_err(|e| QfsError::io(abs.to_path_buf(), e))?;
	Ok(true)
}

async fn remove_any(abs: &Path) -> QfsResult<()> {
	let result = match tokio::fs::symlink_metadata(abs).await {
		Err(_) => return Ok(()),
		Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(abs).await,
		Ok(_) => tokio::fs::remove_file(abs).await,
	};
	result.map_err(|e| QfsError::io(abs.to_path_buf(), e))
}

/// Make the parent directory user-writable, remembering its previous mode.
/// Returns false when there was nothing to widen.
async fn widen_parent(
	abs: &Path,
	widened: &Mutex<HashMap<PathBuf, u32>>,
) -> QfsResult<bool> {
	let dir = match abs.parent() {
		Some(d) => d.to_path_buf(),
		None => return Ok(false),
	};
	let meta = match tokio::fs::metadata(&dir).await {
		Ok(m) => m,
		Err(_) => return Ok(false),
	};
	let mode = meta.permissions().mode() & 0o7777;
	if mode & 0o700 == 0o700 {
		return Ok(false);
	}
	let mut guard = widened.lock().await;
	guard.entry(dir.clone()).or_insert(mode);
	tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode | 0o700))
		.await
		.map_err(|e| QfsError::io(dir, e))?;
	Ok(true)
}

fn parse_device(special: &str) -> Option<(u64, u64)> {
	let (major, minor) = special.split_once(',')?;
	Some((major.parse().ok()?, minor.parse().ok()?))
}


// vim: ts=4
