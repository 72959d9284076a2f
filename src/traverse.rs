//! Concurrent tree traversal
//!
//! A fixed-size worker pool pulls directory paths from a shared queue; each
//! worker lists entries, stats them, enqueues child directories, and feeds
//! records to the growing database. Per-entry failures are recorded and the
//! walk continues; only an unreadable root fails the traversal.
//!
//! The site control directory `.qfs` is handled specially: only the
//! `.qfs/filters` subtree is part of the collection, and the bare `.qfs`
//! record is emitted only when that subtree exists. Databases, markers, and
//! the repo/site config files never enter a database this way.

use crate::concurrent::DEFAULT_WORKERS;
use crate::db::{Database, DbFlavor};
use crate::error::{QfsError, QfsResult};
use crate::filter::{check_all, Filter, Group};
use crate::logging::{debug, info, warn};
use crate::repo::{FILTERS_DIR, QFS_DIR};
use crate::source::Source;
use crate::types::FileType;
use crate::util::path_join;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Traversal configuration
#[derive(Clone, Default)]
pub struct TraverseOptions {
	pub filters: Vec<Filter>,

	/// Emit only regular files
	pub files_only: bool,

	/// Skip devices, pipes, and sockets
	pub no_special: bool,

	/// Delete junk files as they are found
	pub cleanup: bool,

	/// Do not descend into directories on another device
	pub same_device: bool,

	/// Worker pool size; 0 means the default
	pub workers: usize,
}

/// A finished traversal: the database plus the non-fatal per-entry errors
pub struct TraverseResult {
	pub db: Database,
	pub errors: Vec<QfsError>,
}

enum Work {
	Dir(String),
	Done,
}

struct Walk {
	source: Arc<dyn Source>,
	options: TraverseOptions,
	db: Mutex<Database>,
	errors: Mutex<Vec<QfsError>>,
	queue_tx: mpsc::UnboundedSender<Work>,
	outstanding: AtomicUsize,
	workers: usize,
}

/// Walk a source and produce a database
pub async fn traverse(
	source: Arc<dyn Source>,
	flavor: DbFlavor,
	options: TraverseOptions,
) -> QfsResult<TraverseResult> {
	let workers = if options.workers == 0 { DEFAULT_WORKERS } else { options.workers };

	// An unreadable root is the one fatal case
	let root_info = source.stat(".").await?;
	source.list_dir(".").await?;

	let (queue_tx, queue_rx) = mpsc::unbounded_channel();
	let walk = Arc::new(Walk {
		source,
		options,
		db: Mutex::new(Database::new(flavor)),
		errors: Mutex::new(Vec::new()),
		queue_tx,
		outstanding: AtomicUsize::new(0),
		workers,
	});

	{
		let mut db = walk.db.lock().await;
		if !walk.options.files_only {
			let v = check_all(&walk.options.filters, ".", false)?;
			if v.included {
				db.insert(root_info);
			}
		}
	}
	walk.enqueue(".".to_string());

	let queue_rx = Arc::new(Mutex::new(queue_rx));
	let mut handles = Vec::with_capacity(workers);
	for _ in 0..workers {
		let walk = Arc::clone(&walk);
		let queue_rx = Arc::clone(&queue_rx);
		handles.push(tokio::spawn(async move {
			loop {
				let work = {
					let mut rx = queue_rx.lock().await;
					rx.recv().await
				};
				match work {
					Some(Work::Dir(dir)) => walk.process_dir(&dir).await,
					Some(Work::Done) | None => break,
				}
			}
		}));
	}
	futures::future::join_all(handles).await;

	let walk = Arc::try_unwrap(walk).map_err(|_| QfsError::other("traversal workers leaked"))?;
	let db = walk.db.into_inner();
	let errors = walk.errors.into_inner();
	info!("traversal finished: {} records, {} errors", db.len(), errors.len());
	Ok(TraverseResult { db, errors })
}

impl Walk {
	fn enqueue(&self, dir: String) {
		self.outstanding.fetch_add(1, Ordering::SeqCst);
		let _ = self.queue_tx.send(Work::Dir(dir));
	}

	fn finish_dir(&self) {
		if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
			for _ in 0..self.workers {
				let _ = self.queue_tx.send(Work::Done);
			}
		}
	}

	async fn record_error(&self, e: QfsError) {
		warn!("{}", e);
		self.errors.lock().await.push(e);
	}

	async fn process_dir(&self, dir: &str) {
		let names = match self.source.list_dir(dir).await {
			Ok(n) => n,
			Err(e) => {
				self.record_error(e).await;
				self.finish_dir();
				return;
			}
		};
		for name in names {
			let path = path_join(dir, &name);
			if dir == "." && name == QFS_DIR {
				self.enter_control_dir().await;
				continue;
			}
			if let Err(e) = self.process_entry(&path).await {
				self.record_error(e).await;
			}
		}
		self.finish_dir();
	}

	/// Only `.qfs/filters` is collection data; nothing else under `.qfs`
	/// may enter the database
	async fn enter_control_dir(&self) {
		let filters_info = match self.source.stat(FILTERS_DIR).await {
			Ok(info) if info.ftype == FileType::Directory => info,
			_ => return,
		};
		if !self.options.files_only {
			if let Ok(qfs_info) = self.source.stat(QFS_DIR).await {
				self.db.lock().await.insert(qfs_info);
			}
			self.db.lock().await.insert(filters_info);
		}
		self.enqueue(FILTERS_DIR.to_string());
	}

	async fn process_entry(&self, path: &str) -> QfsResult<()> {
		let info = self.source.stat(path).await?;
		let is_file = info.ftype == FileType::File;
		let is_dir = info.ftype == FileType::Directory;

		let verdict = check_all(&self.options.filters, path, is_file)?;
		if verdict.group == Group::Prune {
			debug!("pruned {}", path);
			return Ok(());
		}
		if verdict.group == Group::Junk {
			if self.options.cleanup && is_file {
				info!("removing junk file {}", path);
				self.source.remove(path).await?;
			}
			return Ok(());
		}

		let crosses_device = is_dir && self.options.same_device && info.dev != self.source.device();

		if verdict.included {
			let emit = if self.options.files_only {
				is_file
			} else if self.options.no_special {
				!info.ftype.is_special()
			} else {
				true
			};
			if emit {
				self.db.lock().await.insert(info);
			}
		}

		if is_dir {
			if crosses_device {
				debug!("not crossing device boundary at {}", path);
			} else {
				self.enqueue(path.to_string());
			}
		}
		Ok(())
	}
}


// vim: ts=4
