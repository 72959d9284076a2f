//! Site state directory
//!
//! Every participating site keeps its control state under `.qfs/` at the
//! collection root:
//!
//! ```text
//! .qfs/
//!   repo               # s3://bucket/prefix
//!   site               # this site's name
//!   filters/           # synced with the repository
//!   db/
//!     repo             # cached copy of the repository database
//!     repo.tmp         # downloaded, pending promotion
//!     <site>           # this site's database
//!     <site>.tmp       # to upload after a pull
//!   push, pull         # most recent diff markers
//! ```
//!
//! The cached repo database remembers which repository object it came from
//! by carrying that object's last-modified stamp as its file mtime; the
//! staleness probe is one HEAD-equivalent lookup plus a stat.

use crate::db::{Database, DbFlavor};
use crate::error::{QfsError, QfsResult};
use crate::repo::REPO_DB_NAME;
use crate::types::mtime_ms_from_metadata;
use crate::util::set_mtime_ms;
use std::path::{Path, PathBuf};

pub const REPO_CONFIG: &str = "repo";
pub const SITE_CONFIG: &str = "site";
pub const PUSH_MARKER: &str = "push";
pub const PULL_MARKER: &str = "pull";

pub struct Site {
	top: PathBuf,
}

impl Site {
	/// Open the site whose collection root is `top`
	pub fn open(top: &Path) -> QfsResult<Site> {
		let site = Site { top: top.to_path_buf() };
		if !site.qfs_dir().is_dir() {
			return Err(QfsError::Config {
				message: format!("{} is not a qfs site (no .qfs directory)", top.display()),
			});
		}
		Ok(site)
	}

	/// Walk upward from `start` to the nearest directory containing `.qfs`
	pub fn discover(start: &Path) -> QfsResult<Site> {
		let mut cur = Some(start);
		while let Some(dir) = cur {
			if dir.join(".qfs").is_dir() {
				return Ok(Site { top: dir.to_path_buf() });
			}
			cur = dir.parent();
		}
		Err(QfsError::Config {
			message: format!("no .qfs directory at or above {}", start.display()),
		})
	}

	/// Create the `.qfs` skeleton for a new site. The filters directory is
	/// not created here; it appears when a pull installs filters or the
	/// user writes one.
	pub async fn create(top: &Path, repo_url: &str, site_name: &str) -> QfsResult<Site> {
		let qfs = top.join(".qfs");
		for dir in [qfs.clone(), qfs.join("db")] {
			tokio::fs::create_dir_all(&dir).await.map_err(|e| QfsError::io(dir.clone(), e))?;
		}
		tokio::fs::write(qfs.join(REPO_CONFIG), format!("{}\n", repo_url))
			.await
			.map_err(|e| QfsError::io(qfs.join(REPO_CONFIG), e))?;
		tokio::fs::write(qfs.join(SITE_CONFIG), format!("{}\n", site_name))
			.await
			.map_err(|e| QfsError::io(qfs.join(SITE_CONFIG), e))?;
		Ok(Site { top: top.to_path_buf() })
	}

	pub fn top(&self) -> &Path {
		&self.top
	}

	pub fn qfs_dir(&self) -> PathBuf {
		self.top.join(".qfs")
	}

	pub fn filters_dir(&self) -> PathBuf {
		self.qfs_dir().join("filters")
	}

	pub fn filter_path(&self, name: &str) -> PathBuf {
		self.filters_dir().join(name)
	}

	pub fn db_path(&self, name: &str) -> PathBuf {
		self.qfs_dir().join("db").join(name)
	}

	pub fn marker_path(&self, name: &str) -> PathBuf {
		self.qfs_dir().join(name)
	}

	async fn read_config(&self, name: &str) -> QfsResult<String> {
		let path = self.qfs_dir().join(name);
		let text = tokio::fs::read_to_string(&path).await.map_err(|e| QfsError::Config {
			message: format!("cannot read {}: {}", path.display(), e),
		})?;
		let value = text.trim();
		if value.is_empty() {
			return Err(QfsError::Config { message: format!("{} is empty", path.display()) });
		}
		Ok(value.to_string())
	}

	/// Contents of `.qfs/repo`: the repository URL
	pub async fn repo_url(&self) -> QfsResult<String> {
		self.read_config(REPO_CONFIG).await
	}

	/// Contents of `.qfs/site`: this site's name
	pub async fn site_name(&self) -> QfsResult<String> {
		let name = self.read_config(SITE_CONFIG).await?;
		if name == REPO_DB_NAME || name.contains('/') {
			return Err(QfsError::Config { message: format!("invalid site name {:?}", name) });
		}
		Ok(name)
	}

	/// The cached repository database; absent means never pulled
	pub async fn load_cached_repo_db(&self) -> QfsResult<Database> {
		let path = self.db_path(REPO_DB_NAME);
		match tokio::fs::try_exists(&path).await {
			Ok(true) => Database::read(&path).await,
			_ => Ok(Database::new(DbFlavor::Repo)),
		}
	}

	/// Stamp of the repository object the cached copy came from
	pub async fn cached_repo_db_origin(&self) -> Option<i64> {
		let meta = tokio::fs::symlink_metadata(self.db_path(REPO_DB_NAME)).await.ok()?;
		Some(mtime_ms_from_metadata(&meta))
	}

	/// Install repository database content into the cache slot, recording
	/// the origin object's last-modified stamp
	pub async fn save_cached_repo_db(&self, body: &[u8], origin_ms: i64) -> QfsResult<()> {
		let tmp = self.db_path(&format!("{}.tmp", REPO_DB_NAME));
		if let Some(dir) = tmp.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
		}
		tokio::fs::write(&tmp, body).await.map_err(|e| QfsError::io(tmp.clone(), e))?;
		set_mtime_ms(&tmp, origin_ms).map_err(|e| QfsError::io(tmp.clone(), e))?;
		let final_path = self.db_path(REPO_DB_NAME);
		tokio::fs::rename(&tmp, &final_path)
			.await
			.map_err(|e| QfsError::io(final_path, e))?;
		Ok(())
	}

	/// Record the most recent push or pull diff text
	pub async fn write_marker(&self, name: &str, text: &str) -> QfsResult<()> {
		let path = self.marker_path(name);
		tokio::fs::write(&path, text).await.map_err(|e| QfsError::io(path, e))
	}

	pub async fn remove_marker(&self, name: &str) -> QfsResult<()> {
		let path = self.marker_path(name);
		match tokio::fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(QfsError::io(path, e)),
		}
	}
}


// vim: ts=4
