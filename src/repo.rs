//! Repository adapter
//!
//! A repository is an object-store prefix holding the canonical state of a
//! collection. Every logical path is encoded into its object key together
//! with its type, modification time, and permissions or link target, so the
//! whole tree can be recovered from a ListObjectsV2 walk alone; object
//! listings carry millisecond last-modified stamps, per-object metadata
//! reads do not.
//!
//! Key grammar: `<prefix>/<path>@<type>,<mtime-ms>,<extra>` where `@` inside
//! the path or the extra field is doubled, type is one of `d`, `f`, `l`,
//! and extra is four-digit octal permissions (d, f) or the link target (l).
//! Zero-byte objects stand in for directories and links. The busy marker
//! `<prefix>/.qfs/busy` is a literal key outside the grammar.

use crate::concurrent::{first_error, run_pool};
use crate::db::{Database, DbFlavor};
use crate::error::{QfsError, QfsResult};
use crate::filter::Filter;
use crate::logging::{debug, info};
use crate::store::{list_all, ObjectMeta, ObjectStore, ObjectVersion};
use crate::types::{FileInfo, FileType};
use crate::util::{parent, parse_octal};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Logical paths reserved for qfs control state
pub const QFS_DIR: &str = ".qfs";
pub const BUSY_PATH: &str = ".qfs/busy";
pub const DB_DIR: &str = ".qfs/db";
pub const REPO_DB_NAME: &str = "repo";
pub const FILTERS_DIR: &str = ".qfs/filters";

/// Current wall-clock time in milliseconds
pub fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// The (path, type, mtime, extra) tuple recovered from an encoded key
#[derive(Clone, PartialEq, Debug)]
pub struct ParsedKey {
	pub path: String,
	pub ftype: FileType,
	pub mtime_ms: i64,
	pub extra: String,
}

fn escape(s: &str) -> String {
	s.replace('@', "@@")
}

fn unescape(s: &str) -> Option<String> {
	let mut out = String::with_capacity(s.len());
	let mut chars = s.chars();
	while let Some(c) = chars.next() {
		if c == '@' {
			// A lone @ inside a field breaks the grammar
			if chars.next() != Some('@') {
				return None;
			}
			out.push('@');
		} else {
			out.push(c);
		}
	}
	Some(out)
}

/// Position of the first `@` that is not part of an `@@` pair
fn separator(s: &str) -> Option<usize> {
	let bytes = s.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'@' {
			if i + 1 < bytes.len() && bytes[i + 1] == b'@' {
				i += 2;
				continue;
			}
			return Some(i);
		}
		i += 1;
	}
	None
}

/// Encode a logical path into its object key (without the repo prefix)
pub fn encode_key(path: &str, ftype: FileType, mtime_ms: i64, extra: &str) -> String {
	format!("{}@{},{},{}", escape(path), ftype.as_char(), mtime_ms, escape(extra))
}

/// Decode a key (prefix already removed); `None` means the key does not
/// match the grammar and is an extra key
pub fn decode_key(key: &str) -> Option<ParsedKey> {
	let sep = separator(key)?;
	let path = unescape(&key[..sep])?;
	if path.is_empty() || path.starts_with('/') {
		return None;
	}
	let rest = &key[sep + 1..];
	let mut it = rest.splitn(3, ',');
	let type_field = it.next()?;
	let mtime_field = it.next()?;
	let extra_field = it.next()?;
	let mut type_chars = type_field.chars();
	let ftype = match (type_chars.next(), type_chars.next()) {
		(Some('d'), None) => FileType::Directory,
		(Some('f'), None) => FileType::File,
		(Some('l'), None) => FileType::Link,
		_ => return None,
	};
	let mtime_ms: i64 = mtime_field.parse().ok()?;
	let extra = unescape(extra_field)?;
	match ftype {
		FileType::Directory | FileType::File => {
			parse_octal(&extra)?;
		}
		FileType::Link => {
			if extra.is_empty() {
				return None;
			}
		}
		_ => unreachable!(),
	}
	Some(ParsedKey { path, ftype, mtime_ms, extra })
}

/// Result of a full repository scan
pub struct RepoScan {
	/// Repo-flavored database of every decodable, current key
	pub db: Database,
	/// Duplicates, grammar violations, and filtered-out keys
	pub extra_keys: Vec<String>,
}

/// Object-store-backed repository; clones share the client
#[derive(Clone)]
pub struct Repo {
	store: Arc<dyn ObjectStore>,
	prefix: String,
}

impl Repo {
	pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Repo {
		Repo { store, prefix: prefix.trim_matches('/').to_string() }
	}

	pub fn store(&self) -> &Arc<dyn ObjectStore> {
		&self.store
	}

	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	/// Absolute key for an encoded or literal tail
	pub fn full_key(&self, tail: &str) -> String {
		if self.prefix.is_empty() {
			tail.to_string()
		} else {
			format!("{}/{}", self.prefix, tail)
		}
	}

	/// The prefix every data and control key lives under, with trailing `/`
	fn root_prefix(&self) -> String {
		if self.prefix.is_empty() {
			String::new()
		} else {
			format!("{}/", self.prefix)
		}
	}

	/// Key a record is (or will be) stored under
	pub fn key_for(&self, info: &FileInfo) -> String {
		let extra = match info.ftype {
			FileType::Link => info.special.clone(),
			_ => info.mode_octal(),
		};
		self.full_key(&encode_key(&info.path, info.ftype, info.mtime_ms, &extra))
	}

	fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
		if self.prefix.is_empty() {
			Some(key)
		} else {
			key.strip_prefix(&self.prefix).and_then(|r| r.strip_prefix('/'))
		}
	}

	// === Busy marker ===

	pub fn busy_key(&self) -> String {
		self.full_key(BUSY_PATH)
	}

	pub async fn is_busy(&self) -> QfsResult<bool> {
		Ok(self.store.head(&self.busy_key()).await?.is_some())
	}

	pub async fn mark_busy(&self) -> QfsResult<()> {
		info!("marking repository busy");
		self.store.put_bytes(&self.busy_key(), Vec::new()).await
	}

	pub async fn clear_busy(&self) -> QfsResult<()> {
		info!("clearing repository busy marker");
		self.store.delete(&[self.busy_key()]).await
	}

	// === Full scan ===

	/// List the whole prefix with parallel paginators and decode it into a
	/// repo-flavored database plus the keys eligible for cleanup.
	///
	/// When `filters` is non-empty, decodable keys excluded by the filter
	/// set are reported as extra keys instead of database records.
	pub async fn scan(&self, filters: &[Filter], workers: usize) -> QfsResult<RepoScan> {
		let root = self.root_prefix();
		let first = self.store.list_delimited(&root, "/").await?;
		let collected: Arc<Mutex<Vec<ObjectMeta>>> = Arc::new(Mutex::new(first.objects));

		let store = Arc::clone(&self.store);
		let sink = Arc::clone(&collected);
		let errors = run_pool(first.prefixes, workers, move |part: String| {
			let store = Arc::clone(&store);
			let sink = Arc::clone(&sink);
			async move {
				let metas = list_all(store.as_ref(), &part).await?;
				debug!("partition {} holds {} keys", part, metas.len());
				sink.lock().await.extend(metas);
				Ok(())
			}
		})
		.await;
		first_error(errors)?;

		let metas = match Arc::try_unwrap(collected) {
			Ok(m) => m.into_inner(),
			Err(arc) => arc.lock().await.drain(..).collect(),
		};
		self.decode_listing(metas, filters)
	}

	fn decode_listing(&self, metas: Vec<ObjectMeta>, filters: &[Filter]) -> QfsResult<RepoScan> {
		let mut extra_keys = Vec::new();
		let mut best: HashMap<String, (ParsedKey, ObjectMeta)> = HashMap::new();

		for meta in metas {
			let tail = match self.strip_prefix(&meta.key) {
				Some(t) => t.to_string(),
				None => continue,
			};
			if tail == BUSY_PATH {
				continue;
			}
			let parsed = match decode_key(&tail) {
				Some(p) => p,
				None => {
					extra_keys.push(meta.key.clone());
					continue;
				}
			};
			if crate::util::is_under(&parsed.path, DB_DIR) {
				// Database objects are control state, not collection data
				continue;
			}
			if !filters.is_empty() {
				let is_file = parsed.ftype == FileType::File;
				let v = crate::filter::check_all(filters, &parsed.path, is_file)?;
				if !v.included {
					extra_keys.push(meta.key.clone());
					continue;
				}
			}
			match best.get(&parsed.path) {
				Some((_, old_meta)) if old_meta.last_modified_ms >= meta.last_modified_ms => {
					extra_keys.push(meta.key.clone());
				}
				Some((old_parsed, _)) => {
					let old_key = self.full_key(&encode_key(
						&old_parsed.path,
						old_parsed.ftype,
						old_parsed.mtime_ms,
						&old_parsed.extra,
					));
					extra_keys.push(old_key);
					best.insert(parsed.path.clone(), (parsed, meta));
				}
				None => {
					best.insert(parsed.path.clone(), (parsed, meta));
				}
			}
		}

		let mut db = Database::new(DbFlavor::Repo);
		for (_, (parsed, meta)) in best {
			db.insert(record_from_key(&parsed, &meta));
		}
		synthesize_ancestors(&mut db);
		Ok(RepoScan { db, extra_keys })
	}

	// === Data object I/O ===

	/// Upload one record's content; directories and links become zero-byte
	/// objects
	pub async fn store_record(&self, local_root: &Path, info: &FileInfo) -> QfsResult<()> {
		let key = self.key_for(info);
		match info.ftype {
			FileType::File => {
				let src = if info.path == "." {
					local_root.to_path_buf()
				} else {
					local_root.join(&info.path)
				};
				self.store.put_file(&key, &src).await
			}
			FileType::Directory | FileType::Link => self.store.put_bytes(&key, Vec::new()).await,
			_ => Err(QfsError::other(format!(
				"cannot store special file {} in a repository",
				info.path
			))),
		}
	}

	/// Delete the keys for a batch of records
	pub async fn remove_records(&self, records: &[FileInfo]) -> QfsResult<()> {
		let keys: Vec<String> = records.iter().map(|r| self.key_for(r)).collect();
		self.store.delete(&keys).await
	}

	pub async fn remove_keys(&self, keys: &[String]) -> QfsResult<()> {
		self.store.delete(keys).await
	}

	/// Fetch a file-typed record's body to a local path
	pub async fn fetch_record(&self, info: &FileInfo, dest: &Path) -> QfsResult<()> {
		self.store.get_to_file(&self.key_for(info), dest).await
	}

	// === Databases and filters on the repository ===

	fn db_path(name: &str) -> String {
		format!("{}/{}", DB_DIR, name)
	}

	/// Locate the current database object for `name`, newest stamp winning
	pub async fn find_db(&self, name: &str) -> QfsResult<Option<(String, ObjectMeta)>> {
		let probe = self.full_key(&format!("{}@", escape(&Self::db_path(name))));
		let metas = list_all(self.store.as_ref(), &probe).await?;
		let mut newest: Option<(String, ObjectMeta)> = None;
		for meta in metas {
			let tail = match self.strip_prefix(&meta.key) {
				Some(t) => t,
				None => continue,
			};
			let parsed = match decode_key(tail) {
				Some(p) => p,
				None => continue,
			};
			if parsed.path != Self::db_path(name) || parsed.ftype != FileType::File {
				continue;
			}
			match &newest {
				Some((_, cur)) if cur.last_modified_ms >= meta.last_modified_ms => {}
				_ => newest = Some((meta.key.clone(), meta)),
			}
		}
		Ok(newest)
	}

	/// Download a database stored on the repository
	pub async fn download_db(&self, name: &str) -> QfsResult<Option<(Vec<u8>, ObjectMeta)>> {
		match self.find_db(name).await? {
			Some((key, meta)) => {
				let body = self.store.get(&key).await?;
				Ok(Some((body, meta)))
			}
			None => Ok(None),
		}
	}

	/// Upload a database, replacing any previous object for `name`.
	/// Returns the metadata of the uploaded object.
	pub async fn upload_db(&self, name: &str, db: &Database) -> QfsResult<ObjectMeta> {
		let old: Vec<String> =
			self.find_db(name).await?.map(|(key, _)| vec![key]).unwrap_or_default();
		let body = db.serialize();
		let key = self.full_key(&encode_key(
			&Self::db_path(name),
			FileType::File,
			now_ms(),
			"0644",
		));
		self.store.put_bytes(&key, body).await?;
		if !old.is_empty() && old[0] != key {
			self.store.delete(&old).await?;
		}
		self.store
			.head(&key)
			.await?
			.ok_or_else(|| QfsError::store_msg(format!("uploaded database vanished: {}", key)))
	}

	/// Current filter objects on the repository: name to key, newest wins
	pub async fn list_filters(&self) -> QfsResult<Vec<(String, String)>> {
		let probe = self.full_key(&format!("{}/", FILTERS_DIR));
		let metas = list_all(self.store.as_ref(), &probe).await?;
		let mut newest: HashMap<String, (String, i64)> = HashMap::new();
		for meta in metas {
			let tail = match self.strip_prefix(&meta.key) {
				Some(t) => t,
				None => continue,
			};
			let parsed = match decode_key(tail) {
				Some(p) => p,
				None => continue,
			};
			if parsed.ftype != FileType::File {
				continue;
			}
			let name = match parsed.path.strip_prefix(&format!("{}/", FILTERS_DIR)) {
				Some(n) if !n.is_empty() && !n.contains('/') => n.to_string(),
				_ => continue,
			};
			match newest.get(&name) {
				Some((_, cur)) if *cur >= meta.last_modified_ms => {}
				_ => {
					newest.insert(name, (meta.key.clone(), meta.last_modified_ms));
				}
			}
		}
		let mut out: Vec<(String, String)> =
			newest.into_iter().map(|(name, (key, _))| (name, key)).collect();
		out.sort();
		Ok(out)
	}

	/// Fetch every repository filter into `dir`, as siblings, so `:read:`
	/// directives between them resolve. Returns the fetched names.
	pub async fn download_filters(&self, dir: &Path) -> QfsResult<Vec<String>> {
		let filters = self.list_filters().await?;
		let mut names = Vec::with_capacity(filters.len());
		for (name, key) in filters {
			self.store.get_to_file(&key, &dir.join(&name)).await?;
			names.push(name);
		}
		Ok(names)
	}

	// === Versions ===

	/// Every stored version of a logical path
	pub async fn versions_of(&self, path: &str) -> QfsResult<Vec<ObjectVersion>> {
		let probe = self.full_key(&format!("{}@", escape(path)));
		let mut versions = self.store.list_versions(&probe).await?;
		versions.retain(|v| {
			self.strip_prefix(&v.key)
				.and_then(decode_key)
				.map(|p| p.path == path)
				.unwrap_or(false)
		});
		versions.sort_by_key(|v| v.last_modified_ms);
		Ok(versions)
	}

	/// Fetch the newest (or a specific) version of a logical path
	pub async fn fetch_version(
		&self,
		path: &str,
		version_id: Option<&str>,
		dest: &Path,
	) -> QfsResult<()> {
		let versions = self.versions_of(path).await?;
		let chosen = match version_id {
			Some(id) => versions.iter().find(|v| v.version_id == id),
			None => versions.iter().rev().find(|v| !v.delete_marker),
		};
		match chosen {
			Some(v) if !v.delete_marker => {
				self.store.get_version(&v.key, &v.version_id, dest).await
			}
			Some(_) => Err(QfsError::other(format!("{}: version is a delete marker", path))),
			None => Err(QfsError::other(format!("{}: no such version", path))),
		}
	}
}

fn record_from_key(parsed: &ParsedKey, meta: &ObjectMeta) -> FileInfo {
	let (mode, special) = match parsed.ftype {
		FileType::Link => (0o777, parsed.extra.clone()),
		_ => (parse_octal(&parsed.extra).unwrap_or(0o644), String::new()),
	};
	FileInfo {
		path: parsed.path.clone(),
		ftype: parsed.ftype,
		mtime_ms: parsed.mtime_ms,
		size: if parsed.ftype == FileType::File { meta.size } else { 0 },
		mode,
		uid: 0,
		gid: 0,
		special,
		dev: 0,
		s3_time_ms: Some(meta.last_modified_ms),
	}
}

/// Insert directory records for ancestors present only as common prefixes
fn synthesize_ancestors(db: &mut Database) {
	let mut missing: Vec<String> = Vec::new();
	for path in db.paths() {
		let mut cur = parent(path);
		while let Some(p) = cur {
			if !db.contains(p) && !missing.iter().any(|m| m == p) {
				missing.push(p.to_string());
			}
			cur = parent(p);
		}
	}
	for path in missing {
		db.insert(FileInfo {
			path,
			ftype: FileType::Directory,
			mtime_ms: 0,
			size: 0,
			mode: 0o755,
			uid: 0,
			gid: 0,
			special: String::new(),
			dev: 0,
			s3_time_ms: Some(0),
		});
	}
}


// vim: ts=4
