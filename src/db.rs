//! Flat-file database codec
//!
//! A database is the serialized recursive state of a tree: one record per
//! path, in sorted path order, preceded by a format tag. Two flavors exist:
//! `QFS 1` carries uid/gid, `QFS REPO 1` replaces them with the object
//! store's last-modified timestamp. Databases produced by the legacy qsync
//! v3 tool are readable but never written.
//!
//! Record wire format (NUL separators, one record per line):
//!
//! ```text
//! len[/same] NUL path-suffix NUL type NUL mtime NUL size NUL mode NUL uid NUL gid NUL special
//! ```
//!
//! `len` is the byte length of the full path; `/same`, when present, is the
//! number of leading bytes shared with the previous record's path, and the
//! stored suffix carries only the remainder.

use crate::error::{DbError, QfsError, QfsResult};
use crate::filter::{check_all, Filter, Group};
use crate::types::{FileInfo, FileType};
use std::collections::BTreeMap;
use std::path::Path;

pub const HEADER_QFS: &str = "QFS 1";
pub const HEADER_REPO: &str = "QFS REPO 1";
pub const HEADER_QSYNC_V3: &str = "SYNC_TOOLS_QSYNC_FORMAT_3";

/// Which record layout a database uses
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DbFlavor {
	/// Site flavor: uid and gid fields
	Qfs,
	/// Repository flavor: a single s3-time field instead of uid/gid
	Repo,
}

impl DbFlavor {
	pub fn header(self) -> &'static str {
		match self {
			DbFlavor::Qfs => HEADER_QFS,
			DbFlavor::Repo => HEADER_REPO,
		}
	}
}

/// An ordered set of [`FileInfo`] records keyed by relative path
///
/// The database owns its records; the diff engine and apply phase borrow
/// them. Iteration order is byte-wise path order, which both the writer and
/// the diff merge walk rely on.
#[derive(Clone, Debug)]
pub struct Database {
	pub flavor: DbFlavor,
	records: BTreeMap<String, FileInfo>,
}

impl Database {
	pub fn new(flavor: DbFlavor) -> Database {
		Database { flavor, records: BTreeMap::new() }
	}

	pub fn insert(&mut self, mut info: FileInfo) {
		// Invariant: only regular files carry a size
		if info.ftype != FileType::File {
			info.size = 0;
		}
		self.records.insert(info.path.clone(), info);
	}

	pub fn remove(&mut self, path: &str) -> Option<FileInfo> {
		self.records.remove(path)
	}

	pub fn get(&self, path: &str) -> Option<&FileInfo> {
		self.records.get(path)
	}

	pub fn get_mut(&mut self, path: &str) -> Option<&mut FileInfo> {
		self.records.get_mut(path)
	}

	pub fn contains(&self, path: &str) -> bool {
		self.records.contains_key(path)
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &FileInfo)> {
		self.records.iter()
	}

	pub fn paths(&self) -> impl Iterator<Item = &String> {
		self.records.keys()
	}

	/// Read a database from disk
	pub async fn read(path: &Path) -> QfsResult<Database> {
		let bytes =
			tokio::fs::read(path).await.map_err(|e| QfsError::io(path.to_path_buf(), e))?;
		Database::parse(&bytes, &[])
	}

	/// Read a database, applying a filter set during the load
	pub async fn read_filtered(path: &Path, filters: &[Filter]) -> QfsResult<Database> {
		let bytes =
			tokio::fs::read(path).await.map_err(|e| QfsError::io(path.to_path_buf(), e))?;
		Database::parse(&bytes, filters)
	}

	/// Parse serialized database content
	pub fn parse(bytes: &[u8], filters: &[Filter]) -> QfsResult<Database> {
		let mut lines = bytes.split(|b| *b == b'\n');
		let header_raw = lines.next().unwrap_or(b"");
		let header = String::from_utf8_lossy(header_raw);
		let flavor = match header.as_ref() {
			HEADER_QFS | HEADER_QSYNC_V3 => DbFlavor::Qfs,
			HEADER_REPO => DbFlavor::Repo,
			other => {
				return Err(DbError::BadHeader { found: other.to_string() }.into());
			}
		};

		let mut db = Database::new(flavor);
		let mut prev_path = String::new();
		// Directories dropped by the filter; children under them are skipped
		let mut pruned: Vec<String> = Vec::new();
		let mut lineno: u64 = 1;

		for line in lines {
			lineno += 1;
			if line.is_empty() {
				continue;
			}
			let info = parse_record(line, flavor, &prev_path, lineno)?;
			prev_path = info.path.clone();

			if pruned.iter().any(|d| crate::util::is_under(&info.path, d)) {
				continue;
			}
			if !filters.is_empty() {
				let v = check_all(filters, &info.path, info.ftype == FileType::File)
					.map_err(QfsError::from)?;
				if !v.included {
					if v.group == Group::Prune && info.ftype == FileType::Directory {
						pruned.push(info.path.clone());
					}
					continue;
				}
			}
			db.insert(info);
		}
		Ok(db)
	}

	/// Serialize to bytes in the wire format
	pub fn serialize(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(64 * self.records.len() + 16);
		out.extend_from_slice(self.flavor.header().as_bytes());
		out.push(b'\n');
		let mut prev: &str = "";
		for (path, info) in &self.records {
			let same = common_prefix_len(prev, path);
			if same > 0 {
				out.extend_from_slice(format!("{}/{}", path.len(), same).as_bytes());
			} else {
				out.extend_from_slice(format!("{}", path.len()).as_bytes());
			}
			out.push(0);
			out.extend_from_slice(&path.as_bytes()[same..]);
			out.push(0);
			out.push(info.ftype.as_char() as u8);
			out.push(0);
			out.extend_from_slice(info.mtime_ms.to_string().as_bytes());
			out.push(0);
			out.extend_from_slice(info.size.to_string().as_bytes());
			out.push(0);
			out.extend_from_slice(info.mode_octal().as_bytes());
			out.push(0);
			match self.flavor {
				DbFlavor::Qfs => {
					out.extend_from_slice(info.uid.to_string().as_bytes());
					out.push(0);
					out.extend_from_slice(info.gid.to_string().as_bytes());
					out.push(0);
				}
				DbFlavor::Repo => {
					out.extend_from_slice(
						info.s3_time_ms.unwrap_or(info.mtime_ms).to_string().as_bytes(),
					);
					out.push(0);
				}
			}
			out.extend_from_slice(info.special.as_bytes());
			out.push(b'\n');
			prev = path;
		}
		out
	}

	/// Write the database to disk
	pub async fn write(&self, path: &Path) -> QfsResult<()> {
		if let Some(dir) = path.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| QfsError::io(dir.to_path_buf(), e))?;
		}
		tokio::fs::write(path, self.serialize())
			.await
			.map_err(|e| QfsError::io(path.to_path_buf(), e))
	}
}

fn parse_record(line: &[u8], flavor: DbFlavor, prev_path: &str, lineno: u64) -> QfsResult<FileInfo> {
	let fields: Vec<&[u8]> = line.split(|b| *b == 0).collect();
	let want = match flavor {
		DbFlavor::Qfs => 9,
		DbFlavor::Repo => 8,
	};
	if fields.len() != want {
		return Err(DbError::TruncatedRecord { line: lineno }.into());
	}

	let text = |idx: usize| -> String { String::from_utf8_lossy(fields[idx]).into_owned() };

	let len_field = text(0);
	let (len_str, same) = match len_field.split_once('/') {
		Some((l, s)) => {
			let same: usize = s
				.parse()
				.map_err(|_| DbError::BadField { line: lineno, field: "same", value: len_field.clone() })?;
			(l.to_string(), same)
		}
		None => (len_field.clone(), 0),
	};
	let len: usize = len_str
		.parse()
		.map_err(|_| DbError::BadField { line: lineno, field: "length", value: len_field.clone() })?;
	if same > prev_path.len() || same > len {
		return Err(DbError::BadField { line: lineno, field: "same", value: len_field }.into());
	}

	let mut path_bytes = Vec::with_capacity(len);
	path_bytes.extend_from_slice(&prev_path.as_bytes()[..same]);
	path_bytes.extend_from_slice(fields[1]);
	if path_bytes.len() != len {
		return Err(DbError::BadField { line: lineno, field: "length", value: len_str }.into());
	}
	let path = String::from_utf8_lossy(&path_bytes).into_owned();

	let type_field = text(2);
	let mut type_chars = type_field.chars();
	let ftype = match (type_chars.next(), type_chars.next()) {
		(Some(ch), None) => FileType::from_char(ch)
			.ok_or(DbError::UnknownType { line: lineno, ch })?,
		_ => {
			return Err(DbError::BadField { line: lineno, field: "type", value: type_field }.into());
		}
	};

	let mtime_ms: i64 = text(3)
		.parse()
		.map_err(|_| DbError::BadField { line: lineno, field: "mtime", value: text(3) })?;
	let size: u64 = text(4)
		.parse()
		.map_err(|_| DbError::BadField { line: lineno, field: "size", value: text(4) })?;
	let mode = crate::util::parse_octal(&text(5))
		.ok_or_else(|| DbError::BadField { line: lineno, field: "mode", value: text(5) })?;

	let (uid, gid, s3_time_ms, special) = match flavor {
		DbFlavor::Qfs => {
			let uid: u32 = text(6)
				.parse()
				.map_err(|_| DbError::BadField { line: lineno, field: "uid", value: text(6) })?;
			let gid: u32 = text(7)
				.parse()
				.map_err(|_| DbError::BadField { line: lineno, field: "gid", value: text(7) })?;
			(uid, gid, None, text(8))
		}
		DbFlavor::Repo => {
			let s3_time: i64 = text(6)
				.parse()
				.map_err(|_| DbError::BadField { line: lineno, field: "s3-time", value: text(6) })?;
			(0, 0, Some(s3_time), text(7))
		}
	};

	Ok(FileInfo {
		path,
		ftype,
		mtime_ms,
		size,
		mode,
		uid,
		gid,
		special,
		dev: 0,
		s3_time_ms,
	})
}

fn common_prefix_len(a: &str, b: &str) -> usize {
	let mut n = a.as_bytes().iter().zip(b.as_bytes()).take_while(|(x, y)| x == y).count();
	// Keep the shared prefix on a character boundary of the previous path
	while n > 0 && !a.is_char_boundary(n) {
		n -= 1;
	}
	n
}

#[cfg(test)]
mod tests {
	use super::*;

	fn info(path: &str, ftype: FileType) -> FileInfo {
		FileInfo {
			path: path.to_string(),
			ftype,
			mtime_ms: 1_600_000_000_123,
			size: if ftype == FileType::File { 42 } else { 0 },
			mode: if ftype == FileType::Directory { 0o755 } else { 0o644 },
			uid: 1000,
			gid: 1000,
			special: String::new(),
			dev: 0,
			s3_time_ms: None,
		}
	}

	fn sample() -> Database {
		let mut db = Database::new(DbFlavor::Qfs);
		db.insert(info(".", FileType::Directory));
		db.insert(info("dir1", FileType::Directory));
		db.insert(info("dir1/file1", FileType::File));
		db.insert(info("dir1/file2", FileType::File));
		let mut link = info("dir1/link", FileType::Link);
		link.special = "file1".to_string();
		db.insert(link);
		db
	}

	#[test]
	fn test_round_trip() {
		let db = sample();
		let bytes = db.serialize();
		let back = Database::parse(&bytes, &[]).unwrap();
		assert_eq!(back.len(), db.len());
		for (path, rec) in db.iter() {
			let got = back.get(path).unwrap();
			assert_eq!(got.ftype, rec.ftype);
			assert_eq!(got.mtime_ms, rec.mtime_ms);
			assert_eq!(got.size, rec.size);
			assert_eq!(got.mode, rec.mode);
			assert_eq!(got.special, rec.special);
		}
		// Byte-for-byte stability
		assert_eq!(back.serialize(), bytes);
	}

	#[test]
	fn test_prefix_compression_applied() {
		let db = sample();
		let bytes = db.serialize();
		let text = String::from_utf8_lossy(&bytes);
		// dir1/file2 shares "dir1/file" with dir1/file1
		assert!(text.contains("10/9\0"), "expected shared-prefix record: {:?}", text);
	}

	#[test]
	fn test_repo_flavor_round_trip() {
		let mut db = Database::new(DbFlavor::Repo);
		let mut rec = info("a", FileType::File);
		rec.s3_time_ms = Some(1_700_000_000_000);
		db.insert(rec);
		let back = Database::parse(&db.serialize(), &[]).unwrap();
		assert_eq!(back.flavor, DbFlavor::Repo);
		let got = back.get("a").unwrap();
		assert_eq!(got.s3_time_ms, Some(1_700_000_000_000));
		assert_eq!(got.uid, 0);
	}

	#[test]
	fn test_bad_header() {
		let e = Database::parse(b"NOT A DB\n", &[]).unwrap_err();
		assert!(matches!(e, QfsError::Db(DbError::BadHeader { .. })));
	}

	#[test]
	fn test_qsync_v3_header_accepted() {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(HEADER_QSYNC_V3.as_bytes());
		bytes.push(b'\n');
		let db = Database::parse(&bytes, &[]).unwrap();
		assert_eq!(db.flavor, DbFlavor::Qfs);
		assert!(db.is_empty());
	}

	#[test]
	fn test_truncated_record() {
		let mut bytes = sample().serialize();
		// Chop the last record's tail fields off
		let cut = bytes.len() - 10;
		bytes.truncate(cut);
		bytes.push(b'\n');
		assert!(Database::parse(&bytes, &[]).is_err());
	}

	#[test]
	fn test_unknown_type_char() {
		let mut db = Database::new(DbFlavor::Qfs);
		db.insert(info("a", FileType::File));
		let mut bytes = db.serialize();
		// Flip the type character 'f' to 'q'
		let pos = bytes.iter().position(|b| *b == b'f').unwrap();
		bytes[pos] = b'q';
		let e = Database::parse(&bytes, &[]).unwrap_err();
		assert!(matches!(e, QfsError::Db(DbError::UnknownType { ch: 'q', .. })));
	}

	#[test]
	fn test_filtered_load_drops_pruned_subtrees() {
		let db = sample();
		let mut f = Filter::new();
		f.add_path("dir1", crate::filter::Group::Prune);
		f.set_default_include(true);
		let loaded = Database::parse(&db.serialize(), &[f]).unwrap();
		assert!(loaded.contains("."));
		assert!(!loaded.contains("dir1"));
		assert!(!loaded.contains("dir1/file1"));
	}

	#[test]
	fn test_non_file_size_forced_zero() {
		let mut db = Database::new(DbFlavor::Qfs);
		let mut rec = info("d", FileType::Directory);
		rec.size = 999;
		db.insert(rec);
		assert_eq!(db.get("d").unwrap().size, 0);
	}

	#[test]
	fn test_single_character_paths() {
		let mut db = Database::new(DbFlavor::Qfs);
		db.insert(info("a", FileType::File));
		db.insert(info("b", FileType::File));
		let back = Database::parse(&db.serialize(), &[]).unwrap();
		assert!(back.contains("a") && back.contains("b"));
	}
}

// vim: ts=4
