//! Structural database diff
//!
//! Walks two databases in sorted path order and emits the operations that
//! turn the `from` tree into the `to` tree, together with the conflict
//! check records the push/pull coordinators verify before applying.
//!
//! Output ordering is what the apply phase depends on: typechange and rm
//! first (deepest rm first so children precede parents), then mkdir
//! (shallowest first), then add and change, then meta changes.

use crate::db::Database;
use crate::error::QfsResult;
use crate::filter::{check_all, Filter};
use crate::types::{FileInfo, FileType};
use crate::util::{depth, is_under};
use std::fmt::Write as _;

/// Diff configuration
#[derive(Clone, Copy, Default)]
pub struct DiffOptions {
	/// Ignore uid/gid differences
	pub no_ownerships: bool,

	/// Ignore devices, pipes, and sockets
	pub no_special: bool,

	/// Ignore directory modification times
	pub no_dir_times: bool,

	/// Either side is a repository database: ownership is unavailable and
	/// directory mtimes come from object-store stamps, so both are ignored
	pub repo_rules: bool,

	/// Emit conflict check records
	pub checks: bool,
}

/// A permission, ownership, or directory-time adjustment
#[derive(Clone, PartialEq, Debug)]
pub enum MetaChange {
	Chmod { path: String, mode: u32 },
	Chown { path: String, uid: u32, gid: u32 },
	Mtime { path: String, mtime_ms: i64 },
}

impl MetaChange {
	pub fn path(&self) -> &str {
		match self {
			MetaChange::Chmod { path, .. }
			| MetaChange::Chown { path, .. }
			| MetaChange::Mtime { path, .. } => path,
		}
	}
}

/// One conflict check: the destination may hold any of these mtimes (or be
/// absent) without conflicting
#[derive(Clone, PartialEq, Debug)]
pub struct Check {
	pub path: String,
	pub mtimes: Vec<i64>,
}

/// The ordered outcome of a diff
#[derive(Clone, Default, Debug)]
pub struct Diff {
	/// Informational; each entry is also present as rm + add/mkdir
	pub typechanges: Vec<String>,

	/// Records to remove, deepest first (from-side records)
	pub rm: Vec<FileInfo>,

	/// Directories to create, shallowest first (to-side records)
	pub mkdir: Vec<FileInfo>,

	/// New non-directory entries (to-side records)
	pub add: Vec<FileInfo>,

	/// Entries whose content changed (to-side records)
	pub change: Vec<FileInfo>,

	pub meta: Vec<MetaChange>,
	pub checks: Vec<Check>,
}

impl Diff {
	pub fn is_empty(&self) -> bool {
		self.rm.is_empty()
			&& self.mkdir.is_empty()
			&& self.add.is_empty()
			&& self.change.is_empty()
			&& self.meta.is_empty()
	}

	/// Total number of operations, excluding checks
	pub fn len(&self) -> usize {
		self.rm.len() + self.mkdir.len() + self.add.len() + self.change.len() + self.meta.len()
	}

	/// One directive per line, in apply order
	pub fn render(&self) -> String {
		let mut out = String::new();
		for path in &self.typechanges {
			let _ = writeln!(out, "typechange {}", path);
		}
		for rec in &self.rm {
			let _ = writeln!(out, "rm {}", rec.path);
		}
		for rec in &self.mkdir {
			let _ = writeln!(out, "mkdir {}", rec.path);
		}
		for rec in &self.add {
			let _ = writeln!(out, "add {}", rec.path);
		}
		for rec in &self.change {
			let _ = writeln!(out, "change {}", rec.path);
		}
		for m in &self.meta {
			match m {
				MetaChange::Chmod { path, mode } => {
					let _ = writeln!(out, "chmod {:04o} {}", mode, path);
				}
				MetaChange::Chown { path, uid, gid } => {
					let _ = writeln!(out, "chown {}:{} {}", uid, gid, path);
				}
				MetaChange::Mtime { path, mtime_ms } => {
					let _ = writeln!(out, "mtime {} {}", mtime_ms, path);
				}
			}
		}
		for c in &self.checks {
			let mut times = String::new();
			for (i, t) in c.mtimes.iter().enumerate() {
				if i > 0 {
					times.push(' ');
				}
				let _ = write!(times, "{}", t);
			}
			let _ = writeln!(out, "check {} - {}", times, c.path);
		}
		out
	}
}

struct Builder {
	options: DiffOptions,
	diff: Diff,
}

/// Compare two databases under a filter set
pub fn diff(
	from: &Database,
	to: &Database,
	filters: &[Filter],
	options: DiffOptions,
) -> QfsResult<Diff> {
	let mut b = Builder { options, diff: Diff::default() };

	let mut a_iter = from.iter().peekable();
	let mut b_iter = to.iter().peekable();
	loop {
		enum Step {
			Removed,
			Added,
			Both,
		}
		let step = match (a_iter.peek(), b_iter.peek()) {
			(None, None) => break,
			(Some(_), None) => Step::Removed,
			(None, Some(_)) => Step::Added,
			(Some((pa, _)), Some((pb, _))) => {
				if pa < pb {
					Step::Removed
				} else if pb < pa {
					Step::Added
				} else {
					Step::Both
				}
			}
		};
		match step {
			Step::Removed => {
				let (_, rec) = a_iter.next().unwrap();
				// Control paths are only ever added or updated through a
				// diff; their absence on one side never deletes them
				if !is_under(&rec.path, crate::repo::QFS_DIR) && b.relevant(rec, filters)? {
					b.removed(rec);
				}
			}
			Step::Added => {
				let (_, rec) = b_iter.next().unwrap();
				if b.relevant(rec, filters)? {
					b.added(rec);
				}
			}
			Step::Both => {
				let (_, old) = a_iter.next().unwrap();
				let (_, new) = b_iter.next().unwrap();
				if b.relevant(new, filters)? {
					b.compare(old, new);
				}
			}
		}
	}

	// rm deepest first so children precede their parents; mkdir the reverse
	b.diff.rm.sort_by(|x, y| {
		depth(&y.path).cmp(&depth(&x.path)).then_with(|| x.path.cmp(&y.path))
	});
	b.diff.mkdir.sort_by(|x, y| {
		depth(&x.path).cmp(&depth(&y.path)).then_with(|| x.path.cmp(&y.path))
	});
	Ok(b.diff)
}

impl Builder {
	/// Filter gate; control paths under .qfs are always diffed, since they
	/// only enter a database deliberately
	fn relevant(&self, rec: &FileInfo, filters: &[Filter]) -> QfsResult<bool> {
		if self.options.no_special && rec.ftype.is_special() {
			return Ok(false);
		}
		if is_under(&rec.path, crate::repo::QFS_DIR) {
			return Ok(true);
		}
		let v = check_all(filters, &rec.path, rec.ftype == FileType::File)?;
		Ok(v.included)
	}

	fn check(&mut self, rec: &FileInfo, mtimes: Vec<i64>) {
		if self.options.checks && rec.ftype == FileType::File {
			let mut mtimes = mtimes;
			mtimes.dedup();
			self.diff.checks.push(Check { path: rec.path.clone(), mtimes });
		}
	}

	fn removed(&mut self, rec: &FileInfo) {
		self.check(rec, vec![rec.mtime_ms]);
		self.diff.rm.push(rec.clone());
	}

	fn added(&mut self, rec: &FileInfo) {
		if rec.ftype == FileType::Directory {
			self.diff.mkdir.push(rec.clone());
		} else {
			self.diff.add.push(rec.clone());
		}
	}

	fn compare(&mut self, old: &FileInfo, new: &FileInfo) {
		if old.ftype != new.ftype {
			self.diff.typechanges.push(new.path.clone());
			self.removed(old);
			self.added(new);
			return;
		}
		if !old.same_content(new) {
			self.check(old, vec![old.mtime_ms, new.mtime_ms]);
			self.diff.change.push(new.clone());
			return;
		}
		if old.mode != new.mode {
			self.check(old, vec![old.mtime_ms, new.mtime_ms]);
			self.diff.meta.push(MetaChange::Chmod { path: new.path.clone(), mode: new.mode });
			return;
		}
		let ownership = !(self.options.no_ownerships || self.options.repo_rules);
		if ownership && (old.uid != new.uid || old.gid != new.gid) {
			self.check(old, vec![old.mtime_ms, new.mtime_ms]);
			self.diff.meta.push(MetaChange::Chown {
				path: new.path.clone(),
				uid: new.uid,
				gid: new.gid,
			});
			return;
		}
		let dir_times = !(self.options.no_dir_times || self.options.repo_rules);
		if dir_times && old.ftype == FileType::Directory && old.mtime_ms != new.mtime_ms {
			self.diff.meta.push(MetaChange::Mtime { path: new.path.clone(), mtime_ms: new.mtime_ms });
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::DbFlavor;

	fn rec(path: &str, ftype: FileType, mtime: i64) -> FileInfo {
		FileInfo {
			path: path.to_string(),
			ftype,
			mtime_ms: mtime,
			size: if ftype == FileType::File { 10 } else { 0 },
			mode: if ftype == FileType::Directory { 0o755 } else { 0o644 },
			uid: 1000,
			gid: 1000,
			special: String::new(),
			dev: 0,
			s3_time_ms: None,
		}
	}

	fn db(records: Vec<FileInfo>) -> Database {
		let mut d = Database::new(DbFlavor::Qfs);
		for r in records {
			d.insert(r);
		}
		d
	}

	fn opts() -> DiffOptions {
		DiffOptions { checks: true, ..DiffOptions::default() }
	}

	#[test]
	fn test_diff_identity_is_empty() {
		let d = db(vec![
			rec(".", FileType::Directory, 1),
			rec("a", FileType::Directory, 2),
			rec("a/f", FileType::File, 3),
		]);
		let result = diff(&d, &d, &[], opts()).unwrap();
		assert!(result.is_empty());
		assert!(result.checks.is_empty());
	}

	#[test]
	fn test_add_and_mkdir_order() {
		let from = db(vec![rec(".", FileType::Directory, 1)]);
		let to = db(vec![
			rec(".", FileType::Directory, 1),
			rec("dir1", FileType::Directory, 2),
			rec("dir1/sub", FileType::Directory, 2),
			rec("dir1/file1", FileType::File, 3),
		]);
		let result = diff(&from, &to, &[], opts()).unwrap();
		let text = result.render();
		assert_eq!(text, "mkdir dir1\nmkdir dir1/sub\nadd dir1/file1\n");
	}

	#[test]
	fn test_rm_children_before_parents() {
		let from = db(vec![
			rec(".", FileType::Directory, 1),
			rec("d", FileType::Directory, 2),
			rec("d/sub", FileType::Directory, 2),
			rec("d/sub/f", FileType::File, 3),
		]);
		let to = db(vec![rec(".", FileType::Directory, 1)]);
		let result = diff(&from, &to, &[], opts()).unwrap();
		let paths: Vec<&str> = result.rm.iter().map(|r| r.path.as_str()).collect();
		assert_eq!(paths, vec!["d/sub/f", "d/sub", "d"]);
		// Only the file gets a removal check
		assert_eq!(result.checks.len(), 1);
		assert_eq!(result.checks[0].path, "d/sub/f");
		assert_eq!(result.checks[0].mtimes, vec![3]);
	}

	#[test]
	fn test_file_change_by_mtime() {
		let from = db(vec![rec("f", FileType::File, 100)]);
		let to = db(vec![rec("f", FileType::File, 200)]);
		let result = diff(&from, &to, &[], opts()).unwrap();
		assert_eq!(result.change.len(), 1);
		assert_eq!(result.checks[0].mtimes, vec![100, 200]);
	}

	#[test]
	fn test_file_change_by_size() {
		let from = db(vec![rec("f", FileType::File, 100)]);
		let mut bigger = rec("f", FileType::File, 100);
		bigger.size = 99;
		let to = db(vec![bigger]);
		let result = diff(&from, &to, &[], opts()).unwrap();
		assert_eq!(result.change.len(), 1);
		// Both sides report the same expected mtime
		assert_eq!(result.checks[0].mtimes, vec![100]);
	}

	#[test]
	fn test_typechange_renders_in_order() {
		let from = db(vec![rec("p", FileType::File, 100)]);
		let to = db(vec![rec("p", FileType::Directory, 200)]);
		let result = diff(&from, &to, &[], opts()).unwrap();
		let text = result.render();
		assert!(text.starts_with("typechange p\nrm p\nmkdir p\n"), "got: {}", text);
	}

	#[test]
	fn test_link_target_change() {
		let mut l1 = rec("ln", FileType::Link, 5);
		l1.special = "a".to_string();
		let mut l2 = rec("ln", FileType::Link, 5);
		l2.special = "b".to_string();
		let result = diff(&db(vec![l1]), &db(vec![l2]), &[], opts()).unwrap();
		assert_eq!(result.change.len(), 1);
		assert_eq!(result.change[0].special, "b");
	}

	#[test]
	fn test_chmod_chown_cascade() {
		let old = rec("f", FileType::File, 100);
		let mut chmod = old.clone();
		chmod.mode = 0o600;
		let result = diff(&db(vec![old.clone()]), &db(vec![chmod]), &[], opts()).unwrap();
		assert_eq!(result.meta, vec![MetaChange::Chmod { path: "f".to_string(), mode: 0o600 }]);

		let mut chown = old.clone();
		chown.uid = 0;
		let result = diff(&db(vec![old.clone()]), &db(vec![chown]), &[], opts()).unwrap();
		assert_eq!(
			result.meta,
			vec![MetaChange::Chown { path: "f".to_string(), uid: 0, gid: 1000 }]
		);

		// Ownership suppressed
		let mut chown = old.clone();
		chown.gid = 0;
		let mut o = opts();
		o.no_ownerships = true;
		let result = diff(&db(vec![old]), &db(vec![chown]), &[], o).unwrap();
		assert!(result.is_empty());
	}

	#[test]
	fn test_dir_mtime_policy() {
		let old = rec("d", FileType::Directory, 100);
		let new = rec("d", FileType::Directory, 200);

		let result = diff(&db(vec![old.clone()]), &db(vec![new.clone()]), &[], opts()).unwrap();
		assert_eq!(
			result.meta,
			vec![MetaChange::Mtime { path: "d".to_string(), mtime_ms: 200 }]
		);

		let mut o = opts();
		o.no_dir_times = true;
		let result = diff(&db(vec![old.clone()]), &db(vec![new.clone()]), &[], o).unwrap();
		assert!(result.is_empty());

		let mut o = opts();
		o.repo_rules = true;
		let result = diff(&db(vec![old]), &db(vec![new]), &[], o).unwrap();
		assert!(result.is_empty());
	}

	#[test]
	fn test_filtered_paths_skipped() {
		let from = db(vec![]);
		let to = db(vec![rec("x/f", FileType::File, 1), rec("y/f", FileType::File, 1)]);
		let mut f = Filter::new();
		f.add_path("x", crate::filter::Group::Prune);
		f.set_default_include(true);
		let result = diff(&from, &to, &[f], opts()).unwrap();
		let paths: Vec<&str> = result.add.iter().map(|r| r.path.as_str()).collect();
		assert_eq!(paths, vec!["y/f"]);
	}

	#[test]
	fn test_control_paths_bypass_filters() {
		let from = db(vec![]);
		let to = db(vec![rec(".qfs/filters/repo", FileType::File, 1)]);
		let mut f = Filter::new();
		f.add_path("dir1", crate::filter::Group::Include);
		let result = diff(&from, &to, &[f], opts()).unwrap();
		assert_eq!(result.add.len(), 1);
	}

	#[test]
	fn test_check_line_format() {
		let from = db(vec![rec("f", FileType::File, 100)]);
		let to = db(vec![rec("f", FileType::File, 200)]);
		let result = diff(&from, &to, &[], opts()).unwrap();
		let text = result.render();
		assert!(text.contains("check 100 200 - f\n"), "got: {}", text);
	}

	#[test]
	fn test_checks_disabled() {
		let from = db(vec![rec("f", FileType::File, 100)]);
		let to = db(vec![rec("f", FileType::File, 200)]);
		let result = diff(&from, &to, &[], DiffOptions::default()).unwrap();
		assert!(result.checks.is_empty());
	}
}

// vim: ts=4
