//! Filter file parser
//!
//! A filter file is a sequence of lines. Directive lines switch the current
//! group or carry an inline argument:
//!
//! ```text
//! :include:            # following lines are include rules
//! :exclude:            # following lines are exclude rules
//! :prune:              # following lines are prune rules
//! :junk:<regex>        # junk regex, at most one per filter
//! :pattern:<regex>     # basename regex rule in the current group
//! :read:<file>         # splice in another filter file
//! ```
//!
//! Any other non-empty line is a rule in the current group: `*/name` matches
//! any path ending in `name`, a literal `.` sets the filter's default, and
//! everything else is a full relative path. `#` starts a comment.
//!
//! `:read:` resolves its argument relative to the file containing the
//! directive, not to the process working directory, so filters fetched from
//! the repository into a temporary directory still find their siblings.

use super::{Filter, Group, RuleKind};
use crate::error::FilterError;
use std::fs;
use std::path::Path;

/// Parse a filter file, following `:read:` directives
pub fn parse_filter_file(path: &Path) -> Result<Filter, FilterError> {
	let mut filter = Filter::new();
	read_into(&mut filter, path)?;
	Ok(filter)
}

fn read_into(filter: &mut Filter, path: &Path) -> Result<(), FilterError> {
	let text = fs::read_to_string(path)
		.map_err(|e| FilterError::Read { path: path.to_path_buf(), source: e })?;
	let dir = path.parent().unwrap_or_else(|| Path::new("."));

	let mut group: Option<Group> = None;
	for raw in text.lines() {
		let line = raw.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		if let Some(rest) = line.strip_prefix(':') {
			let (directive, arg) = match rest.find(':') {
				Some(idx) => (&rest[..idx], &rest[idx + 1..]),
				None => {
					return Err(FilterError::UnknownDirective { line: line.to_string() });
				}
			};
			match directive {
				"include" => group = Some(Group::Include),
				"exclude" => group = Some(Group::Exclude),
				"prune" => group = Some(Group::Prune),
				"junk" => filter.set_junk(arg)?,
				"pattern" => {
					let g = group
						.ok_or_else(|| FilterError::UnknownDirective { line: line.to_string() })?;
					filter.add_pattern(arg, g)?;
				}
				"read" => read_into(filter, &dir.join(arg))?,
				_ => {
					return Err(FilterError::UnknownDirective { line: line.to_string() });
				}
			}
			continue;
		}

		let g = group.ok_or_else(|| FilterError::UnknownDirective { line: line.to_string() })?;
		if line == "." {
			match g {
				Group::Include => filter.set_default_include(true),
				Group::Exclude => filter.set_default_include(false),
				// Pruning the root would exclude the whole tree
				_ => {
					return Err(FilterError::UnknownDirective { line: line.to_string() });
				}
			}
		} else if let Some(base) = line.strip_prefix("*/") {
			filter.add_rule(RuleKind::Base(base.to_string()), g);
		} else {
			filter.add_rule(RuleKind::Path(line.to_string()), g);
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	fn write_filter(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
		let p = dir.path().join(name);
		fs::write(&p, text).unwrap();
		p
	}

	#[test]
	fn test_basic_groups() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(
			&tmp,
			"f",
			":include:\ndir1\n:exclude:\ndir1/scratch\n:prune:\n*/node_modules\n",
		);
		let f = parse_filter_file(&p).unwrap();
		assert!(f.check("dir1/a", true).unwrap().included);
		assert!(!f.check("dir1/scratch/a", true).unwrap().included);
		assert_eq!(f.check("dir1/node_modules/x", true).unwrap().group, Group::Prune);
		assert!(!f.check("dir2/a", true).unwrap().included);
	}

	#[test]
	fn test_junk_and_pattern() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(&tmp, "f", ":junk:~$\n:exclude:\n:pattern:\\.tmp$\n");
		let f = parse_filter_file(&p).unwrap();
		assert_eq!(f.check("a/b~", true).unwrap().group, Group::Junk);
		assert_eq!(f.check("a/x.tmp", true).unwrap().group, Group::Exclude);
	}

	#[test]
	fn test_default_dot() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(&tmp, "f", ":include:\ndir1\n.\n");
		let f = parse_filter_file(&p).unwrap();
		// Explicit "." under :include: keeps the default inclusive
		assert!(f.check("other/a", true).unwrap().included);
	}

	#[test]
	fn test_comments_and_blanks() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(&tmp, "f", "# header\n\n:include:\ndir1\n");
		let f = parse_filter_file(&p).unwrap();
		assert!(f.check("dir1", false).unwrap().included);
	}

	#[test]
	fn test_read_resolves_relative_to_filter() {
		let tmp = TempDir::new().unwrap();
		write_filter(&tmp, "child", ":prune:\nbuild\n");
		let p = write_filter(&tmp, "parent", ":read:child\n:include:\nsrc\n");
		// Parse from a different working directory than the filter's home
		let f = parse_filter_file(&p).unwrap();
		assert_eq!(f.check("build/x", true).unwrap().group, Group::Prune);
		assert!(f.check("src/x", true).unwrap().included);
	}

	#[test]
	fn test_unknown_directive() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(&tmp, "f", ":frobnicate:\n");
		assert!(matches!(
			parse_filter_file(&p),
			Err(FilterError::UnknownDirective { .. })
		));
	}

	#[test]
	fn test_rule_before_group_rejected() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(&tmp, "f", "dir1\n");
		assert!(parse_filter_file(&p).is_err());
	}

	#[test]
	fn test_conflicting_junk() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(&tmp, "f", ":junk:a\n:junk:b\n");
		assert!(matches!(parse_filter_file(&p), Err(FilterError::DuplicateJunk)));
	}

	#[test]
	fn test_missing_read_target() {
		let tmp = TempDir::new().unwrap();
		let p = write_filter(&tmp, "f", ":read:absent\n");
		assert!(matches!(parse_filter_file(&p), Err(FilterError::Read { .. })));
	}
}

// vim: ts=4
