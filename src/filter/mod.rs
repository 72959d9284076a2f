//! Path filter language and matcher
//!
//! A filter is an ordered collection of include/exclude/prune rules plus at
//! most one junk regex. Every operation that walks a tree consults a filter
//! set to decide, per path, whether the path participates. Rules target a
//! full path, a basename (the `*/name` form), or a regex applied to the
//! basename.
//!
//! Matching walks from the full path up through each ancestor; the longest
//! matching ancestor wins, with Prune > Junk > Include > Exclude precedence
//! at equal length. Prune overrides any deeper include or exclude. Junk
//! applies only to the leaf basename of regular files.

mod parse;

pub use parse::parse_filter_file;

use crate::error::FilterError;
use crate::util::{basename, parent};
use regex::Regex;
use std::collections::HashMap;

/// Which part of a filter decided a path's fate
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Group {
	Default,
	Include,
	Exclude,
	Prune,
	Junk,
}

/// What a rule matches against
#[derive(Clone, Debug)]
pub enum RuleKind {
	/// Full relative path, e.g. `a/b/c`
	Path(String),
	/// Any path whose basename equals this, written `*/name`
	Base(String),
	/// Regex applied to the basename
	Pattern(Regex),
}

/// One include/exclude/prune rule
#[derive(Clone, Debug)]
pub struct Rule {
	pub kind: RuleKind,
	pub group: Group,
}

/// The outcome of checking one path
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Verdict {
	pub included: bool,
	pub group: Group,
}

/// A single filter: ordered rules, at most one junk regex, and an optional
/// explicit default
#[derive(Clone, Debug, Default)]
pub struct Filter {
	path_rules: HashMap<String, Group>,
	base_rules: HashMap<String, Group>,
	pattern_rules: Vec<(Regex, Group)>,
	junk: Option<Regex>,
	default_include: Option<bool>,
	has_include: bool,
	has_implicit_include: bool,
}

impl Filter {
	pub fn new() -> Filter {
		Filter::default()
	}

	/// Add a rule; `*/name` lines arrive here already classified as Base
	pub fn add_rule(&mut self, kind: RuleKind, group: Group) {
		debug_assert!(matches!(group, Group::Include | Group::Exclude | Group::Prune));
		if group == Group::Include {
			self.has_include = true;
			if !matches!(kind, RuleKind::Path(_)) {
				self.has_implicit_include = true;
			}
		}
		match kind {
			RuleKind::Path(p) => {
				// Include beats Exclude when both rules name the same path
				let entry = self.path_rules.entry(p).or_insert(group);
				if resolve_same_length(*entry, group) == group {
					*entry = group;
				}
			}
			RuleKind::Base(b) => {
				let entry = self.base_rules.entry(b).or_insert(group);
				if resolve_same_length(*entry, group) == group {
					*entry = group;
				}
			}
			RuleKind::Pattern(re) => self.pattern_rules.push((re, group)),
		}
	}

	/// Convenience used by the CLI flag plumbing
	pub fn add_path(&mut self, path: &str, group: Group) {
		if let Some(base) = path.strip_prefix("*/") {
			self.add_rule(RuleKind::Base(base.to_string()), group);
		} else {
			self.add_rule(RuleKind::Path(path.to_string()), group);
		}
	}

	pub fn add_pattern(&mut self, pattern: &str, group: Group) -> Result<(), FilterError> {
		let re = compile(pattern)?;
		self.add_rule(RuleKind::Pattern(re), group);
		Ok(())
	}

	/// Set the junk regex; a filter may have only one
	pub fn set_junk(&mut self, pattern: &str) -> Result<(), FilterError> {
		if self.junk.is_some() {
			return Err(FilterError::DuplicateJunk);
		}
		self.junk = Some(compile(pattern)?);
		Ok(())
	}

	/// Explicitly set the default verdict (the `.` line under a group)
	pub fn set_default_include(&mut self, include: bool) {
		self.default_include = Some(include);
	}

	pub fn junk(&self) -> Option<&Regex> {
		self.junk.as_ref()
	}

	/// True when the filter contains base or pattern include rules, which do
	/// not implicitly include the ancestors of a match
	pub fn has_implicit_includes(&self) -> bool {
		self.has_implicit_include
	}

	/// A copy retaining only prune rules and the junk regex, defaulting to
	/// include. Push traversals use this so paths outside the current filter
	/// but previously recorded stay tracked.
	pub fn prune_only(&self) -> Filter {
		let mut f = Filter::new();
		for (p, g) in &self.path_rules {
			if *g == Group::Prune {
				f.path_rules.insert(p.clone(), Group::Prune);
			}
		}
		for (b, g) in &self.base_rules {
			if *g == Group::Prune {
				f.base_rules.insert(b.clone(), Group::Prune);
			}
		}
		for (re, g) in &self.pattern_rules {
			if *g == Group::Prune {
				f.pattern_rules.push((re.clone(), Group::Prune));
			}
		}
		f.junk = self.junk.clone();
		f.default_include = Some(true);
		f
	}

	/// All groups a single component matches, Path rules first
	fn component_group(&self, component: &str) -> Option<Group> {
		let base = basename(component);
		let mut found: Option<Group> = None;
		if let Some(g) = self.path_rules.get(component) {
			found = Some(*g);
		}
		if let Some(g) = self.base_rules.get(base) {
			found = Some(match found {
				Some(prev) => resolve_same_length(prev, *g),
				None => *g,
			});
		}
		for (re, g) in &self.pattern_rules {
			if re.is_match(base) {
				found = Some(match found {
					Some(prev) => resolve_same_length(prev, *g),
					None => *g,
				});
			}
		}
		found
	}

	fn pruned(&self, path: &str) -> bool {
		let mut cur = Some(path);
		while let Some(p) = cur {
			if p == "." {
				break;
			}
			let base = basename(p);
			if self.path_rules.get(p) == Some(&Group::Prune)
				|| self.base_rules.get(base) == Some(&Group::Prune)
				|| self.pattern_rules.iter().any(|(re, g)| *g == Group::Prune && re.is_match(base))
			{
				return true;
			}
			cur = parent(p);
		}
		false
	}

	/// Decide whether `path` participates. `is_file` must be true only for
	/// regular files; the junk regex never applies to anything else.
	pub fn check(&self, path: &str, is_file: bool) -> Result<Verdict, FilterError> {
		if path.starts_with('/') {
			return Err(FilterError::AbsolutePath { path: path.to_string() });
		}

		if self.pruned(path) {
			return Ok(Verdict { included: false, group: Group::Prune });
		}

		if is_file {
			if let Some(junk) = &self.junk {
				if junk.is_match(basename(path)) {
					return Ok(Verdict { included: false, group: Group::Junk });
				}
			}
		}

		// Longest matching ancestor wins
		let mut cur = Some(path);
		while let Some(p) = cur {
			if p == "." {
				break;
			}
			match self.component_group(p) {
				Some(Group::Include) => {
					return Ok(Verdict { included: true, group: Group::Include })
				}
				Some(Group::Exclude) => {
					return Ok(Verdict { included: false, group: Group::Exclude })
				}
				_ => {}
			}
			cur = parent(p);
		}

		let included = self.default_include.unwrap_or(!self.has_include);
		Ok(Verdict { included, group: Group::Default })
	}
}

/// Precedence at equal path length: Prune > Junk > Include > Exclude
fn resolve_same_length(a: Group, b: Group) -> Group {
	fn rank(g: Group) -> u8 {
		match g {
			Group::Prune => 4,
			Group::Junk => 3,
			Group::Include => 2,
			Group::Exclude => 1,
			Group::Default => 0,
		}
	}
	if rank(b) > rank(a) {
		b
	} else {
		a
	}
}

/// Combine filters by intersection: a path is included iff every filter
/// includes it. The verdict of the first excluding filter is reported.
pub fn check_all(filters: &[Filter], path: &str, is_file: bool) -> Result<Verdict, FilterError> {
	let mut group = Group::Default;
	for f in filters {
		let v = f.check(path, is_file)?;
		if !v.included {
			return Ok(v);
		}
		if v.group == Group::Include {
			group = Group::Include;
		}
	}
	Ok(Verdict { included: true, group })
}

fn compile(pattern: &str) -> Result<Regex, FilterError> {
	Regex::new(pattern).map_err(|e| FilterError::BadRegex {
		pattern: pattern.to_string(),
		message: e.to_string(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn filter_with(rules: &[(&str, Group)]) -> Filter {
		let mut f = Filter::new();
		for (path, group) in rules {
			f.add_path(path, *group);
		}
		f
	}

	#[test]
	fn test_empty_filter_includes_everything() {
		let f = Filter::new();
		assert!(f.check("a/b/c", true).unwrap().included);
		assert!(f.check(".", false).unwrap().included);
	}

	#[test]
	fn test_default_flips_with_includes() {
		let f = filter_with(&[("a", Group::Include)]);
		assert!(f.check("a/x", true).unwrap().included);
		// Any include rule makes the default exclude
		let v = f.check("b/x", true).unwrap();
		assert!(!v.included);
		assert_eq!(v.group, Group::Default);
	}

	#[test]
	fn test_explicit_default() {
		let mut f = filter_with(&[("a", Group::Include)]);
		f.set_default_include(true);
		assert!(f.check("b/x", true).unwrap().included);
	}

	#[test]
	fn test_longest_ancestor_wins() {
		let f = filter_with(&[("a", Group::Exclude), ("a/b", Group::Include)]);
		assert!(f.check("a/b/c", true).unwrap().included);
		assert!(!f.check("a/z", true).unwrap().included);
	}

	#[test]
	fn test_include_beats_exclude_at_same_length() {
		let f = filter_with(&[("a/b", Group::Exclude), ("a/b", Group::Include)]);
		assert!(f.check("a/b", false).unwrap().included);
	}

	#[test]
	fn test_prune_overrides_deeper_include() {
		let f = filter_with(&[("a", Group::Prune), ("a/b", Group::Include)]);
		let v = f.check("a/b/c", true).unwrap();
		assert!(!v.included);
		assert_eq!(v.group, Group::Prune);
	}

	#[test]
	fn test_base_rule() {
		let f = filter_with(&[("*/node_modules", Group::Prune)]);
		assert_eq!(f.check("x/node_modules/y", true).unwrap().group, Group::Prune);
		assert!(f.check("x/src/y", true).unwrap().included);
	}

	#[test]
	fn test_pattern_rule() {
		let mut f = Filter::new();
		f.add_pattern(r"\.o$", Group::Exclude).unwrap();
		assert!(!f.check("src/a.o", true).unwrap().included);
		assert!(f.check("src/a.c", true).unwrap().included);
	}

	#[test]
	fn test_junk_files_only() {
		let mut f = Filter::new();
		f.set_junk(r"^\.#").unwrap();
		let v = f.check("dir/.#lock", true).unwrap();
		assert!(!v.included);
		assert_eq!(v.group, Group::Junk);
		// Same basename as a directory is not junk
		assert!(f.check("dir/.#lock", false).unwrap().included);
	}

	#[test]
	fn test_junk_beats_include_at_leaf() {
		let mut f = filter_with(&[("dir/.#lock", Group::Include)]);
		f.set_junk(r"^\.#").unwrap();
		assert_eq!(f.check("dir/.#lock", true).unwrap().group, Group::Junk);
	}

	#[test]
	fn test_duplicate_junk_rejected() {
		let mut f = Filter::new();
		f.set_junk("a").unwrap();
		assert!(matches!(f.set_junk("b"), Err(FilterError::DuplicateJunk)));
	}

	#[test]
	fn test_bad_regex() {
		let mut f = Filter::new();
		assert!(matches!(f.set_junk("("), Err(FilterError::BadRegex { .. })));
	}

	#[test]
	fn test_absolute_path_refused() {
		let f = Filter::new();
		assert!(matches!(f.check("/etc", false), Err(FilterError::AbsolutePath { .. })));
	}

	#[test]
	fn test_implicit_include_detection() {
		let mut f = Filter::new();
		f.add_path("a/b", Group::Include);
		assert!(!f.has_implicit_includes());
		f.add_path("*/keep", Group::Include);
		assert!(f.has_implicit_includes());
	}

	#[test]
	fn test_prune_only() {
		let mut f = filter_with(&[("a", Group::Include), ("junkdir", Group::Prune)]);
		f.set_junk(r"~$").unwrap();
		let p = f.prune_only();
		// Include rules gone, default include restored
		assert!(p.check("b/x", true).unwrap().included);
		assert_eq!(p.check("junkdir/x", true).unwrap().group, Group::Prune);
		assert_eq!(p.check("b/x~", true).unwrap().group, Group::Junk);
	}

	#[test]
	fn test_composition_is_intersection() {
		let a = filter_with(&[("x", Group::Exclude)]);
		let b = filter_with(&[("y", Group::Exclude)]);
		for (path, want) in [("x/1", false), ("y/1", false), ("z/1", true)] {
			let fwd = check_all(&[a.clone(), b.clone()], path, true).unwrap().included;
			let rev = check_all(&[b.clone(), a.clone()], path, true).unwrap().included;
			assert_eq!(fwd, want, "{}", path);
			assert_eq!(fwd, rev, "order must not matter for {}", path);
		}
	}
}

// vim: ts=4
