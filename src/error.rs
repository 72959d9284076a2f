//! Error types for qfs operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result alias used throughout the crate
pub type QfsResult<T> = Result<T, QfsError>;

/// Main error type for qfs operations
///
/// This is the unified error type that encompasses all qfs errors.
/// It contains both direct variants for common failures and nested
/// variants for the filter and database domains.
#[derive(Debug)]
pub enum QfsError {
	/// Missing or malformed site configuration (.qfs/repo, .qfs/site)
	Config { message: String },

	/// Invalid command-line usage (mutually exclusive modes, bad positional)
	Usage { message: String },

	/// Filesystem failure, named by the path it happened on
	Io { path: PathBuf, source: io::Error },

	/// Object store request failure
	Store { message: String, source: Option<Box<dyn Error + Send + Sync>> },

	/// Filter language error (nested)
	Filter(FilterError),

	/// Database format error (nested)
	Db(DbError),

	/// Push/pull aborted after the user declined to override conflicts
	Conflict { paths: Vec<String> },

	/// The repository busy marker is present
	Busy { key: String },

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for QfsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			QfsError::Config { message } => write!(f, "configuration error: {}", message),
			QfsError::Usage { message } => write!(f, "usage error: {}", message),
			QfsError::Io { path, source } => {
				write!(f, "{}: {}", path.display(), source)
			}
			QfsError::Store { message, source } => match source {
				Some(e) => write!(f, "object store: {}: {}", message, e),
				None => write!(f, "object store: {}", message),
			},
			QfsError::Filter(e) => write!(f, "filter: {}", e),
			QfsError::Db(e) => write!(f, "database: {}", e),
			QfsError::Conflict { paths } => {
				write!(f, "conflicts detected on {} path(s); not overridden", paths.len())
			}
			QfsError::Busy { key } => {
				write!(f, "repository is marked busy ({}); a push or pull may be in progress", key)
			}
			QfsError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for QfsError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			QfsError::Io { source, .. } => Some(source),
			QfsError::Filter(e) => Some(e),
			QfsError::Db(e) => Some(e),
			_ => None,
		}
	}
}

impl QfsError {
	/// Wrap an I/O error with the path it occurred on
	pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
		QfsError::Io { path: path.into(), source }
	}

	/// Build a Store variant from a message and an underlying error
	pub fn store<E: Error + Send + Sync + 'static>(message: impl Into<String>, source: E) -> Self {
		QfsError::Store { message: message.into(), source: Some(Box::new(source)) }
	}

	/// Build a Store variant carrying only a message
	pub fn store_msg(message: impl Into<String>) -> Self {
		QfsError::Store { message: message.into(), source: None }
	}

	pub fn other(message: impl Into<String>) -> Self {
		QfsError::Other { message: message.into() }
	}
}

impl From<FilterError> for QfsError {
	fn from(e: FilterError) -> Self {
		QfsError::Filter(e)
	}
}

impl From<DbError> for QfsError {
	fn from(e: DbError) -> Self {
		QfsError::Db(e)
	}
}

impl From<String> for QfsError {
	fn from(e: String) -> Self {
		QfsError::Other { message: e }
	}
}

/// Filter language errors
#[derive(Debug)]
pub enum FilterError {
	/// A `:junk:` or pattern regex failed to compile
	BadRegex { pattern: String, message: String },

	/// More than one `:junk:` directive in a single filter
	DuplicateJunk,

	/// Directive line not understood
	UnknownDirective { line: String },

	/// Filters only operate on relative paths
	AbsolutePath { path: String },

	/// A filter file (or a `:read:` target) could not be loaded
	Read { path: PathBuf, source: io::Error },

	/// Base or pattern include rules without their ancestors; refused by sync
	ImplicitInclude,
}

impl fmt::Display for FilterError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FilterError::BadRegex { pattern, message } => {
				write!(f, "invalid regular expression {:?}: {}", pattern, message)
			}
			FilterError::DuplicateJunk => {
				write!(f, "a filter may contain at most one :junk: directive")
			}
			FilterError::UnknownDirective { line } => {
				write!(f, "unknown directive: {:?}", line)
			}
			FilterError::AbsolutePath { path } => {
				write!(f, "absolute path not allowed: {}", path)
			}
			FilterError::Read { path, source } => {
				write!(f, "cannot read filter {}: {}", path.display(), source)
			}
			FilterError::ImplicitInclude => {
				write!(
					f,
					"filter has base or pattern include rules, which do not include their \
					 ancestor directories; refusing to sync an incoherent tree"
				)
			}
		}
	}
}

impl Error for FilterError {}

/// Database format errors
#[derive(Debug)]
pub enum DbError {
	/// First line is not a recognized format tag
	BadHeader { found: String },

	/// A record line ended before all fields were present
	TruncatedRecord { line: u64 },

	/// A field failed to parse
	BadField { line: u64, field: &'static str, value: String },

	/// Unrecognized file type character
	UnknownType { line: u64, ch: char },
}

impl fmt::Display for DbError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DbError::BadHeader { found } => write!(f, "unrecognized header {:?}", found),
			DbError::TruncatedRecord { line } => write!(f, "line {}: truncated record", line),
			DbError::BadField { line, field, value } => {
				write!(f, "line {}: bad {} field {:?}", line, field, value)
			}
			DbError::UnknownType { line, ch } => {
				write!(f, "line {}: unknown file type character {:?}", line, ch)
			}
		}
	}
}

impl Error for DbError {}


// vim: ts=4
