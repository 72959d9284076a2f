//! Core data types for qfs

use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::UNIX_EPOCH;

/// Kinds of filesystem entries qfs tracks
///
/// Serialized as a single character in databases and repository keys.
#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord, Hash)]
pub enum FileType {
	File,
	Directory,
	Link,
	BlockDev,
	CharDev,
	Pipe,
	Socket,
	Unknown,
}

impl FileType {
	pub fn as_char(self) -> char {
		match self {
			FileType::File => 'f',
			FileType::Directory => 'd',
			FileType::Link => 'l',
			FileType::BlockDev => 'b',
			FileType::CharDev => 'c',
			FileType::Pipe => 'p',
			FileType::Socket => 's',
			FileType::Unknown => 'x',
		}
	}

	pub fn from_char(ch: char) -> Option<FileType> {
		match ch {
			'f' => Some(FileType::File),
			'd' => Some(FileType::Directory),
			'l' => Some(FileType::Link),
			'b' => Some(FileType::BlockDev),
			'c' => Some(FileType::CharDev),
			'p' => Some(FileType::Pipe),
			's' => Some(FileType::Socket),
			'x' => Some(FileType::Unknown),
			_ => None,
		}
	}

	/// Types other than files, directories, and links
	pub fn is_special(self) -> bool {
		!matches!(self, FileType::File | FileType::Directory | FileType::Link)
	}

	pub fn from_metadata(meta: &Metadata) -> FileType {
		let ft = meta.file_type();
		if ft.is_file() {
			FileType::File
		} else if ft.is_dir() {
			FileType::Directory
		} else if ft.is_symlink() {
			FileType::Link
		} else {
			use std::os::unix::fs::FileTypeExt;
			if ft.is_block_device() {
				FileType::BlockDev
			} else if ft.is_char_device() {
				FileType::CharDev
			} else if ft.is_fifo() {
				FileType::Pipe
			} else if ft.is_socket() {
				FileType::Socket
			} else {
				FileType::Unknown
			}
		}
	}
}

impl fmt::Display for FileType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_char())
	}
}

/// The canonical per-path record
///
/// Produced by the traverser or the database reader, compared by the diff
/// engine, consumed by the apply phase. Paths are always relative to the
/// collection root, `/`-separated; `.` denotes the root itself.
#[derive(Clone, PartialEq, Debug)]
pub struct FileInfo {
	pub path: String,
	pub ftype: FileType,

	/// Modification time, milliseconds since the epoch
	pub mtime_ms: i64,

	/// Size in bytes; zero for non-files
	pub size: u64,

	/// Low 12 bits of the POSIX mode
	pub mode: u32,

	pub uid: u32,
	pub gid: u32,

	/// Link target, or "major,minor" for devices; empty otherwise
	pub special: String,

	/// Device id of the containing filesystem
	pub dev: u64,

	/// For repository-sourced entries, the object's last-modified time
	pub s3_time_ms: Option<i64>,
}

impl FileInfo {
	/// Build a record from an lstat of a local path
	pub fn from_metadata(path: &str, meta: &Metadata) -> FileInfo {
		let ftype = FileType::from_metadata(meta);
		let special = match ftype {
			FileType::BlockDev | FileType::CharDev => {
				let rdev = meta.rdev();
				format!("{},{}", dev_major(rdev), dev_minor(rdev))
			}
			_ => String::new(),
		};
		FileInfo {
			path: path.to_string(),
			ftype,
			mtime_ms: mtime_ms_from_metadata(meta),
			size: if ftype == FileType::File { meta.len() } else { 0 },
			mode: meta.mode() & 0o7777,
			uid: meta.uid(),
			gid: meta.gid(),
			special,
			dev: meta.dev(),
			s3_time_ms: None,
		}
	}

	/// Render the permission bits as 4-digit octal
	pub fn mode_octal(&self) -> String {
		format!("{:04o}", self.mode)
	}

	/// File content identity for the diff engine: size and mtime for files,
	/// target for links, "major,minor" for devices
	pub fn same_content(&self, other: &FileInfo) -> bool {
		match self.ftype {
			FileType::File => self.size == other.size && self.mtime_ms == other.mtime_ms,
			FileType::Link | FileType::BlockDev | FileType::CharDev => {
				self.special == other.special
			}
			_ => true,
		}
	}
}

/// Extract the modification time in milliseconds, truncating finer precision
pub fn mtime_ms_from_metadata(meta: &Metadata) -> i64 {
	match meta.modified() {
		Ok(t) => match t.duration_since(UNIX_EPOCH) {
			Ok(d) => d.as_millis() as i64,
			Err(e) => -(e.duration().as_millis() as i64),
		},
		Err(_) => 0,
	}
}

/// Major number of a raw device id
pub fn dev_major(rdev: u64) -> u64 {
	libc::major(rdev as libc::dev_t) as u64
}

/// Minor number of a raw device id
pub fn dev_minor(rdev: u64) -> u64 {
	libc::minor(rdev as libc::dev_t) as u64
}


// vim: ts=4
