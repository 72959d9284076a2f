//! Path arithmetic and safe wrappers around the libc calls qfs needs
//!
//! All qfs paths are `/`-separated strings relative to a collection root,
//! with `.` denoting the root itself. These helpers implement the path
//! arithmetic shared by the filter, database, diff, and apply layers.

use std::ffi::CString;
use std::io;
use std::path::Path;

/// Parent of a relative path; `None` for the root
pub fn parent(path: &str) -> Option<&str> {
	if path == "." {
		return None;
	}
	match path.rfind('/') {
		Some(idx) => Some(&path[..idx]),
		None => Some("."),
	}
}

/// Final component of a relative path
pub fn basename(path: &str) -> &str {
	match path.rfind('/') {
		Some(idx) => &path[idx + 1..],
		None => path,
	}
}

/// Join a directory path and a child name
pub fn path_join(dir: &str, name: &str) -> String {
	if dir == "." {
		name.to_string()
	} else {
		format!("{}/{}", dir, name)
	}
}

/// True if `path` equals `dir` or lies beneath it
pub fn is_under(path: &str, dir: &str) -> bool {
	if dir == "." {
		return true;
	}
	path == dir || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

/// Number of `/`-separated components; `.` has depth 0
pub fn depth(path: &str) -> usize {
	if path == "." {
		0
	} else {
		path.split('/').count()
	}
}

/// Parse a permission field rendered as octal (e.g. "0644")
pub fn parse_octal(s: &str) -> Option<u32> {
	if s.is_empty() {
		return None;
	}
	u32::from_str_radix(s, 8).ok().filter(|m| *m <= 0o7777)
}

fn cstring(path: &Path) -> io::Result<CString> {
	use std::os::unix::ffi::OsStrExt;
	CString::new(path.as_os_str().as_bytes())
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// Set the modification time of a path to millisecond precision,
/// without following symlinks
#[allow(unsafe_code)] // Safe wrapper around utimensat(2)
pub fn set_mtime_ms(path: &Path, mtime_ms: i64) -> io::Result<()> {
	let cpath = cstring(path)?;
	let times = [
		// atime: leave untouched
		libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
		libc::timespec {
			tv_sec: mtime_ms.div_euclid(1000),
			tv_nsec: mtime_ms.rem_euclid(1000) * 1_000_000,
		},
	];
	// SAFETY: cpath and times outlive the call.
	let rc = unsafe {
		libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
	};
	if rc == 0 {
		Ok(())
	} else {
		Err(io::Error::last_os_error())
	}
}

/// Change ownership of a path without following symlinks
#[allow(unsafe_code)] // Safe wrapper around lchown(2)
pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
	let cpath = cstring(path)?;
	// SAFETY: cpath outlives the call.
	let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
	if rc == 0 {
		Ok(())
	} else {
		Err(io::Error::last_os_error())
	}
}

/// True when stdin is a terminal; prompts are only interactive then
#[allow(unsafe_code)] // Safe wrapper around isatty(3)
pub fn stdin_is_tty() -> bool {
	// SAFETY: isatty only inspects the descriptor.
	unsafe { libc::isatty(0) == 1 }
}

/// Create a block or character device node
#[allow(unsafe_code)] // Safe wrapper around mknod(2)
pub fn mknod(path: &Path, block: bool, mode: u32, major: u64, minor: u64) -> io::Result<()> {
	let cpath = cstring(path)?;
	let kind = if block { libc::S_IFBLK } else { libc::S_IFCHR };
	// SAFETY: cpath outlives the call; makedev has no preconditions.
	let rc = unsafe {
		libc::mknod(cpath.as_ptr(), kind | mode as libc::mode_t, libc::makedev(major as _, minor as _))
	};
	if rc == 0 {
		Ok(())
	} else {
		Err(io::Error::last_os_error())
	}
}


// vim: ts=4
