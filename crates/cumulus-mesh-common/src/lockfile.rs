// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! PID-bearing lock files.
//!
//! A lock is a file holding the owner's PID, guarded by an exclusive
//! `flock`. The kernel drops the `flock` when the owner exits, so a file
//! left behind by a dead process is free to take without removing it
//! first. Used both for the single-daemon-per-cluster guarantee and for
//! serializing registry writes across CLI invocations.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opens that lose a race with a releasing owner (the file was unlinked
/// between our open and our lock) before giving up as contended.
const LOCK_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum LockError {
	#[error("lock {path} is held by pid {pid}")]
	Held { path: PathBuf, pid: u32 },

	#[error("lock {path} is being created by another process")]
	Contended { path: PathBuf },

	#[error("timed out after {timeout:?} waiting for lock {path}")]
	Timeout { path: PathBuf, timeout: Duration },

	#[error("lock file I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Whether a process with this PID exists. A process owned by another user
/// counts as alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return false;
	};
	if pid <= 0 {
		return false;
	}
	let rc = unsafe { libc::kill(pid, 0) };
	if rc == 0 {
		return true;
	}
	std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
	false
}

/// Reads the PID recorded in `path`, if the file exists and parses.
pub fn read_pid(path: impl AsRef<Path>) -> Option<u32> {
	fs::read_to_string(path.as_ref())
		.ok()
		.and_then(|content| content.trim().parse().ok())
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
	use std::os::unix::io::AsRawFd;

	let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
	if rc == 0 {
		return Ok(true);
	}
	let err = io::Error::last_os_error();
	if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
		Ok(false)
	} else {
		Err(err)
	}
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
	Ok(true)
}

/// Whether `path` still names the file we hold open.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
	use std::os::unix::fs::MetadataExt;

	let held = file.metadata()?;
	match fs::metadata(path) {
		Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
		Err(e) => Err(e),
	}
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
	Ok(path.exists())
}

fn remove_lock_file(path: &Path) -> Result<()> {
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e.into()),
	}
}

#[derive(Debug)]
pub struct PidFile {
	path: PathBuf,
	/// Open descriptor carrying the `flock`; `None` once released.
	file: Option<File>,
}

impl PidFile {
	/// Locks the file and records the current process's PID in it.
	pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
		Self::acquire_for(path, std::process::id())
	}

	/// Locks the file and records `pid` in it. A file left by a dead owner
	/// carries no lock and is overwritten in place.
	pub fn acquire_for(path: impl AsRef<Path>, pid: u32) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent)?;
			}
		}

		for _ in 0..LOCK_ATTEMPTS {
			let mut file = OpenOptions::new()
				.read(true)
				.write(true)
				.create(true)
				.truncate(false)
				.open(&path)?;

			if !try_lock_exclusive(&file)? {
				return Err(match read_pid(&path) {
					Some(owner) => LockError::Held { path, pid: owner },
					None => LockError::Contended { path },
				});
			}

			// The previous owner unlinks the file while still holding it, so a
			// lock on an unlinked inode guards nothing.
			if !still_linked(&file, &path)? {
				debug!(path = %path.display(), "lock file replaced while opening, retrying");
				continue;
			}

			if let Some(previous) = read_pid(&path).filter(|previous| *previous != pid) {
				warn!(path = %path.display(), pid = previous, "taking over stale lock file");
			}
			file.set_len(0)?;
			file.seek(SeekFrom::Start(0))?;
			writeln!(file, "{pid}")?;
			file.sync_all()?;
			debug!(path = %path.display(), pid, "lock acquired");
			return Ok(Self {
				path,
				file: Some(file),
			});
		}

		Err(LockError::Contended { path })
	}

	/// Polls until the lock is free or `timeout` elapses.
	pub async fn acquire_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			match Self::acquire(&path) {
				Ok(lock) => return Ok(lock),
				Err(LockError::Held { .. }) | Err(LockError::Contended { .. }) => {
					if tokio::time::Instant::now() >= deadline {
						return Err(LockError::Timeout { path, timeout });
					}
					tokio::time::sleep(POLL_INTERVAL).await;
				}
				Err(e) => return Err(e),
			}
		}
	}

	/// Deletes the lock file at `path` when nobody holds it. Returns whether
	/// a file was removed.
	pub fn remove_if_stale(path: impl AsRef<Path>) -> Result<bool> {
		let path = path.as_ref();
		if !path.exists() {
			return Ok(false);
		}
		match Self::acquire(path) {
			Ok(lock) => {
				lock.release()?;
				Ok(true)
			}
			Err(LockError::Held { .. }) | Err(LockError::Contended { .. }) => Ok(false),
			Err(e) => Err(e),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Removes the lock file, then drops the lock. Dropping the guard does
	/// the same, ignoring errors.
	pub fn release(mut self) -> Result<()> {
		let result = remove_lock_file(&self.path);
		self.file.take();
		result
	}
}

impl Drop for PidFile {
	fn drop(&mut self) {
		if self.file.is_some() {
			let _ = fs::remove_file(&self.path);
		}
	}
}
