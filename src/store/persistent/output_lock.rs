//! Writer lock held by an open container file.
//!
//! A container holds `<output>.lock` from open until drop. The lock file
//! records the holding process and output path so a refused writer can name
//! the holder, and it is unlinked when the container closes.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::path::{Path, PathBuf};

/// Exclusive claim on one output file.
#[derive(Debug)]
pub(crate) struct OutputLock {
    file: Option<File>,
    path: PathBuf,
}

impl OutputLock {
    /// Claims `target` for this process.
    ///
    /// Fails with `ErrorKind::WouldBlock` if another container has it open.
    pub(crate) fn acquire(target: &Path) -> IoResult<Self> {
        let path = lock_path_for(target);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(err) = try_lock(&file) {
            if err.kind() != ErrorKind::WouldBlock {
                return Err(err);
            }
            let holder = read_holder(&mut file).unwrap_or_else(|| "another writer".to_string());
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("{} is open by {holder}", target.display()),
            ));
        }

        // A closing holder unlinks the path; a lock on the unlinked file
        // guards nothing.
        if !still_linked(&file, &path)? {
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("{} was released while locking; retry", target.display()),
            ));
        }

        file.set_len(0)?;
        write!(file, "pid={}\noutput={}\n", std::process::id(), target.display())?;
        file.flush()?;

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        // Unlink while the lock is still held, then release it.
        let _ = fs::remove_file(&self.path);
        self.file.take();
    }
}

/// `<target>.lock` next to the target file.
pub(crate) fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map_or_else(|| OsString::from("output"), ToOwned::to_owned);
    name.push(".lock");
    target.with_file_name(name)
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("pid="))
        .map(|pid| format!("process {pid}"))
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> IoResult<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> IoResult<bool> {
    Ok(path.exists())
}

#[cfg(unix)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    let err = IoError::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(IoError::new(ErrorKind::WouldBlock, err));
    }
    Err(err)
}

#[cfg(windows)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if result == 0 {
        return Err(IoError::new(ErrorKind::WouldBlock, IoError::last_os_error()));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> IoResult<()> {
    Err(IoError::new(
        ErrorKind::Unsupported,
        "output locking not supported on this platform",
    ))
}
