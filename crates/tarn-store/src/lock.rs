//! Writer exclusion and process presence.
//!
//! Within a process, writers queue on a mutex + condvar gate. Across
//! processes, the writer additionally holds an exclusive `flock` on
//! `<path>.write.lock`, and every open store holds a shared `flock` on
//! `<path>.lock` so a writer can tell whether anyone else has the file open.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// `<path><suffix>`, next to the store file.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

#[cfg(unix)]
fn flock(file: &File, op: libc::c_int) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(false),
            _ => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Writer lock
// ---------------------------------------------------------------------------

/// Single-writer lock for one store file.
pub struct WriterLock {
    busy: Mutex<bool>,
    released: Condvar,
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl WriterLock {
    pub fn open(store_path: &Path) -> io::Result<Self> {
        Ok(Self {
            busy: Mutex::new(false),
            released: Condvar::new(),
            file: open_lock_file(&sibling(store_path, ".write.lock"))?,
        })
    }

    /// Take the lock, waiting for the current writer if `wait` is set and
    /// failing with [`StoreError::WouldBlock`] otherwise.
    pub fn acquire(self: &Arc<Self>, wait: bool) -> StoreResult<WriteGuard> {
        {
            let mut busy = self.busy.lock().expect("lock poisoned");
            if wait {
                while *busy {
                    busy = self.released.wait(busy).expect("lock poisoned");
                }
            } else if *busy {
                return Err(StoreError::WouldBlock);
            }
            *busy = true;
        }

        if let Err(e) = self.lock_file(wait) {
            self.release_gate();
            return Err(e);
        }
        Ok(WriteGuard {
            lock: Arc::clone(self),
        })
    }

    #[cfg(unix)]
    fn lock_file(&self, wait: bool) -> StoreResult<()> {
        let op = if wait {
            libc::LOCK_EX
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };
        if flock(&self.file, op)? {
            Ok(())
        } else {
            debug!("write lock held by another process");
            Err(StoreError::WouldBlock)
        }
    }

    #[cfg(not(unix))]
    fn lock_file(&self, _wait: bool) -> StoreResult<()> {
        Ok(())
    }

    fn release(&self) {
        #[cfg(unix)]
        {
            let _ = flock(&self.file, libc::LOCK_UN);
        }
        self.release_gate();
    }

    fn release_gate(&self) {
        *self.busy.lock().expect("lock poisoned") = false;
        self.released.notify_one();
    }
}

/// Held by the active write transaction. Dropping it admits the next writer.
pub struct WriteGuard {
    lock: Arc<WriterLock>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Shared lock held for as long as the store is open.
pub struct Presence {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl Presence {
    pub fn join(store_path: &Path) -> io::Result<Self> {
        let file = open_lock_file(&sibling(store_path, ".lock"))?;
        #[cfg(unix)]
        flock(&file, libc::LOCK_SH)?;
        Ok(Self { file })
    }

    /// Returns `true` unless this handle is provably the only one open.
    ///
    /// Probes by upgrading to an exclusive lock without blocking and then
    /// taking the shared lock again; a failed upgrade drops the old lock.
    /// Only called with the writer lock held, so probes never overlap.
    /// Platforms without `flock` always report others.
    pub fn others_present(&self) -> bool {
        #[cfg(unix)]
        {
            let alone = matches!(flock(&self.file, libc::LOCK_EX | libc::LOCK_NB), Ok(true));
            let _ = flock(&self.file, libc::LOCK_SH);
            !alone
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sibling_appends_suffix() {
        assert_eq!(
            sibling(Path::new("/tmp/db.tarn"), ".lock"),
            PathBuf::from("/tmp/db.tarn.lock")
        );
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(WriterLock::open(&dir.path().join("db")).unwrap());
        let guard = lock.acquire(false).unwrap();
        assert!(matches!(lock.acquire(false), Err(StoreError::WouldBlock)));
        drop(guard);
        assert!(lock.acquire(false).is_ok());
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(WriterLock::open(&dir.path().join("db")).unwrap());
        let guard = lock.acquire(true).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _g = lock.acquire(true).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn second_handle_is_another_process_for_flock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let a = Arc::new(WriterLock::open(&path).unwrap());
        let b = Arc::new(WriterLock::open(&path).unwrap());
        let _guard = a.acquire(false).unwrap();
        assert!(matches!(b.acquire(false), Err(StoreError::WouldBlock)));
    }

    #[cfg(unix)]
    #[test]
    fn presence_sees_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let a = Presence::join(&path).unwrap();
        assert!(!a.others_present());
        let b = Presence::join(&path).unwrap();
        assert!(a.others_present());
        assert!(b.others_present());
        drop(b);
        assert!(!a.others_present());
    }
}
