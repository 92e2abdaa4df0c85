//! Named-pipe commit signal for Linux.
//!
//! Every handle opens `<path>.note` read-write and watches it with an
//! edge-triggered epoll. A commit writes one byte; each write raises an edge
//! for every watcher in every process, and nobody has to drain the pipe. When
//! the pipe buffer fills the writer reads a byte back out to make room.
//!
//! If no FIFO can live next to the file (some filesystems refuse them), the
//! pipe is created in the temp directory under a name derived from the
//! file's canonical path.

use std::ffi::{CString, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{FabricError, FabricResult};
use crate::signal::CommitSignal;

const PIPE_TOKEN: u64 = 0;
const WAKE_TOKEN: u64 = 1;

#[derive(Debug, Default)]
struct FifoState {
    generation: u64,
    interrupted: bool,
}

/// Cross-process signal over a named pipe.
#[derive(Debug)]
pub struct FifoSignal {
    path: PathBuf,
    pipe: File,
    wake: OwnedFd,
    epoll: OwnedFd,
    state: Mutex<FifoState>,
}

impl FifoSignal {
    /// Open (creating if needed) the notification pipe for the store at
    /// `store_path`.
    pub fn open(store_path: &Path) -> FabricResult<Self> {
        let primary = note_path(store_path);
        let (path, pipe) = match open_pipe(&primary) {
            Ok(pipe) => (primary, pipe),
            Err(err) => {
                let fallback = fallback_path(store_path);
                debug!(
                    path = %primary.display(),
                    fallback = %fallback.display(),
                    error = %err,
                    "using fallback notification pipe"
                );
                let pipe = open_pipe(&fallback).map_err(|e| FabricError::NotificationPipe {
                    path: fallback.clone(),
                    reason: e.to_string(),
                })?;
                (fallback, pipe)
            }
        };

        let wake = cvt_fd(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        let epoll = cvt_fd(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        watch(&epoll, pipe.as_raw_fd(), libc::EPOLLIN | libc::EPOLLET, PIPE_TOKEN)?;
        watch(&epoll, wake.as_raw_fd(), libc::EPOLLIN, WAKE_TOKEN)?;

        debug!(path = %path.display(), "notification pipe open");
        Ok(Self {
            path,
            pipe,
            wake,
            epoll,
            state: Mutex::new(FifoState::default()),
        })
    }

    /// Where the pipe actually lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wake_local(&self) {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // A saturated eventfd is still readable, so a failed bump loses nothing.
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(error = %err, "failed to wake notification listener");
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.wake.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len());
        }
    }
}

impl CommitSignal for FifoSignal {
    fn notify(&self) -> FabricResult<()> {
        let fd = self.pipe.as_raw_fd();
        let byte = [0u8; 1];
        loop {
            let rc = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
            if rc == 1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    let mut sink = [0u8; 1];
                    unsafe {
                        libc::read(fd, sink.as_mut_ptr().cast(), 1);
                    }
                }
                _ => return Err(err.into()),
            }
        }
    }

    fn current(&self) -> u64 {
        self.state.lock().expect("lock poisoned").generation
    }

    fn wait(&self, last_seen: u64) -> FabricResult<Option<u64>> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
        loop {
            {
                let state = self.state.lock().expect("lock poisoned");
                if state.interrupted {
                    return Ok(None);
                }
                if state.generation > last_seen {
                    return Ok(Some(state.generation));
                }
            }

            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    -1,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            for event in &events[..n as usize] {
                let token = event.u64;
                if token == PIPE_TOKEN {
                    self.state.lock().expect("lock poisoned").generation += 1;
                } else {
                    self.drain_wake();
                }
            }
        }
    }

    fn interrupt(&self) {
        self.state.lock().expect("lock poisoned").interrupted = true;
        self.wake_local();
    }
}

/// `<path>.note`.
pub fn note_path(store_path: &Path) -> PathBuf {
    let mut name = OsString::from(store_path.as_os_str());
    name.push(".note");
    PathBuf::from(name)
}

/// `$TMPDIR/tarn_<hash>.note`, keyed by the canonical store path so every
/// process picks the same pipe.
pub fn fallback_path(store_path: &Path) -> PathBuf {
    let canonical = store_path
        .canonicalize()
        .unwrap_or_else(|_| store_path.to_path_buf());
    let hash = blake3::hash(canonical.as_os_str().as_bytes());
    std::env::temp_dir().join(format!("tarn_{}.note", hex::encode(&hash.as_bytes()[..8])))
}

fn open_pipe(path: &Path) -> io::Result<File> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }

    let pipe = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)?;
    if !pipe.metadata()?.file_type().is_fifo() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "notification path exists and is not a pipe",
        ));
    }
    Ok(pipe)
}

fn cvt_fd(fd: libc::c_int) -> io::Result<OwnedFd> {
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn watch(epoll: &OwnedFd, fd: libc::c_int, events: libc::c_int, token: u64) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events: events as u32,
        u64: token,
    };
    let rc = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
