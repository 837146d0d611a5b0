//! Small process-related helpers shared across the workspace.
//!
//! Transcoder children are spawned into their own process group so that a
//! stop can reap the whole subprocess tree (ffmpeg wrappers fork helpers),
//! and without a console window on Windows.

use std::ffi::OsStr;
use std::io;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Place the child in its own process group.
///
/// On Unix the child becomes the leader of a fresh group, so
/// [`signal_group`] can reach every descendant. On other targets this is a
/// no-op and callers must fall back to killing the direct child.
pub trait ProcessGroupExt {
    fn own_process_group(&mut self);
}

impl ProcessGroupExt for std::process::Command {
    fn own_process_group(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            self.process_group(0);
        }
    }
}

/// Signal delivered to a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// Graceful termination request (SIGTERM).
    Term,
    /// Forced kill (SIGKILL).
    Kill,
}

/// Send `signal` to the process group led by `pgid`.
///
/// A group that already exited is not an error. Returns
/// `ErrorKind::Unsupported` on targets without process groups; callers
/// should then terminate the direct child instead.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: GroupSignal) -> io::Result<()> {
    let sig = match signal {
        GroupSignal::Term => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };

    // Negative pid addresses the whole group.
    let rc = unsafe { libc::kill(-(pgid as i32), sig) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // Group already gone.
        Some(code) if code == libc::ESRCH => Ok(()),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _signal: GroupSignal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

/// Create a `std::process::Command` in its own process group, with
/// `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd.own_process_group();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl ProcessGroupExt for tokio::process::Command {
    fn own_process_group(&mut self) {
        #[cfg(unix)]
        {
            self.as_std_mut().own_process_group();
        }
    }
}

/// Create a `tokio::process::Command` in its own process group, with
/// `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.own_process_group();
    cmd
}
