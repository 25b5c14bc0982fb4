// src/subproc/process_tree.rs

//! Process-group plumbing: every pooled command leads its own process group
//! so a timeout kills the command and everything it spawned.

use std::process::Command;

#[cfg(unix)]
pub use unix_impl::{prepare_process_group, set_nonblocking, terminate_process_tree};

#[cfg(not(unix))]
pub use fallback::{prepare_process_group, set_nonblocking, terminate_process_tree};

#[cfg(unix)]
mod unix_impl {
    use super::Command;

    use std::io;
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt;

    use libc;
    use tracing::error;

    pub fn prepare_process_group(cmd: &mut Command) {
        cmd.process_group(0);
    }

    /// SIGKILL the process group led by `pid`.
    ///
    /// Returns `false` if the group no longer exists or cannot be signalled.
    pub fn terminate_process_tree(pid: u32) -> bool {
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            return true;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => false,
            _ => {
                error!(pid, error = %err, "failed to kill process group");
                false
            }
        }
    }

    pub fn set_nonblocking<F: AsRawFd>(f: &F) -> io::Result<()> {
        let fd = f.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod fallback {
    use super::Command;

    use std::io;

    pub fn prepare_process_group(_cmd: &mut Command) {}

    pub fn terminate_process_tree(_pid: u32) -> bool {
        false
    }

    pub fn set_nonblocking<F>(_f: &F) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "non-blocking pipes are unix-only",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn kills_whole_group() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("sleep 30 & sleep 30");
        prepare_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        assert!(terminate_process_tree(child.id()));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn missing_group_reports_false() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // Not a group leader and already reaped.
        assert!(!terminate_process_tree(pid));
    }
}
