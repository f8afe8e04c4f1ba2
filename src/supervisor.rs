//! Orphan detection for sender processes.
//!
//! A sender is spawned by a scheduler. If that scheduler goes away there is
//! nobody left to report to, and the sender must stop.

/// Watches a supervising process for liveness.
#[derive(Debug, Clone)]
pub struct ParentWatch {
    pid: Option<u32>,
    /// Also treat being re-parented (e.g. to init) as orphaned
    check_reparent: bool,
}

impl ParentWatch {
    /// Watch the current parent process.
    pub fn current() -> Self {
        Self {
            pid: Some(std::os::unix::process::parent_id()),
            check_reparent: true,
        }
    }

    /// Watch an arbitrary process.
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            check_reparent: false,
        }
    }

    /// Never reports orphaned
    pub fn disabled() -> Self {
        Self {
            pid: None,
            check_reparent: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_orphaned(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        if self.check_reparent && std::os::unix::process::parent_id() != pid {
            return true;
        }
        !pid_alive(pid)
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 only checks existence; EPERM still means the process exists
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_parent_is_alive() {
        assert!(!ParentWatch::current().is_orphaned());
        assert!(!ParentWatch::for_pid(std::process::id()).is_orphaned());
    }

    #[test]
    fn test_dead_process_is_orphaned() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(ParentWatch::for_pid(pid).is_orphaned());
    }

    #[test]
    fn test_disabled_never_orphaned() {
        assert!(!ParentWatch::disabled().is_orphaned());
    }
}
