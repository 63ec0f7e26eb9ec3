//! Platform signal delivery for daemon termination.
//!
//! The daemon is spawned as the leader of its own process group, so a forced kill addressed to
//! the group also reaches every runner process it spawned.

use std::io;

/// Outcome of delivering a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Signal was delivered.
    Sent,
    /// Target no longer exists.
    Gone,
}

/// Ask the process to exit (SIGTERM).
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<Delivery> {
    send(pid as libc::pid_t, libc::SIGTERM)
}

/// Kill the process and its whole process group (SIGKILL).
#[cfg(unix)]
pub fn kill_tree(pid: u32) -> io::Result<Delivery> {
    let pid = pid as libc::pid_t;
    match send(-pid, libc::SIGKILL) {
        // The group may already be gone while the leader lingers as a zombie.
        Ok(Delivery::Gone) => send(pid, libc::SIGKILL),
        other => other,
    }
}

#[cfg(unix)]
fn send(target: libc::pid_t, signal: libc::c_int) -> io::Result<Delivery> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        return Ok(Delivery::Sent);
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        Ok(Delivery::Gone)
    } else {
        Err(error)
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> io::Result<Delivery> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is not supported on this platform",
    ))
}

#[cfg(not(unix))]
pub fn kill_tree(_pid: u32) -> io::Result<Delivery> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process-group kill is not supported on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn terminate_stops_a_running_process() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        assert_eq!(terminate(child.id()).expect("signal"), Delivery::Sent);

        let deadline = Instant::now() + Duration::from_secs(5);
        while child.try_wait().expect("try_wait").is_none() {
            assert!(Instant::now() < deadline, "sleep ignored SIGTERM");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn signalling_a_reaped_process_reports_gone() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        child.wait().expect("wait");
        assert_eq!(terminate(child.id()).expect("signal"), Delivery::Gone);
    }
}
