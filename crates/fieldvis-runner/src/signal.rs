//! Process signalling.

use crate::error::RunnerResult;
#[cfg(unix)]
use crate::error::RunnerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// No such process; it already exited
    AlreadyExited,
}

/// Send SIGTERM to `pid`.
#[cfg(unix)]
pub fn terminate(pid: u32) -> RunnerResult<SignalOutcome> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| RunnerError::signal(pid, "pid out of range"))?;
    if raw <= 0 {
        return Err(RunnerError::signal(pid, "refusing to signal a process group"));
    }

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(SignalOutcome::Delivered),
        Err(Errno::ESRCH) => Ok(SignalOutcome::AlreadyExited),
        Err(e) => Err(RunnerError::signal(pid, e.desc())),
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> RunnerResult<SignalOutcome> {
    Err(crate::error::RunnerError::signal(
        pid,
        "process signals are not supported on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_group_pid() {
        assert!(terminate(0).is_err());
    }

    #[tokio::test]
    async fn test_terminate_running_then_exited_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert_eq!(terminate(pid).unwrap(), SignalOutcome::Delivered);
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        // Reaped, so the pid no longer exists.
        assert_eq!(terminate(pid).unwrap(), SignalOutcome::AlreadyExited);
    }
}
