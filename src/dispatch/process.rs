//! OS process inspection and signalling for scan processes.

use std::time::Duration;

use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, System, UpdateKind,
};
use tracing::{debug, warn};

/// What the OS reports about a recorded pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Missing,
    /// Exited but not yet reaped by its parent.
    Defunct,
    Alive { name: String, cmdline: String },
}

impl ProcessState {
    /// True when the process is alive and looks like `binary`.
    pub fn runs(&self, binary: &str) -> bool {
        let ProcessState::Alive { name, cmdline } = self else {
            return false;
        };
        let needle = std::path::Path::new(binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| binary.to_string());
        name.contains(&needle) || cmdline.contains(&needle)
    }
}

/// Looks up processes by pid.
pub trait ProcessInspector: Send + Sync {
    fn inspect(&self, pid: u32) -> ProcessState;
}

/// [`ProcessInspector`] backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoInspector;

impl ProcessInspector for SysinfoInspector {
    fn inspect(&self, pid: u32) -> ProcessState {
        let pid = Pid::from_u32(pid);
        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );

        match system.process(pid) {
            None => ProcessState::Missing,
            Some(process) if process.status() == ProcessStatus::Zombie => ProcessState::Defunct,
            Some(process) => ProcessState::Alive {
                name: process.name().to_string_lossy().into_owned(),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
            },
        }
    }
}

/// Whether a process with this pid exists.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) checks existence without delivering a signal; EPERM still means it exists.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// How [`terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was gone before SIGTERM.
    NotRunning,
    /// The process exited within the grace period.
    Terminated,
    /// The process outlived the grace period and got SIGKILL.
    Killed,
}

const EXIT_POLL: Duration = Duration::from_millis(50);

fn has_exited(pid: u32) -> bool {
    !is_pid_alive(pid) || SysinfoInspector.inspect(pid) == ProcessState::Defunct
}

/// Sends SIGTERM and waits up to `grace` for the process to exit, then
/// sends SIGKILL. Returns once the escalation is finished.
pub async fn terminate(pid: u32, grace: Duration) -> Termination {
    if let Err(e) = send_signal(pid, libc::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM not delivered");
        return Termination::NotRunning;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if has_exited(pid) {
            return Termination::Terminated;
        }
        tokio::time::sleep(EXIT_POLL.min(grace)).await;
    }
    if has_exited(pid) {
        return Termination::Terminated;
    }

    match send_signal(pid, libc::SIGKILL) {
        Ok(()) => {
            warn!(pid, "Process ignored SIGTERM, sent SIGKILL");
            Termination::Killed
        }
        Err(e) => {
            debug!(pid, error = %e, "SIGKILL not delivered");
            Termination::Terminated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_matches_binary_file_name() {
        let state = ProcessState::Alive {
            name: "nmap".into(),
            cmdline: "/usr/bin/nmap -v -T4 10.0.0.1".into(),
        };
        assert!(state.runs("/usr/local/bin/nmap"));
        assert!(state.runs("nmap"));
        assert!(!state.runs("masscan"));
        assert!(!ProcessState::Missing.runs("nmap"));
        assert!(!ProcessState::Defunct.runs("nmap"));
    }

    #[test]
    fn test_inspector_sees_current_process() {
        let state = SysinfoInspector.inspect(std::process::id());
        assert!(matches!(state, ProcessState::Alive { .. }));
        assert!(is_pid_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_terminate_stops_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert_eq!(
            terminate(pid, Duration::from_secs(2)).await,
            Termination::Terminated
        );
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_escalates_before_returning() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; exec sleep 30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            terminate(pid, Duration::from_millis(200)).await,
            Termination::Killed
        );
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_terminate_missing_pid() {
        let mut exited = std::process::Command::new("true").spawn().unwrap();
        let pid = exited.id();
        exited.wait().unwrap();
        assert_eq!(
            terminate(pid, Duration::from_millis(50)).await,
            Termination::NotRunning
        );
    }
}
