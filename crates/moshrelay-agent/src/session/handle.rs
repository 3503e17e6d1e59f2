//! Termination handle for a spawned subprocess.
//!
//! The task that owns the `tokio::process::Child` records the pid here when
//! it spawns and clears it once the child is reaped; `terminate` may run on
//! any other task at any time.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::ProcessError;

/// Grace period between SIGTERM and SIGKILL.
const DEFAULT_GRACE: Duration = Duration::from_millis(500);

/// Poll interval while waiting for a signalled process to go away.
const PROBE_INTERVAL: Duration = Duration::from_millis(20);

/// Tracks the pid (or process group) of one subprocess.
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    /// 0 while no process is attached.
    pid: AtomicU32,
    /// Signal the whole process group led by `pid`.
    group: bool,
    stopped: AtomicBool,
    grace: Duration,
}

impl ProcessHandle {
    /// Handle for a process that shares our process group (e.g. an
    /// interactive `mosh-client` that must stay in the terminal's foreground
    /// group).
    pub fn single(program: impl Into<String>) -> Self {
        Self::new(program.into(), false)
    }

    /// Handle for a process spawned as leader of its own process group.
    pub fn group(program: impl Into<String>) -> Self {
        Self::new(program.into(), true)
    }

    fn new(program: String, group: bool) -> Self {
        Self {
            program,
            pid: AtomicU32::new(0),
            group,
            stopped: AtomicBool::new(false),
            grace: DEFAULT_GRACE,
        }
    }

    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Record a freshly spawned child.
    pub(crate) fn attach(&self, pid: Option<u32>) {
        if let Some(pid) = pid {
            self.pid.store(pid, Ordering::Release);
        }
    }

    /// The child has been reaped.
    ///
    /// A single-process handle forgets the pid so it is never signalled after
    /// reuse. A group handle keeps it only while members of the group outlive
    /// the leader: once the group is empty its id can be taken by an
    /// unrelated process group.
    pub(crate) fn reaped(&self) {
        let Some(pid) = self.pid() else {
            return;
        };
        if !self.group {
            self.pid.store(0, Ordering::Release);
            return;
        }
        match send_signal(pid, true, Signal::Probe) {
            Ok(true) => debug!(program = %self.program, pid, "Process group outlives its leader"),
            Ok(false) => self.pid.store(0, Ordering::Release),
            Err(e) => warn!(program = %self.program, pid, error = %e, "Failed to probe process group"),
        }
    }

    /// Terminate the process (or group): SIGTERM, wait up to the grace period,
    /// then SIGKILL.
    ///
    /// A process that is already gone, or was never started, counts as
    /// success. Calling this more than once is a no-op.
    pub async fn terminate(&self) -> Result<(), ProcessError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(pid) = self.pid() else {
            debug!(program = %self.program, "No process to stop");
            return Ok(());
        };

        if !self.signal(pid, Signal::Terminate)? {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + self.grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(PROBE_INTERVAL).await;
            if !self.alive(pid)? {
                info!(program = %self.program, pid, "Process terminated");
                return Ok(());
            }
        }

        warn!(program = %self.program, pid, "Process ignored SIGTERM, killing");
        if !self.signal(pid, Signal::Kill)? {
            return Ok(());
        }
        for _ in 0..10 {
            tokio::time::sleep(PROBE_INTERVAL).await;
            if !self.alive(pid)? {
                return Ok(());
            }
        }
        Err(ProcessError::NotTerminated { pid })
    }

    fn alive(&self, pid: u32) -> Result<bool, ProcessError> {
        // A reaped single process is gone even if the pid was recycled.
        if self.pid().is_none() {
            return Ok(false);
        }
        self.signal(pid, Signal::Probe)
    }

    /// Returns `false` when the target no longer exists.
    fn signal(&self, pid: u32, signal: Signal) -> Result<bool, ProcessError> {
        send_signal(pid, self.group, signal).map_err(|source| ProcessError::Signal { pid, source })
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Probe,
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, group: bool, signal: Signal) -> std::io::Result<bool> {
    let Ok(pid) = i32::try_from(pid) else {
        return Ok(false);
    };
    let target = if group { -pid } else { pid };
    let signo = match signal {
        Signal::Probe => 0,
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the target is a
    // pid or process group we spawned ourselves.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(target, signo) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        // A zombie group leader can still be probed but not signalled on
        // some platforms; treat it as gone.
        Some(libc::EPERM) if matches!(signal, Signal::Probe) => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _group: bool, _signal: Signal) -> std::io::Result<bool> {
    // Children are spawned with `kill_on_drop`; dropping them is the only
    // termination mechanism off unix.
    Ok(false)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_process_is_ok() {
        let handle = ProcessHandle::single("mosh-client");
        assert!(handle.pid().is_none());
        handle.terminate().await.unwrap();
        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn reaped_single_process_forgets_pid() {
        let handle = ProcessHandle::single("mosh-client");
        handle.attach(Some(4242));
        assert_eq!(handle.pid(), Some(4242));
        handle.reaped();
        assert!(handle.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaped_empty_group_forgets_pid() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "true"])
            .process_group(0)
            .spawn()
            .unwrap();
        let handle = ProcessHandle::group("sh");
        handle.attach(child.id());
        assert!(handle.pid().is_some());

        assert!(child.wait().await.unwrap().success());
        handle.reaped();
        assert!(handle.pid().is_none());
        handle.terminate().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaped_group_with_survivor_keeps_pid() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30 </dev/null >/dev/null 2>&1 & exit 0"])
            .process_group(0)
            .spawn()
            .unwrap();
        let handle = ProcessHandle::group("sh");
        let pid = child.id();
        handle.attach(pid);

        assert!(child.wait().await.unwrap().success());
        handle.reaped();
        assert_eq!(handle.pid(), pid);

        assert!(send_signal(pid.unwrap(), true, Signal::Kill).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminates_running_group_twice() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let handle = ProcessHandle::group("sleep").with_grace(Duration::from_secs(2));
        handle.attach(child.id());

        let waiter = tokio::spawn(async move { child.wait().await });
        handle.terminate().await.unwrap();
        handle.terminate().await.unwrap();

        let status = waiter.await.unwrap().unwrap();
        assert!(!status.success());
    }
}
