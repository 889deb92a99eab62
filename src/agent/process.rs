//! Process handle for child processes spawned by agents

use crate::execution::{ProcessHandle, TerminationSignal};
use async_trait::async_trait;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::debug;

/// How often a process group is checked for members once its leader exited
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
enum ExitState {
    Running,
    Exited(ExitStatus),
    Lost(String),
}

/// Handle to a spawned child process.
///
/// A reaper task owns the `Child` and publishes its exit, so the process keeps
/// being tracked (and can still be signalled) even if the agent future that
/// spawned it is dropped. A group handle stays alive until every member of the
/// group is gone, not just the leader.
#[derive(Debug)]
pub struct ChildProcessHandle {
    pid: Option<u32>,
    /// Signal the whole process group led by `pid`
    own_group: bool,
    exit: watch::Receiver<ExitState>,
}

impl ChildProcessHandle {
    /// Track a child that shares our process group
    pub fn watch(child: Child) -> Self {
        Self::spawn_reaper(child, false)
    }

    /// Track a child spawned as the leader of its own process group
    pub fn watch_group(child: Child) -> Self {
        Self::spawn_reaper(child, true)
    }

    fn spawn_reaper(mut child: Child, own_group: bool) -> Self {
        let pid = child.id();
        let (tx, rx) = watch::channel(ExitState::Running);

        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) => ExitState::Exited(status),
                Err(e) => ExitState::Lost(e.to_string()),
            };
            debug!("Child process {:?} finished: {:?}", pid, state);
            tx.send_replace(state);
        });

        Self {
            pid,
            own_group,
            exit: rx,
        }
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> io::Result<ExitStatus> {
        let mut rx = self.exit.clone();
        let state = rx
            .wait_for(|state| !matches!(state, ExitState::Running))
            .await
            .map(|state| state.clone())
            .map_err(|_| io::Error::other("process reaper stopped"))?;

        match state {
            ExitState::Exited(status) => Ok(status),
            ExitState::Lost(message) => Err(io::Error::other(message)),
            ExitState::Running => Err(io::Error::other("process still running")),
        }
    }

    fn leader_running(&self) -> bool {
        matches!(*self.exit.borrow(), ExitState::Running)
    }

    #[cfg(unix)]
    fn raw_pid(&self) -> io::Result<nix::unistd::Pid> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process has no pid"))?;
        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        Ok(nix::unistd::Pid::from_raw(raw))
    }

    /// Whether any process of the group led by `pid` still exists
    #[cfg(unix)]
    fn group_has_members(&self) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};

        if !self.own_group {
            return false;
        }
        match self.raw_pid() {
            // EPERM still means the group exists
            Ok(pgid) => !matches!(killpg(pgid, None::<Signal>), Err(Errno::ESRCH)),
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn group_has_members(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn send(&self, signal: TerminationSignal) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg, Signal};

        let pid = self.raw_pid()?;
        let sig = match signal {
            TerminationSignal::Graceful => Signal::SIGTERM,
            TerminationSignal::Forced => Signal::SIGKILL,
        };

        debug!("Sending {:?} to pid {} (group: {})", sig, pid, self.own_group);
        let result = if self.own_group {
            killpg(pid, sig)
        } else {
            kill(pid, sig)
        };
        match result {
            // Gone between the liveness check and the signal
            Err(Errno::ESRCH) => Ok(()),
            other => other.map_err(io::Error::from),
        }
    }

    #[cfg(not(unix))]
    fn send(&self, _signal: TerminationSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signals are only supported on unix",
        ))
    }
}

#[async_trait]
impl ProcessHandle for ChildProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.leader_running() || self.group_has_members()
    }

    fn signal(&self, signal: TerminationSignal) -> io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.send(signal)
    }

    async fn exited(&self) {
        let _ = self.wait().await;
        while self.group_has_members() {
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }
}
