//! Platform process termination.
//!
//! One [`Terminator`] is picked per platform at startup by
//! [`platform_terminator`]. Both implementations follow the same shape: ask
//! the process to exit, wait up to the grace period, force it, then confirm.
//! Exit is observed through the supervisor's exit watch rather than by
//! polling the pid, so a reaped process never looks alive.

use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long a forced kill may take before termination is reported as failed
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

/// Receiving side of a process's exit notification; `None` while it runs
pub type ExitWatch = watch::Receiver<Option<ExitInfo>>;

pub fn has_exited(exit: &ExitWatch) -> bool {
    exit.borrow().is_some()
}

/// Wait until the process has exited, up to `timeout`
pub async fn wait_for_exit(exit: &mut ExitWatch, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, exit.wait_for(|e| e.is_some())).await {
        Ok(Ok(_)) => true,
        // The waiter task is gone, so the child has been reaped
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

#[async_trait]
pub trait Terminator: Send + Sync {
    /// Terminate `pid`. A graceful request waits up to `timeout` before forcing.
    async fn terminate(
        &self,
        pid: u32,
        exit: ExitWatch,
        graceful: bool,
        timeout: Duration,
    ) -> Result<()>;
}

/// The terminator for the current platform
pub fn platform_terminator() -> Arc<dyn Terminator> {
    #[cfg(unix)]
    {
        Arc::new(UnixTerminator)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsTerminator::default())
    }
}

/// SIGTERM, grace period, SIGKILL.
///
/// Children are spawned as process-group leaders, so signals go to the whole group.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixTerminator;

#[cfg(unix)]
impl UnixTerminator {
    fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        let nix_pid = Pid::from_raw(pid as i32);
        let result = match signal::killpg(nix_pid, signal) {
            // Not a group leader (or the group is gone), fall back to the pid
            Err(Errno::ESRCH) => signal::kill(nix_pid, signal),
            other => other,
        };

        match result {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::TerminationFailed(
                pid.to_string(),
                format!("Failed to send {}: {}", signal.as_str(), e),
            )),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl Terminator for UnixTerminator {
    async fn terminate(
        &self,
        pid: u32,
        mut exit: ExitWatch,
        graceful: bool,
        timeout: Duration,
    ) -> Result<()> {
        use nix::sys::signal::Signal;

        if has_exited(&exit) {
            return Ok(());
        }

        if graceful {
            tracing::info!("Gracefully stopping PID {} with SIGTERM", pid);
            Self::send(pid, Signal::SIGTERM)?;

            tracing::debug!("Waiting {:?} for PID {} to exit gracefully", timeout, pid);
            if wait_for_exit(&mut exit, timeout).await {
                return Ok(());
            }

            tracing::warn!(
                "PID {} did not exit within {:?}, sending SIGKILL",
                pid,
                timeout
            );
        } else {
            tracing::info!("Force stopping PID {} with SIGKILL", pid);
        }

        Self::send(pid, Signal::SIGKILL)?;

        if wait_for_exit(&mut exit, KILL_CONFIRM_TIMEOUT).await {
            Ok(())
        } else {
            Err(SupervisorError::TerminationFailed(
                pid.to_string(),
                "process still alive after SIGKILL".to_string(),
            ))
        }
    }
}

/// `taskkill` based termination: a tree kill request, polling, then `/F`
#[cfg(windows)]
#[derive(Debug, Clone, Copy)]
pub struct WindowsTerminator {
    pub poll_interval: Duration,
}

#[cfg(windows)]
impl Default for WindowsTerminator {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[cfg(windows)]
impl WindowsTerminator {
    async fn taskkill(pid: u32, force: bool) -> Result<()> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
        if force {
            args.push("/F");
        }

        let output = tokio::process::Command::new("taskkill")
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                SupervisorError::TerminationFailed(
                    pid.to_string(),
                    format!("Failed to run taskkill: {}", e),
                )
            })?;

        if !output.status.success() {
            tracing::debug!(
                "taskkill for PID {} returned {}: {}",
                pid,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(windows)]
#[async_trait]
impl Terminator for WindowsTerminator {
    async fn terminate(
        &self,
        pid: u32,
        mut exit: ExitWatch,
        graceful: bool,
        timeout: Duration,
    ) -> Result<()> {
        if has_exited(&exit) {
            return Ok(());
        }

        if graceful {
            tracing::info!("Requesting PID {} to exit", pid);
            Self::taskkill(pid, false).await?;

            let deadline = tokio::time::Instant::now() + timeout;
            while tokio::time::Instant::now() < deadline {
                if has_exited(&exit) {
                    return Ok(());
                }
                tokio::time::sleep(self.poll_interval).await;
            }

            tracing::warn!("PID {} did not exit within {:?}, forcing", pid, timeout);
        }

        Self::taskkill(pid, true).await?;

        if wait_for_exit(&mut exit, KILL_CONFIRM_TIMEOUT).await {
            Ok(())
        } else {
            Err(SupervisorError::TerminationFailed(
                pid.to_string(),
                "process still alive after forced taskkill".to_string(),
            ))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    /// Spawn a group-leading child and a waiter that feeds its exit watch
    fn spawn_watched(script: &str) -> (u32, ExitWatch) {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            if let Ok(status) = child.wait().await {
                let _ = tx.send(Some(ExitInfo::from_status(status)));
            }
        });
        (pid, rx)
    }

    #[tokio::test]
    async fn test_graceful_termination() {
        let (pid, exit) = spawn_watched("sleep 30");

        UnixTerminator
            .terminate(pid, exit.clone(), true, Duration::from_secs(5))
            .await
            .unwrap();

        let info = exit.borrow().unwrap();
        assert_eq!(info.signal, Some(15));
    }

    #[tokio::test]
    async fn test_escalates_to_kill_when_term_ignored() {
        let (pid, exit) = spawn_watched("trap '' TERM; while true; do sleep 0.1; done");
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        UnixTerminator
            .terminate(pid, exit.clone(), true, Duration::from_millis(500))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(exit.borrow().unwrap().signal, Some(9));
    }

    #[tokio::test]
    async fn test_force_termination() {
        let (pid, exit) = spawn_watched("sleep 30");

        UnixTerminator
            .terminate(pid, exit.clone(), false, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(exit.borrow().unwrap().signal, Some(9));
    }

    #[tokio::test]
    async fn test_already_exited_is_ok() {
        let (pid, mut exit) = spawn_watched("exit 3");
        assert!(wait_for_exit(&mut exit, Duration::from_secs(5)).await);

        UnixTerminator
            .terminate(pid, exit.clone(), true, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(exit.borrow().unwrap().code, Some(3));
    }

    #[test]
    fn test_exit_description() {
        let info = ExitInfo {
            code: Some(1),
            signal: None,
        };
        assert_eq!(info.describe(), "exited with code 1");

        let info = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(info.describe(), "killed by signal 9");
    }
}
