//! Engine Process Runner
//!
//! Spawns one storage engine subprocess and reports how it terminated.

use crate::config::ServerConfig;
use crate::domain::ports::{ExitState, Runner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs the engine binary described by a server configuration
pub struct ProcessRunner {
    index: u32,
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Mutex<Option<i32>>,
    exit: Mutex<Option<ExitState>>,
    exited: CancellationToken,
}

impl ProcessRunner {
    pub fn new(config: &ServerConfig, group: &str) -> Self {
        Self {
            index: config.index,
            program: config.engine.binary.clone(),
            args: config.engine_args(group),
            env: config.engine_env(),
            child: tokio::sync::Mutex::new(None),
            pid: Mutex::new(None),
            exit: Mutex::new(None),
            exited: CancellationToken::new(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::Runner {
            instance: self.index,
            reason: reason.into(),
        }
    }

    fn terminate(index: u32, pid: i32) -> Result<()> {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                debug!(instance = index, pid, "Sent SIGTERM to engine");
                Ok(())
            }
            // Already exited
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Runner {
                instance: index,
                reason: format!("signal engine {}: {}", pid, e),
            }),
        }
    }
}

/// Map an exit status to how the process ended
pub fn exit_state(status: ExitStatus) -> Option<ExitState> {
    match (status.code(), status.signal()) {
        (Some(code), _) => Some(ExitState::Exited(code)),
        (None, Some(sig)) => Some(ExitState::Signaled(sig)),
        (None, None) => None,
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() || self.exited.is_cancelled() {
            return Err(self.error("engine already started"));
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(format!("spawn {}: {}", self.program.display(), e)))?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| self.error("engine exited during spawn"))?;
        *self.pid.lock() = Some(pid);
        *slot = Some(child);

        info!(instance = self.index, pid, program = %self.program.display(), "Started engine");

        let index = self.index;
        let exited = self.exited.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = Self::terminate(index, pid) {
                        warn!(instance = index, error = %e, "Failed to terminate engine on cancel");
                    }
                }
                _ = exited.cancelled() => {}
            }
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.exited.is_cancelled() {
            return Ok(());
        }
        match *self.pid.lock() {
            Some(pid) => Self::terminate(self.index, pid),
            None => Ok(()),
        }
    }

    async fn wait(&self) -> Result<ExitState> {
        let mut slot = self.child.lock().await;
        if let Some(state) = *self.exit.lock() {
            return Ok(state);
        }
        let child = slot
            .as_mut()
            .ok_or_else(|| self.error("engine not started"))?;

        let status = child
            .wait()
            .await
            .map_err(|e| self.error(format!("wait: {}", e)))?;
        self.exited.cancel();
        *self.pid.lock() = None;

        let state = exit_state(status)
            .ok_or_else(|| self.error(format!("undecodable wait status {:?}", status)))?;
        *self.exit.lock() = Some(state);
        info!(instance = self.index, %state, "Engine exited");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn runner_for(script: &str) -> ProcessRunner {
        let mut config = ServerConfig::new(0);
        config.engine.binary = PathBuf::from("/bin/sh");
        let mut runner = ProcessRunner::new(&config, "test");
        runner.args = vec!["-c".into(), script.into()];
        runner
    }

    #[test]
    fn test_exit_state_mapping() {
        assert_eq!(exit_state(ExitStatus::from_raw(0)), Some(ExitState::Exited(0)));
        assert_eq!(exit_state(ExitStatus::from_raw(3 << 8)), Some(ExitState::Exited(3)));
        assert_eq!(exit_state(ExitStatus::from_raw(15)), Some(ExitState::Signaled(15)));
    }

    #[test]
    fn test_command_line_from_config() {
        let mut config = ServerConfig::new(3);
        config.engine.fabric_iface = Some("ib0".into());
        let runner = ProcessRunner::new(&config, "lab");
        assert!(runner.args().contains(&"--instance-idx=3".to_string()));
        assert_eq!(runner.env()["OFI_INTERFACE"], "ib0");
    }

    #[tokio::test]
    async fn test_exit_code() {
        let runner = runner_for("exit 7");
        runner.start(CancellationToken::new()).await.unwrap();
        assert_eq!(runner.wait().await.unwrap(), ExitState::Exited(7));
        // Cached after the first wait
        assert_eq!(runner.wait().await.unwrap(), ExitState::Exited(7));
    }

    #[tokio::test]
    async fn test_stop_sends_sigterm() {
        let runner = runner_for("exec sleep 30");
        runner.start(CancellationToken::new()).await.unwrap();
        runner.stop().await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), runner.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, ExitState::Signaled(Signal::SIGTERM as i32));

        // Stopping an exited engine is fine
        assert!(runner.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let runner = runner_for("exec sleep 30");
        let cancel = CancellationToken::new();
        runner.start(cancel.clone()).await.unwrap();
        cancel.cancel();

        let state = tokio::time::timeout(Duration::from_secs(5), runner.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!state.success());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut config = ServerConfig::new(4);
        config.engine.binary = PathBuf::from("/nonexistent/storage_engine");
        let runner = ProcessRunner::new(&config, "test");
        assert_matches!(
            runner.start(CancellationToken::new()).await,
            Err(Error::Runner { instance: 4, .. })
        );
        assert_matches!(runner.wait().await, Err(Error::Runner { .. }));
    }
}
