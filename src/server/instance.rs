//! I/O Server Instance
//!
//! One supervised storage engine: its storage providers, its runner and its
//! lifecycle state.
//!
//! ```text
//! Unstarted ──► Starting ──► Ready ──► Stopping ──► Stopped
//!     │             │          │           │
//!     └─────────────┴──────────┴───────────┴──► Errored
//! ```

use crate::config::ServerConfig;
use crate::domain::ports::{ExitState, RunnerRef, StorageProviderRef};
use crate::error::{Error, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =============================================================================
// Instance State
// =============================================================================

/// Lifecycle state of an engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Unstarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Errored,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Unstarted => "unstarted",
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Errored => "errored",
        }
    }

    /// No further transitions happen from here
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Errored)
    }

    /// The start attempt has been resolved one way or another
    pub fn is_settled(&self) -> bool {
        !matches!(self, InstanceState::Unstarted | InstanceState::Starting)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Superblock
// =============================================================================

/// File name of the superblock inside the scm mount point
pub const SUPERBLOCK_FILE: &str = "superblock";

pub const SUPERBLOCK_VERSION: u8 = 0;

/// Identity written to an instance's formatted storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u8,
    pub uuid: Uuid,
    pub system: String,
    #[serde(default)]
    pub rank: Option<u32>,
}

impl Superblock {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            version: SUPERBLOCK_VERSION,
            uuid: Uuid::new_v4(),
            system: system.into(),
            rank: None,
        }
    }

    pub fn path(mount_point: &Path) -> PathBuf {
        mount_point.join(SUPERBLOCK_FILE)
    }

    /// Read the superblock, `None` if the file does not exist
    pub fn load(mount_point: &Path) -> Result<Option<Self>> {
        let path = Self::path(mount_point);
        match std::fs::read_to_string(&path) {
            Ok(yaml) => Ok(Some(serde_yaml::from_str(&yaml)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn store(&self, mount_point: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(Self::path(mount_point), yaml)?;
        Ok(())
    }
}

// =============================================================================
// Instance
// =============================================================================

/// A supervised storage engine
pub struct IOServerInstance {
    config: ServerConfig,
    bdev: StorageProviderRef,
    scm: StorageProviderRef,
    runner: RunnerRef,
    state: watch::Sender<InstanceState>,
    stop_requested: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_exit: Mutex<Option<ExitState>>,
    changed_at: Mutex<DateTime<Utc>>,
    superblock: Mutex<Option<Superblock>>,
}

impl IOServerInstance {
    pub fn new(
        config: ServerConfig,
        bdev: StorageProviderRef,
        scm: StorageProviderRef,
        runner: RunnerRef,
    ) -> Self {
        let (state, _) = watch::channel(InstanceState::Unstarted);
        Self {
            config,
            bdev,
            scm,
            runner,
            state,
            stop_requested: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_exit: Mutex::new(None),
            changed_at: Mutex::new(Utc::now()),
            superblock: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u32 {
        self.config.index
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bdev_provider(&self) -> &StorageProviderRef {
        &self.bdev
    }

    pub fn scm_provider(&self) -> &StorageProviderRef {
        &self.scm
    }

    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    /// When the state last changed
    pub fn changed_at(&self) -> DateTime<Utc> {
        *self.changed_at.lock()
    }

    /// Why the instance entered `Errored`
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn last_exit(&self) -> Option<ExitState> {
        *self.last_exit.lock()
    }

    pub fn superblock(&self) -> Option<Superblock> {
        self.superblock.lock().clone()
    }

    /// Move from `from` to `to`; false if the instance was elsewhere
    fn transition(&self, from: &[InstanceState], to: InstanceState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            *self.changed_at.lock() = Utc::now();
            metrics::record_transition(self.index(), to.as_str(), to == InstanceState::Ready);
            debug!(instance = self.index(), state = %to, "Instance state changed");
        }
        moved
    }

    fn fail(&self, reason: String) {
        error!(instance = self.index(), reason = %reason, "Instance errored");
        *self.last_error.lock() = Some(reason);
        self.transition(
            &[
                InstanceState::Unstarted,
                InstanceState::Starting,
                InstanceState::Ready,
                InstanceState::Stopping,
            ],
            InstanceState::Errored,
        );
    }

    /// Start the runner and supervise it until it exits
    ///
    /// Returns when the engine has terminated or failed to start. A stop
    /// requested before this call leaves the instance `Stopped` without
    /// touching the runner.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.transition(&[InstanceState::Unstarted], InstanceState::Starting) {
            debug!(instance = self.index(), state = %self.state(), "Not starting instance");
            return;
        }

        if let Err(e) = self.runner.start(cancel.clone()).await {
            self.fail(e.to_string());
            return;
        }

        if self.transition(&[InstanceState::Starting], InstanceState::Ready) {
            info!(instance = self.index(), "Instance ready");
        } else if self.stop_requested.load(Ordering::SeqCst) {
            // Stop arrived while the runner was starting
            if let Err(e) = self.runner.stop().await {
                warn!(instance = self.index(), error = %e, "Failed to stop engine");
            }
        }

        let exit = self.runner.wait().await;
        self.finish(exit, cancel.is_cancelled());
    }

    fn finish(&self, exit: Result<ExitState>, cancelled: bool) {
        let state = match exit {
            Ok(state) => state,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };
        *self.last_exit.lock() = Some(state);

        let requested = self.stop_requested.load(Ordering::SeqCst) || cancelled;
        if requested {
            self.transition(
                &[InstanceState::Ready, InstanceState::Stopping],
                InstanceState::Stopped,
            );
        } else if state.success()
            && self.transition(&[InstanceState::Ready], InstanceState::Stopped)
        {
            info!(instance = self.index(), "Engine exited cleanly");
        } else {
            self.fail(format!("engine terminated unexpectedly with {}", state));
        }
    }

    /// Ask the instance to stop
    ///
    /// Idempotent: stopping a stopping, stopped or errored instance is a
    /// no-op. An instance that never started goes straight to `Stopped`.
    pub async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);

        if self.transition(&[InstanceState::Unstarted], InstanceState::Stopped) {
            return Ok(());
        }
        if self.transition(&[InstanceState::Starting], InstanceState::Stopping) {
            // The supervision task stops the runner once start returns
            return Ok(());
        }
        if self.transition(&[InstanceState::Ready], InstanceState::Stopping) {
            info!(instance = self.index(), "Stopping instance");
            return self.runner.stop().await;
        }
        Ok(())
    }

    /// Wait until the start attempt resolves; `Ok` only if `Ready`
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.subscribe();
        let state = *rx
            .wait_for(|s| s.is_settled())
            .await
            .map_err(|e| Error::HarnessState(e.to_string()))?;
        match state {
            InstanceState::Ready => Ok(()),
            other => Err(Error::Runner {
                instance: self.index(),
                reason: self
                    .last_error()
                    .unwrap_or_else(|| format!("instance is {}", other)),
            }),
        }
    }

    /// Wait until the instance reaches `Stopped` or `Errored`
    pub async fn wait_terminal(&self) -> InstanceState {
        let mut rx = self.subscribe();
        let settled = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        settled.unwrap_or_else(|_| self.state())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Format scm then bdev, then write a superblock if none exists
    ///
    /// Only allowed before the engine starts.
    pub async fn format_storage(&self, system: &str, force: bool) -> Result<Superblock> {
        if self.state() != InstanceState::Unstarted {
            return Err(Error::HarnessState(format!(
                "cannot format instance {} while {}",
                self.index(),
                self.state()
            )));
        }

        let mount = self.config.storage.scm.mount_point.clone();
        info!(instance = self.index(), mount = %mount.display(), force, "Formatting instance storage");

        self.scm.format(&self.config.scm_format_request(force)).await?;
        self.bdev.format(&self.config.bdev_format_request(force)).await?;

        let superblock = match self.load_superblock()? {
            Some(existing) if !force => existing,
            _ => {
                let fresh = Superblock::new(system);
                fresh.store(&mount)?;
                info!(instance = self.index(), uuid = %fresh.uuid, "Wrote superblock");
                fresh
            }
        };
        *self.superblock.lock() = Some(superblock.clone());
        Ok(superblock)
    }

    /// Read the superblock from the scm mount point and cache it
    pub fn load_superblock(&self) -> Result<Option<Superblock>> {
        let loaded = Superblock::load(&self.config.storage.scm.mount_point)?;
        if loaded.is_some() {
            *self.superblock.lock() = loaded.clone();
        }
        Ok(loaded)
    }

    /// Persist a superblock to the scm mount point and cache it
    pub fn store_superblock(&self, superblock: Superblock) -> Result<()> {
        superblock.store(&self.config.storage.scm.mount_point)?;
        *self.superblock.lock() = Some(superblock);
        Ok(())
    }
}

impl std::fmt::Debug for IOServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IOServerInstance")
            .field("index", &self.index())
            .field("state", &self.state())
            .field("bdev", &self.bdev.name())
            .field("scm", &self.scm.name())
            .finish()
    }
}
