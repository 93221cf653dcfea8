//! Mock Runner
//!
//! Deterministic stand-in for an engine process. Tests decide when it
//! starts failing and when, and how, it exits.

use crate::domain::ports::{ExitState, Runner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct MockRunner {
    index: u32,
    start_failure: Mutex<Option<String>>,
    stop_exit: ExitState,
    exit: Arc<watch::Sender<Option<ExitState>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockRunner {
    pub fn new(index: u32) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            index,
            start_failure: Mutex::new(None),
            stop_exit: ExitState::Exited(0),
            exit: Arc::new(tx),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Make `start` fail with this reason
    pub fn with_start_failure(self, reason: impl Into<String>) -> Self {
        *self.start_failure.lock() = Some(reason.into());
        self
    }

    /// How the engine exits when asked to stop
    pub fn with_stop_exit(mut self, state: ExitState) -> Self {
        self.stop_exit = state;
        self
    }

    /// Make the engine terminate on its own
    pub fn exit(&self, state: ExitState) {
        self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(state);
                true
            } else {
                false
            }
        });
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.start_failure.lock().clone() {
            return Err(Error::Runner {
                instance: self.index,
                reason,
            });
        }

        let exit = self.exit.clone();
        let on_cancel = self.stop_exit;
        tokio::spawn(async move {
            let mut rx = exit.subscribe();
            tokio::select! {
                _ = cancel.cancelled() => {
                    exit.send_if_modified(|current| {
                        if current.is_none() {
                            *current = Some(on_cancel);
                            true
                        } else {
                            false
                        }
                    });
                }
                _ = rx.wait_for(|state| state.is_some()) => {}
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.exit(self.stop_exit);
        Ok(())
    }

    async fn wait(&self) -> Result<ExitState> {
        let mut rx = self.exit.subscribe();
        let state = rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|e| Error::Runner {
                instance: self.index,
                reason: e.to_string(),
            })?;
        (*state).ok_or_else(|| Error::Runner {
            instance: self.index,
            reason: "exit state missing".into(),
        })
    }
}
