//! I/O Server Harness
//!
//! Owns the ordered set of engine instances on this host and supervises
//! them once started. The instance set is append-only until `start` and
//! frozen afterwards.

use super::instance::{IOServerInstance, InstanceState};
use crate::error::{Error, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument, Span};

#[derive(Default)]
struct HarnessInner {
    instances: Vec<Arc<IOServerInstance>>,
    started: bool,
}

pub struct IOServerHarness {
    inner: RwLock<HarnessInner>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl IOServerHarness {
    pub fn new(span: Span) -> Self {
        Self {
            inner: RwLock::new(HarnessInner::default()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            span,
        }
    }

    /// Append an instance; only allowed before `start`
    pub fn add_instance(&self, instance: Arc<IOServerInstance>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.started {
            return Err(Error::HarnessState(format!(
                "cannot add instance {} to a started harness",
                instance.index()
            )));
        }
        if inner.instances.iter().any(|i| i.index() == instance.index()) {
            return Err(Error::HarnessState(format!(
                "instance {} already present",
                instance.index()
            )));
        }
        inner.instances.push(instance);
        Ok(())
    }

    /// Snapshot of the instances in insertion order
    pub fn instances(&self) -> Vec<Arc<IOServerInstance>> {
        self.inner.read().instances.clone()
    }

    pub fn instance(&self, index: u32) -> Option<Arc<IOServerInstance>> {
        self.inner
            .read()
            .instances
            .iter()
            .find(|i| i.index() == index)
            .cloned()
    }

    pub fn states(&self) -> Vec<(u32, InstanceState)> {
        self.inner
            .read()
            .instances
            .iter()
            .map(|i| (i.index(), i.state()))
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.inner.read().started
    }

    pub fn len(&self) -> usize {
        self.inner.read().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Launch every instance under its own supervision task
    ///
    /// Returns once every instance is `Ready` or has failed to start. One
    /// instance failing does not affect the others.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let instances = {
            let mut inner = self.inner.write();
            if inner.started {
                return Err(Error::HarnessState("harness already started".into()));
            }
            inner.started = true;
            inner.instances.clone()
        };

        info!(parent: &self.span, count = instances.len(), "Starting instances");

        let mut handles = Vec::with_capacity(instances.len());
        for instance in &instances {
            let instance = instance.clone();
            let token = cancel.child_token();
            let span = tracing::info_span!(parent: &self.span, "instance", index = instance.index());
            handles.push(tokio::spawn(
                async move { instance.run(token).await }.instrument(span),
            ));
        }
        self.tasks.lock().await.extend(handles);

        let results = join_all(instances.iter().map(|i| i.wait_ready())).await;
        for (instance, result) in instances.iter().zip(results) {
            if let Err(e) = result {
                warn!(parent: &self.span, instance = instance.index(), error = %e, "Instance failed to start");
            }
        }
        Ok(())
    }

    /// Ask every instance to stop; returns the first failure after trying all
    pub async fn stop_all(&self) -> Result<()> {
        let instances = self.instances();
        let results = join_all(instances.iter().map(|i| i.stop())).await;

        let mut first = None;
        for (instance, result) in instances.iter().zip(results) {
            if let Err(e) = result {
                warn!(parent: &self.span, instance = instance.index(), error = %e, "Failed to stop instance");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Wait for every supervision task to finish
    ///
    /// Handles are only released once their task has finished, so a wait
    /// that is dropped early leaves the rest for the next caller.
    pub async fn wait(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(handle) = tasks.first_mut() {
            let result = handle.await;
            tasks.remove(0);
            if let Err(e) = result {
                warn!(parent: &self.span, error = %e, "Supervision task panicked");
            }
        }
    }
}

impl Default for IOServerHarness {
    fn default() -> Self {
        Self::new(Span::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScmConfig, ServerConfig};
    use crate::domain::ports::{BdevClass, ExitState, ScmClass, StorageClass};
    use crate::ioserver::MockRunner;
    use crate::storage::MockProvider;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn instance(index: u32, runner: Arc<MockRunner>) -> Arc<IOServerInstance> {
        let config = ServerConfig::new(index).with_scm(ScmConfig {
            mount_point: format!("/mnt/storctl{}", index).into(),
            ..Default::default()
        });
        Arc::new(IOServerInstance::new(
            config,
            Arc::new(MockProvider::new("mock-bdev", StorageClass::Bdev(BdevClass::Nvme))),
            Arc::new(MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram))),
            runner,
        ))
    }

    fn mock_instance(index: u32) -> Arc<IOServerInstance> {
        instance(index, Arc::new(MockRunner::new(index)))
    }

    #[test]
    fn test_insertion_order() {
        let harness = IOServerHarness::default();
        for index in [3, 1, 2] {
            harness.add_instance(mock_instance(index)).unwrap();
        }
        let order: Vec<u32> = harness.instances().iter().map(|i| i.index()).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(harness.len(), 3);
        assert!(harness.instance(2).is_some());
        assert!(harness.instance(9).is_none());
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let harness = IOServerHarness::default();
        harness.add_instance(mock_instance(0)).unwrap();
        assert_matches!(harness.add_instance(mock_instance(0)), Err(Error::HarnessState(_)));
        assert_eq!(harness.len(), 1);
    }

    #[tokio::test]
    async fn test_add_after_start() {
        let harness = IOServerHarness::default();
        harness.add_instance(mock_instance(0)).unwrap();
        harness.start(CancellationToken::new()).await.unwrap();

        assert_matches!(harness.add_instance(mock_instance(1)), Err(Error::HarnessState(_)));
        assert_eq!(harness.len(), 1);
        assert_matches!(
            harness.start(CancellationToken::new()).await,
            Err(Error::HarnessState(_))
        );

        harness.stop_all().await.unwrap();
        harness.wait().await;
    }

    #[tokio::test]
    async fn test_failure_isolated() {
        let healthy = Arc::new(MockRunner::new(0));
        let crashing = Arc::new(MockRunner::new(1));
        let harness = IOServerHarness::default();
        harness.add_instance(instance(0, healthy.clone())).unwrap();
        harness.add_instance(instance(1, crashing.clone())).unwrap();
        harness
            .add_instance(instance(2, Arc::new(MockRunner::new(2).with_start_failure("no fabric"))))
            .unwrap();

        harness.start(CancellationToken::new()).await.unwrap();
        assert_eq!(
            harness.states(),
            vec![
                (0, InstanceState::Ready),
                (1, InstanceState::Ready),
                (2, InstanceState::Errored)
            ]
        );

        crashing.exit(ExitState::Exited(1));
        let crashed = harness.instance(1).unwrap();
        assert_eq!(crashed.wait_terminal().await, InstanceState::Errored);
        assert_eq!(harness.instance(0).unwrap().state(), InstanceState::Ready);

        harness.stop_all().await.unwrap();
        harness.wait().await;
        assert_eq!(harness.instance(0).unwrap().state(), InstanceState::Stopped);
        assert_eq!(healthy.stops(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_all() {
        let harness = IOServerHarness::default();
        harness.add_instance(mock_instance(0)).unwrap();
        harness.add_instance(mock_instance(1)).unwrap();

        let cancel = CancellationToken::new();
        harness.start(cancel.clone()).await.unwrap();
        cancel.cancel();
        harness.wait().await;

        assert!(harness.states().iter().all(|(_, s)| *s == InstanceState::Stopped));
        // Already stopped
        assert!(harness.stop_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_survives_cancelled_waiter() {
        let harness = IOServerHarness::default();
        harness.add_instance(mock_instance(0)).unwrap();
        harness.start(CancellationToken::new()).await.unwrap();

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = harness.wait() => panic!("wait returned while the instance was running"),
        }

        // Still supervised: a second wait blocks until the instance stops
        assert!(tokio::time::timeout(Duration::from_millis(100), harness.wait())
            .await
            .is_err());
        assert_eq!(harness.states(), vec![(0, InstanceState::Ready)]);

        harness.stop_all().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), harness.wait())
            .await
            .unwrap();
        assert_eq!(harness.states(), vec![(0, InstanceState::Stopped)]);
    }

    #[tokio::test]
    async fn test_stop_unstarted() {
        let harness = IOServerHarness::default();
        harness.add_instance(mock_instance(0)).unwrap();
        harness.stop_all().await.unwrap();
        assert_eq!(harness.states(), vec![(0, InstanceState::Stopped)]);
        assert!(!harness.is_started());
    }
}
