//! Storage Control Service
//!
//! Fleet-wide scan, prepare and format across every configured server.
//! Servers are handled concurrently; calls against the same provider are
//! serialized. Every server is attempted and reported, whatever happens to
//! the others.

use crate::config::{validate_servers, ServerConfig};
use crate::domain::ports::{
    FormatResponse, Inventory, PrepareResponse, StorageProviderRef, SystemExtRef,
};
use crate::error::Result;
use crate::pbin::Forwarder;
use crate::storage::{ForwardingProvider, ProviderFactory, ProviderSpec};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Span};

// =============================================================================
// Fleet Results
// =============================================================================

/// What happened on one server
#[derive(Debug)]
pub struct ServerOutcome<T> {
    pub index: u32,
    pub bdev: Result<T>,
    pub scm: Result<T>,
}

impl<T> ServerOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.bdev.is_ok() && self.scm.is_ok()
    }
}

/// Per-server outcomes in configuration order
#[derive(Debug)]
pub struct FleetResult<T> {
    pub servers: Vec<ServerOutcome<T>>,
}

impl<T> FleetResult<T> {
    pub fn succeeded(&self) -> bool {
        self.servers.iter().all(ServerOutcome::is_ok)
    }

    /// Indexes of servers with at least one failed provider call
    pub fn failed_servers(&self) -> Vec<u32> {
        self.servers
            .iter()
            .filter(|o| !o.is_ok())
            .map(|o| o.index)
            .collect()
    }

    pub fn outcome(&self, index: u32) -> Option<&ServerOutcome<T>> {
        self.servers.iter().find(|o| o.index == index)
    }
}

/// Fleet prepare options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetPrepareRequest {
    /// Release nvme devices back to the kernel instead of binding them
    pub bdev_reset: bool,
    /// Remove pmem namespaces and goals instead of creating them
    pub scm_reset: bool,
    /// Owner of prepared nvme resources
    pub target_user: Option<String>,
    /// Hugepages to reserve for nvme
    pub hugepages: Option<u32>,
}

// =============================================================================
// Service
// =============================================================================

struct ServerEntry {
    config: ServerConfig,
    bdev: StorageProviderRef,
    lock: Arc<Mutex<()>>,
}

pub struct StorageControlService {
    ext: Option<SystemExtRef>,
    scm: StorageProviderRef,
    scm_lock: Mutex<()>,
    servers: Vec<ServerEntry>,
    span: Span,
}

impl StorageControlService {
    /// Build per-server bdev providers and the shared scm provider
    ///
    /// Every server configuration is validated before any provider is
    /// built. Providers with a class are reached through `forwarder`; a
    /// server without a bdev class uses `default_bdev`.
    pub fn new(
        span: Span,
        ext: SystemExtRef,
        default_bdev: StorageProviderRef,
        scm: StorageProviderRef,
        servers: Vec<ServerConfig>,
        forwarder: Arc<Forwarder>,
    ) -> Result<Self> {
        validate_servers(&servers)?;

        let scm: StorageProviderRef = Arc::new(ForwardingProvider::new(
            ProviderSpec::Scm,
            scm,
            forwarder.clone(),
        ));

        let mut entries = Vec::with_capacity(servers.len());
        for config in servers {
            let bdev: StorageProviderRef = if config.storage.bdev.class.is_some() {
                let spec = ProviderSpec::Bdev(config.storage.bdev.clone());
                let local = ProviderFactory::create(&spec, ext.clone())?;
                Arc::new(ForwardingProvider::new(spec, local, forwarder.clone()))
            } else {
                default_bdev.clone()
            };
            entries.push((config, bdev));
        }

        let mut svc = Self::with_providers(span, scm, entries, default_bdev);
        svc.ext = Some(ext);
        Ok(svc)
    }

    /// Assemble a service from already-built providers
    ///
    /// Servers sharing `default_bdev` share one lock.
    pub fn with_providers(
        span: Span,
        scm: StorageProviderRef,
        servers: Vec<(ServerConfig, StorageProviderRef)>,
        default_bdev: StorageProviderRef,
    ) -> Self {
        let default_lock = Arc::new(Mutex::new(()));
        let servers = servers
            .into_iter()
            .map(|(config, bdev)| {
                let lock = if Arc::ptr_eq(&bdev, &default_bdev) {
                    default_lock.clone()
                } else {
                    Arc::new(Mutex::new(()))
                };
                ServerEntry { config, bdev, lock }
            })
            .collect();

        Self {
            ext: None,
            scm,
            scm_lock: Mutex::new(()),
            servers,
            span,
        }
    }

    pub fn ext(&self) -> Option<&SystemExtRef> {
        self.ext.as_ref()
    }

    pub fn server_configs(&self) -> Vec<&ServerConfig> {
        self.servers.iter().map(|s| &s.config).collect()
    }

    /// Providers bound to one server, for building its instance
    pub fn providers(&self, index: u32) -> Option<(StorageProviderRef, StorageProviderRef)> {
        self.servers
            .iter()
            .find(|s| s.config.index == index)
            .map(|s| (s.bdev.clone(), self.scm.clone()))
    }

    pub async fn scan(&self) -> FleetResult<Inventory> {
        info!(parent: &self.span, servers = self.servers.len(), "Scanning storage");
        self.fan_out("scan", |bdev, _| async move { bdev.scan().await }, |scm, _| async move {
            scm.scan().await
        })
        .await
    }

    pub async fn prepare(&self, request: &FleetPrepareRequest) -> FleetResult<PrepareResponse> {
        info!(parent: &self.span, servers = self.servers.len(), ?request, "Preparing storage");
        self.fan_out(
            "prepare",
            |bdev, config| {
                let mut req =
                    config.bdev_prepare_request(request.bdev_reset, request.target_user.clone());
                req.hugepages = request.hugepages;
                async move { bdev.prepare(&req).await }
            },
            |scm, config| {
                let req = config.scm_prepare_request(request.scm_reset);
                async move { scm.prepare(&req).await }
            },
        )
        .await
    }

    pub async fn format(&self, force: bool) -> FleetResult<FormatResponse> {
        info!(parent: &self.span, servers = self.servers.len(), force, "Formatting storage");
        self.fan_out(
            "format",
            |bdev, config| {
                let req = config.bdev_format_request(force);
                async move { bdev.format(&req).await }
            },
            |scm, config| {
                let req = config.scm_format_request(force);
                async move { scm.format(&req).await }
            },
        )
        .await
    }

    async fn fan_out<T, B, BF, S, SF>(&self, op: &str, bdev_call: B, scm_call: S) -> FleetResult<T>
    where
        B: Fn(StorageProviderRef, &ServerConfig) -> BF,
        BF: Future<Output = Result<T>>,
        S: Fn(StorageProviderRef, &ServerConfig) -> SF,
        SF: Future<Output = Result<T>>,
    {
        let calls = self.servers.iter().map(|server| {
            let bdev_fut = bdev_call(server.bdev.clone(), &server.config);
            let scm_fut = scm_call(self.scm.clone(), &server.config);
            async move {
                let bdev = {
                    let _guard = server.lock.lock().await;
                    bdev_fut.await
                };
                let scm = {
                    let _guard = self.scm_lock.lock().await;
                    scm_fut.await
                };
                self.log_outcome(op, server.config.index, &bdev, &scm);
                ServerOutcome {
                    index: server.config.index,
                    bdev,
                    scm,
                }
            }
        });

        let result = FleetResult {
            servers: join_all(calls).await,
        };
        if !result.succeeded() {
            warn!(parent: &self.span, op, failed = ?result.failed_servers(), "Fleet operation partially failed");
        }
        result
    }

    fn log_outcome<T>(&self, op: &str, index: u32, bdev: &Result<T>, scm: &Result<T>) {
        match (bdev, scm) {
            (Ok(_), Ok(_)) => debug!(parent: &self.span, op, server = index, "Server succeeded"),
            _ => {
                if let Err(e) = bdev {
                    warn!(parent: &self.span, op, server = index, error = %e, "Bdev call failed");
                }
                if let Err(e) = scm {
                    warn!(parent: &self.span, op, server = index, error = %e, "Scm call failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BdevConfig, ScmConfig};
    use crate::domain::ports::{BdevClass, DeviceInfo, ScmClass, StorageClass};
    use crate::error::Error;
    use crate::pbin::{ForwardingPolicy, HelperDescriptor};
    use crate::storage::{MockOp, MockProvider};
    use crate::system::MockExt;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn server(index: u32) -> ServerConfig {
        ServerConfig::new(index).with_scm(ScmConfig {
            mount_point: format!("/mnt/storctl{}", index).into(),
            ..Default::default()
        })
    }

    fn nvme(name: &str, addr: &str) -> Arc<MockProvider> {
        Arc::new(
            MockProvider::new(name, StorageClass::Bdev(BdevClass::Nvme))
                .with_devices(vec![DeviceInfo::bare(addr)]),
        )
    }

    fn local_forwarder() -> Arc<Forwarder> {
        Arc::new(Forwarder::new(
            ForwardingPolicy::new(true, false),
            HelperDescriptor::named("storctl-no-such-helper-binary"),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn test_partial_failure_reported_per_server() {
        let scm = Arc::new(MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram)));
        let a = nvme("bdev-a", "0000:81:00.0");
        let b = nvme("bdev-b", "0000:82:00.0");
        b.fail(MockOp::Scan, "controller offline");
        let default_bdev: StorageProviderRef =
            Arc::new(MockProvider::new("default", StorageClass::Bdev(BdevClass::Malloc)));

        let svc = StorageControlService::with_providers(
            Span::none(),
            scm,
            vec![
                (server(0), a.clone() as StorageProviderRef),
                (server(1), b.clone() as StorageProviderRef),
            ],
            default_bdev,
        );

        let result = svc.scan().await;
        assert!(!result.succeeded());
        assert_eq!(result.failed_servers(), vec![1]);

        let ok = result.outcome(0).unwrap();
        assert_eq!(ok.bdev.as_ref().unwrap().devices[0].path, "0000:81:00.0");
        assert_matches!(
            &result.outcome(1).unwrap().bdev,
            Err(Error::Provider { reason, .. }) if reason == "controller offline"
        );
        // Scm still attempted on the failing server
        assert!(result.outcome(1).unwrap().scm.is_ok());
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_shared_providers_serialized() {
        let scm = Arc::new(
            MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram))
                .with_delay(Duration::from_millis(20)),
        );
        let default_bdev = Arc::new(
            MockProvider::new("default", StorageClass::Bdev(BdevClass::Malloc))
                .with_delay(Duration::from_millis(20)),
        );
        let shared: StorageProviderRef = default_bdev.clone();

        let svc = StorageControlService::with_providers(
            Span::none(),
            scm.clone(),
            (0..4).map(|i| (server(i), shared.clone())).collect(),
            shared.clone(),
        );

        let result = svc.format(false).await;
        assert!(result.succeeded());
        assert_eq!(result.servers.len(), 4);
        assert_eq!(scm.calls(), 4);
        assert_eq!(scm.max_concurrency(), 1);
        assert_eq!(default_bdev.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_order_matches_configuration() {
        let scm = Arc::new(MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram)));
        let default_bdev: StorageProviderRef =
            Arc::new(MockProvider::new("default", StorageClass::Bdev(BdevClass::Malloc)));
        let svc = StorageControlService::with_providers(
            Span::none(),
            scm,
            vec![
                (server(5), nvme("a", "0000:81:00.0") as StorageProviderRef),
                (server(2), nvme("b", "0000:82:00.0") as StorageProviderRef),
                (server(7), nvme("c", "0000:83:00.0") as StorageProviderRef),
            ],
            default_bdev,
        );

        let result = svc.prepare(&FleetPrepareRequest::default()).await;
        let order: Vec<u32> = result.servers.iter().map(|o| o.index).collect();
        assert_eq!(order, vec![5, 2, 7]);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let ext: SystemExtRef = Arc::new(MockExt::new(false));
        let bad = server(0).with_bdev(BdevConfig {
            class: Some(BdevClass::Nvme),
            device_list: vec!["not-a-pci-address".into()],
            ..Default::default()
        });

        let result = StorageControlService::new(
            Span::none(),
            ext.clone(),
            Arc::new(MockProvider::new("default", StorageClass::Bdev(BdevClass::Malloc))),
            Arc::new(MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram))),
            vec![server(1), bad],
            local_forwarder(),
        );
        assert_matches!(result.err(), Some(Error::Configuration(msg)) if msg.contains("not-a-pci-address"));
    }

    #[tokio::test]
    async fn test_builds_providers_per_server() {
        let ext: SystemExtRef = Arc::new(MockExt::new(false));
        let malloc = server(0).with_bdev(BdevConfig {
            class: Some(BdevClass::Malloc),
            device_count: 2,
            file_size_gb: 1,
            ..Default::default()
        });
        let default_bdev: StorageProviderRef =
            Arc::new(MockProvider::new("default", StorageClass::Bdev(BdevClass::Nvme)));

        let svc = StorageControlService::new(
            Span::none(),
            ext,
            default_bdev,
            Arc::new(MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram))),
            vec![malloc, server(1)],
            local_forwarder(),
        )
        .unwrap();

        let (bdev0, _) = svc.providers(0).unwrap();
        let (bdev1, _) = svc.providers(1).unwrap();
        assert_eq!(bdev0.name(), "bdev-malloc");
        assert_eq!(bdev1.name(), "default");
        assert!(svc.providers(9).is_none());

        let result = svc.scan().await;
        assert!(result.succeeded());
        assert_eq!(result.outcome(0).unwrap().bdev.as_ref().unwrap().devices.len(), 2);
    }
}
