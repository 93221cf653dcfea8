//! Mock Storage Provider
//!
//! In-memory provider exposing the same capability set as the hardware
//! providers. Formats are reflected in subsequent scans; failures can be
//! injected per operation.

use crate::domain::ports::{
    DeviceInfo, FormatRequest, FormatResponse, Inventory, PrepareRequest, PrepareResponse,
    StorageClass, StorageProvider,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Operation selector for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Scan,
    Prepare,
    Format,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<DeviceInfo>,
    prepared: Vec<String>,
    failures: Vec<(MockOp, String)>,
}

/// Test double for any storage class
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    class: StorageClass,
    state: Mutex<MockState>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, class: StorageClass) -> Self {
        Self {
            name: name.into(),
            class,
            state: Mutex::new(MockState::default()),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Seed the devices reported by scan
    pub fn with_devices(self, devices: Vec<DeviceInfo>) -> Self {
        self.state.lock().devices = devices;
        self
    }

    /// Make every operation take this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail(&self, op: MockOp, reason: impl Into<String>) {
        self.state.lock().failures.push((op, reason.into()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Number of capability calls made
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping calls observed
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prepared(&self) -> Vec<String> {
        self.state.lock().prepared.clone()
    }

    async fn enter(&self, op: MockOp) -> Result<InFlight<'_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .state
            .lock()
            .failures
            .iter()
            .find(|(o, _)| *o == op)
            .map(|(_, reason)| reason.clone());
        match failure {
            Some(reason) => Err(Error::provider(self.name.clone(), reason)),
            None => Ok(guard),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageProvider for MockProvider {
    async fn scan(&self) -> Result<Inventory> {
        let _guard = self.enter(MockOp::Scan).await?;
        Ok(Inventory::new(self.class, self.state.lock().devices.clone()))
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse> {
        let _guard = self.enter(MockOp::Prepare).await?;
        let mut state = self.state.lock();
        let prepared = if request.devices.is_empty() {
            state.devices.iter().map(|d| d.path.clone()).collect()
        } else {
            request.devices.clone()
        };
        if request.reset {
            state.prepared.retain(|p| !prepared.contains(p));
        } else {
            state.prepared.extend(prepared.iter().cloned());
        }
        Ok(PrepareResponse {
            prepared,
            reboot_required: false,
        })
    }

    async fn format(&self, request: &FormatRequest) -> Result<FormatResponse> {
        let _guard = self.enter(MockOp::Format).await?;
        let mut state = self.state.lock();

        let targets: Vec<String> = if request.devices.is_empty() {
            state.devices.iter().map(|d| d.path.clone()).collect()
        } else {
            request.devices.clone()
        };

        for path in &targets {
            if !state.devices.iter().any(|d| &d.path == path) {
                state.devices.push(DeviceInfo::bare(path.clone()));
            }
            if let Some(device) = state.devices.iter_mut().find(|d| &d.path == path) {
                if device.formatted && !request.force {
                    return Err(Error::provider(
                        self.name.clone(),
                        format!("{} already formatted", path),
                    ));
                }
                device.formatted = true;
                device.mount_point = request.mount_point.clone();
                if let Some(size) = request.size_gb {
                    device.capacity_bytes = size as u64 * (1 << 30);
                }
            }
        }

        Ok(FormatResponse {
            formatted: targets,
            mount_point: request.mount_point.clone(),
        })
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{BdevClass, ScmClass};
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_format_reflected_in_scan() {
        let provider = MockProvider::new("mock-scm", StorageClass::Scm(ScmClass::Ram));
        let request = FormatRequest {
            devices: vec!["/dev/pmem0".into()],
            mount_point: Some(PathBuf::from("/mnt/s0")),
            size_gb: Some(16),
            ..Default::default()
        };

        provider.format(&request).await.unwrap();
        let inv = provider.scan().await.unwrap();

        let device = inv.device("/dev/pmem0").unwrap();
        assert!(device.formatted);
        assert_eq!(device.mount_point, Some(PathBuf::from("/mnt/s0")));
        assert_eq!(device.capacity_bytes, 16 << 30);
    }

    #[tokio::test]
    async fn test_reformat_requires_force() {
        let provider = MockProvider::new("mock-bdev", StorageClass::Bdev(BdevClass::Nvme))
            .with_devices(vec![DeviceInfo::bare("0000:81:00.0")]);

        provider.format(&FormatRequest::default()).await.unwrap();
        assert_matches!(
            provider.format(&FormatRequest::default()).await,
            Err(Error::Provider { .. })
        );

        let forced = FormatRequest {
            force: true,
            ..Default::default()
        };
        let resp = provider.format(&forced).await.unwrap();
        assert_eq!(resp.formatted, vec!["0000:81:00.0".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = MockProvider::new("mock-bdev", StorageClass::Bdev(BdevClass::Nvme));
        provider.fail(MockOp::Scan, "controller offline");

        assert_matches!(provider.scan().await, Err(Error::Provider { reason, .. }) if reason == "controller offline");
        assert!(provider.prepare(&PrepareRequest::default()).await.is_ok());

        provider.clear_failures();
        assert!(provider.scan().await.is_ok());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_prepare_and_reset() {
        let provider = MockProvider::new("mock-bdev", StorageClass::Bdev(BdevClass::Nvme))
            .with_devices(vec![DeviceInfo::bare("0000:81:00.0"), DeviceInfo::bare("0000:82:00.0")]);

        provider.prepare(&PrepareRequest::default()).await.unwrap();
        assert_eq!(provider.prepared().len(), 2);

        let reset = PrepareRequest {
            devices: vec!["0000:81:00.0".into()],
            reset: true,
            ..Default::default()
        };
        provider.prepare(&reset).await.unwrap();
        assert_eq!(provider.prepared(), vec!["0000:82:00.0".to_string()]);
    }
}
