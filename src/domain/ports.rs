//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the control plane and the
//! host: storage providers, engine runners and the OS extension. Adapters
//! implement these traits; test doubles implement the same capability set.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Storage Classes
// =============================================================================

/// Block device classes an engine can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BdevClass {
    Nvme,
    Kdev,
    File,
    Malloc,
}

impl std::fmt::Display for BdevClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BdevClass::Nvme => write!(f, "nvme"),
            BdevClass::Kdev => write!(f, "kdev"),
            BdevClass::File => write!(f, "file"),
            BdevClass::Malloc => write!(f, "malloc"),
        }
    }
}

/// Storage-class memory classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScmClass {
    /// tmpfs emulation
    Ram,
    /// Persistent memory modules
    Dcpm,
}

impl std::fmt::Display for ScmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScmClass::Ram => write!(f, "ram"),
            ScmClass::Dcpm => write!(f, "dcpm"),
        }
    }
}

/// Class of storage reported in an inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "class")]
pub enum StorageClass {
    Bdev(BdevClass),
    Scm(ScmClass),
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageClass::Bdev(class) => write!(f, "bdev-{}", class),
            StorageClass::Scm(class) => write!(f, "scm-{}", class),
        }
    }
}

// =============================================================================
// Provider Request/Response Types
// =============================================================================

/// A device seen by a provider scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device path or PCI address
    pub path: String,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Capacity in bytes
    pub capacity_bytes: u64,
    /// Whether the device carries a filesystem or engine format
    pub formatted: bool,
    /// Where the device is mounted, if anywhere
    pub mount_point: Option<PathBuf>,
}

impl DeviceInfo {
    /// Device with only a path known
    pub fn bare(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            model: String::new(),
            serial: String::new(),
            capacity_bytes: 0,
            formatted: false,
            mount_point: None,
        }
    }
}

/// Result of a provider scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    pub class: StorageClass,
    pub devices: Vec<DeviceInfo>,
    pub scanned_at: DateTime<Utc>,
}

impl Inventory {
    pub fn new(class: StorageClass, devices: Vec<DeviceInfo>) -> Self {
        Self {
            class,
            devices,
            scanned_at: Utc::now(),
        }
    }

    /// Total capacity across all devices
    pub fn total_capacity_bytes(&self) -> u64 {
        self.devices.iter().map(|d| d.capacity_bytes).sum()
    }

    pub fn device(&self, path: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.path == path)
    }
}

/// Request to prepare devices for engine use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Devices to prepare; empty means every device the provider manages
    pub devices: Vec<String>,
    /// Undo a previous prepare instead
    pub reset: bool,
    /// User that should own prepared resources
    pub target_user: Option<String>,
    /// Number of hugepages to reserve (nvme)
    pub hugepages: Option<u32>,
    /// Class hint for providers shared across classes
    pub class: Option<StorageClass>,
}

/// Result of a prepare operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub prepared: Vec<String>,
    pub reboot_required: bool,
}

/// Request to format devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRequest {
    pub devices: Vec<String>,
    /// Mount point for scm formats
    pub mount_point: Option<PathBuf>,
    /// Size in GiB for ram and file backed classes
    pub size_gb: Option<u32>,
    /// Reformat even if already formatted
    pub force: bool,
    /// Class hint for providers shared across classes
    pub class: Option<StorageClass>,
}

/// Result of a format operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatResponse {
    pub formatted: Vec<String>,
    pub mount_point: Option<PathBuf>,
}

// =============================================================================
// Storage Provider Port
// =============================================================================

/// Hardware-facing capability set implemented once per storage class
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Enumerate managed devices
    async fn scan(&self) -> Result<Inventory>;

    /// Prepare devices for engine use
    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse>;

    /// Format devices
    async fn format(&self, request: &FormatRequest) -> Result<FormatResponse>;

    /// Provider name used in logs and errors
    fn name(&self) -> String;
}

// =============================================================================
// Runner Port
// =============================================================================

/// How an engine subprocess terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
}

impl ExitState {
    pub fn success(&self) -> bool {
        matches!(self, ExitState::Exited(0))
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exit code {}", code),
            ExitState::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// Lifecycle of one storage engine subprocess
#[async_trait]
pub trait Runner: Send + Sync {
    /// Launch the engine; cancelling the token asks it to terminate
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Ask a running engine to terminate
    async fn stop(&self) -> Result<()>;

    /// Wait for the engine to exit
    async fn wait(&self) -> Result<ExitState>;
}

// =============================================================================
// OS Extension Port
// =============================================================================

/// Host operations used by providers
#[async_trait]
pub trait SystemExt: Send + Sync {
    /// Whether the current process holds administrative privilege
    fn is_privileged(&self) -> bool;

    /// Root of the sysfs tree
    fn sysfs_root(&self) -> PathBuf;

    async fn is_mounted(&self, target: &Path) -> Result<bool>;

    async fn mount(&self, source: &str, target: &Path, fstype: &str, options: &str) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    async fn mkfs(&self, device: &str, fstype: &str, force: bool) -> Result<()>;

    /// Run a host tool and return its stdout
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageProviderRef = Arc<dyn StorageProvider>;
pub type RunnerRef = Arc<dyn Runner>;
pub type SystemExtRef = Arc<dyn SystemExt>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_class_display() {
        assert_eq!(format!("{}", StorageClass::Bdev(BdevClass::Nvme)), "bdev-nvme");
        assert_eq!(format!("{}", StorageClass::Scm(ScmClass::Dcpm)), "scm-dcpm");
        assert_eq!(format!("{}", BdevClass::Malloc), "malloc");
    }

    #[test]
    fn test_exit_state() {
        assert!(ExitState::Exited(0).success());
        assert!(!ExitState::Exited(1).success());
        assert!(!ExitState::Signaled(9).success());
        assert_eq!(format!("{}", ExitState::Signaled(15)), "signal 15");
    }

    #[test]
    fn test_inventory_capacity() {
        let mut a = DeviceInfo::bare("/dev/pmem0");
        a.capacity_bytes = 100;
        let mut b = DeviceInfo::bare("/dev/pmem1");
        b.capacity_bytes = 50;
        let inv = Inventory::new(StorageClass::Scm(ScmClass::Dcpm), vec![a, b]);
        assert_eq!(inv.total_capacity_bytes(), 150);
        assert!(inv.device("/dev/pmem1").is_some());
        assert!(inv.device("/dev/pmem2").is_none());
    }
}
