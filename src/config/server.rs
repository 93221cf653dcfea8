//! Per-Engine Server Configuration
//!
//! Storage and launch parameters for one I/O engine instance, and the
//! validation applied before any provider is built from them.

use crate::domain::ports::{BdevClass, FormatRequest, PrepareRequest, ScmClass, StorageClass};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

// =============================================================================
// Storage Configuration
// =============================================================================

/// Block device configuration for one engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BdevConfig {
    /// Bdev class; absent means the service's default provider is used
    #[serde(default, rename = "bdev_class")]
    pub class: Option<BdevClass>,

    /// PCI addresses (nvme), device paths (kdev) or backing files (file)
    #[serde(default, rename = "bdev_list")]
    pub device_list: Vec<String>,

    /// Number of malloc devices to emulate
    #[serde(default, rename = "bdev_number")]
    pub device_count: u32,

    /// Size of each file or malloc device in GiB
    #[serde(default, rename = "bdev_size")]
    pub file_size_gb: u32,
}

/// Storage-class memory configuration for one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScmConfig {
    #[serde(rename = "scm_class")]
    pub class: ScmClass,

    #[serde(rename = "scm_mount")]
    pub mount_point: PathBuf,

    /// tmpfs size for the ram class
    #[serde(default, rename = "scm_size")]
    pub ram_size_gb: u32,

    /// pmem block devices for the dcpm class
    #[serde(default, rename = "scm_list")]
    pub device_list: Vec<String>,
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            class: ScmClass::Ram,
            mount_point: PathBuf::from("/mnt/storctl"),
            ram_size_gb: 4,
            device_list: Vec::new(),
        }
    }
}

/// Combined storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(flatten)]
    pub bdev: BdevConfig,
    #[serde(flatten)]
    pub scm: ScmConfig,
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Launch parameters for one engine subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Engine executable
    #[serde(default = "default_engine_binary")]
    pub binary: PathBuf,

    /// Number of service targets
    #[serde(default = "default_targets")]
    pub targets: u32,

    /// Number of helper xstreams per target
    #[serde(default)]
    pub xs_helpers: u32,

    /// Fabric interface name
    #[serde(default)]
    pub fabric_iface: Option<String>,

    /// Fabric provider
    #[serde(default)]
    pub provider: Option<String>,

    /// Extra environment passed to the engine
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Extra arguments appended to the engine command line
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("storage_engine")
}

fn default_targets() -> u32 {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            targets: default_targets(),
            xs_helpers: 0,
            fabric_iface: None,
            provider: None,
            env: BTreeMap::new(),
            extra_args: Vec::new(),
        }
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for one I/O engine instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Instance index, unique per host
    pub index: u32,

    #[serde(flatten)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl ServerConfig {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn with_bdev(mut self, bdev: BdevConfig) -> Self {
        self.storage.bdev = bdev;
        self
    }

    pub fn with_scm(mut self, scm: ScmConfig) -> Self {
        self.storage.scm = scm;
        self
    }

    /// Check storage and engine settings
    pub fn validate(&self) -> Result<()> {
        if self.engine.targets == 0 {
            return Err(self.invalid("targets must be greater than zero"));
        }
        self.validate_bdev()?;
        self.validate_scm()
    }

    fn validate_bdev(&self) -> Result<()> {
        let bdev = &self.storage.bdev;
        let class = match bdev.class {
            Some(class) => class,
            None if bdev.device_list.is_empty() => return Ok(()),
            None => return Err(self.invalid("bdev_list given without bdev_class")),
        };

        check_unique(&bdev.device_list).map_err(|dup| {
            self.invalid(&format!("duplicate bdev_list entry {}", dup))
        })?;

        match class {
            BdevClass::Nvme => {
                for addr in &bdev.device_list {
                    if !is_pci_address(addr) {
                        return Err(self.invalid(&format!("invalid nvme PCI address {:?}", addr)));
                    }
                }
            }
            BdevClass::Kdev => {
                if bdev.device_list.is_empty() {
                    return Err(self.invalid("kdev class requires a non-empty bdev_list"));
                }
                check_absolute(&bdev.device_list).map_err(|p| {
                    self.invalid(&format!("kdev path {:?} is not absolute", p))
                })?;
            }
            BdevClass::File => {
                if bdev.device_list.is_empty() {
                    return Err(self.invalid("file class requires a non-empty bdev_list"));
                }
                if bdev.file_size_gb == 0 {
                    return Err(self.invalid("file class requires bdev_size"));
                }
                check_absolute(&bdev.device_list).map_err(|p| {
                    self.invalid(&format!("file path {:?} is not absolute", p))
                })?;
            }
            BdevClass::Malloc => {
                if bdev.device_count == 0 {
                    return Err(self.invalid("malloc class requires bdev_number"));
                }
                if bdev.file_size_gb == 0 {
                    return Err(self.invalid("malloc class requires bdev_size"));
                }
            }
        }
        Ok(())
    }

    fn validate_scm(&self) -> Result<()> {
        let scm = &self.storage.scm;
        if scm.mount_point.as_os_str().is_empty() || !scm.mount_point.is_absolute() {
            return Err(self.invalid("scm_mount must be an absolute path"));
        }
        match scm.class {
            ScmClass::Ram => {
                if scm.ram_size_gb == 0 {
                    return Err(self.invalid("ram class requires scm_size"));
                }
                if !scm.device_list.is_empty() {
                    return Err(self.invalid("ram class does not take scm_list"));
                }
            }
            ScmClass::Dcpm => {
                if scm.device_list.len() != 1 {
                    return Err(self.invalid("dcpm class requires exactly one scm_list entry"));
                }
                check_absolute(&scm.device_list).map_err(|p| {
                    self.invalid(&format!("scm device {:?} is not absolute", p))
                })?;
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::Configuration(format!("server {}: {}", self.index, reason))
    }

    // =========================================================================
    // Provider Requests
    // =========================================================================

    pub fn bdev_class(&self) -> Option<StorageClass> {
        self.storage.bdev.class.map(StorageClass::Bdev)
    }

    pub fn scm_class(&self) -> StorageClass {
        StorageClass::Scm(self.storage.scm.class)
    }

    pub fn bdev_prepare_request(&self, reset: bool, target_user: Option<String>) -> PrepareRequest {
        PrepareRequest {
            devices: self.storage.bdev.device_list.clone(),
            reset,
            target_user,
            hugepages: None,
            class: self.bdev_class(),
        }
    }

    pub fn scm_prepare_request(&self, reset: bool) -> PrepareRequest {
        PrepareRequest {
            devices: self.storage.scm.device_list.clone(),
            reset,
            target_user: None,
            hugepages: None,
            class: Some(self.scm_class()),
        }
    }

    pub fn bdev_format_request(&self, force: bool) -> FormatRequest {
        let bdev = &self.storage.bdev;
        FormatRequest {
            devices: bdev.device_list.clone(),
            mount_point: None,
            size_gb: (bdev.file_size_gb > 0).then_some(bdev.file_size_gb),
            force,
            class: self.bdev_class(),
        }
    }

    pub fn scm_format_request(&self, force: bool) -> FormatRequest {
        let scm = &self.storage.scm;
        FormatRequest {
            devices: scm.device_list.clone(),
            mount_point: Some(scm.mount_point.clone()),
            size_gb: (scm.class == ScmClass::Ram).then_some(scm.ram_size_gb),
            force,
            class: Some(self.scm_class()),
        }
    }

    /// Command line for the engine, excluding the binary
    pub fn engine_args(&self, group: &str) -> Vec<String> {
        let mut args = vec![
            format!("--targets={}", self.engine.targets),
            format!("--xs-helpers={}", self.engine.xs_helpers),
            format!("--storage={}", self.storage.scm.mount_point.display()),
            format!("--instance-idx={}", self.index),
            format!("--group={}", group),
        ];
        args.extend(self.engine.extra_args.iter().cloned());
        args
    }

    /// Environment for the engine: fabric settings, then user entries
    pub fn engine_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(provider) = &self.engine.provider {
            env.insert("FI_PROVIDER".to_string(), provider.clone());
        }
        if let Some(iface) = &self.engine.fabric_iface {
            env.insert("OFI_INTERFACE".to_string(), iface.clone());
        }
        env.extend(self.engine.env.clone());
        env
    }
}

/// Check that no two servers share an index or scm mount point
pub fn validate_servers(servers: &[ServerConfig]) -> Result<()> {
    let mut indexes = HashSet::new();
    let mut mounts = HashSet::new();
    for server in servers {
        server.validate()?;
        if !indexes.insert(server.index) {
            return Err(Error::Configuration(format!(
                "duplicate server index {}",
                server.index
            )));
        }
        if !mounts.insert(server.storage.scm.mount_point.clone()) {
            return Err(Error::Configuration(format!(
                "server {}: scm_mount {} used by another server",
                server.index,
                server.storage.scm.mount_point.display()
            )));
        }
    }
    Ok(())
}

/// Matches the `dddd:bb:dd.f` domain:bus:device.function form
pub fn is_pci_address(addr: &str) -> bool {
    let (dbd, func) = match addr.rsplit_once('.') {
        Some(parts) => parts,
        None => return false,
    };
    let parts: Vec<&str> = dbd.split(':').collect();
    if parts.len() != 3 {
        return false;
    }
    let widths = [4, 2, 2];
    let hex_ok = parts
        .iter()
        .zip(widths)
        .all(|(p, w)| p.len() == w && p.chars().all(|c| c.is_ascii_hexdigit()));
    hex_ok && func.len() == 1 && func.chars().all(|c| ('0'..='7').contains(&c))
}

fn check_unique(list: &[String]) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for item in list {
        if !seen.insert(item) {
            return Err(item.clone());
        }
    }
    Ok(())
}

fn check_absolute(list: &[String]) -> std::result::Result<(), String> {
    match list.iter().find(|p| !Path::new(p).is_absolute()) {
        Some(p) => Err(p.clone()),
        None => Ok(()),
    }
}
