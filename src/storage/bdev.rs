//! Block Device Provider
//!
//! Scans, prepares and formats the block devices bound to one engine.
//! NVMe controllers are enumerated from sysfs and addressed by PCI address;
//! kdev, file and malloc classes emulate bdevs on kernel devices, regular
//! files and memory.

use crate::config::BdevConfig;
use crate::domain::ports::{
    BdevClass, DeviceInfo, FormatRequest, FormatResponse, Inventory, PrepareRequest,
    PrepareResponse, StorageClass, StorageProvider, SystemExtRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// SPDK device binding script
pub const SPDK_SETUP_SCRIPT: &str = "spdk-setup.sh";

/// Default hugepage reservation for prepare
pub const DEFAULT_HUGEPAGES: u32 = 4096;

const GIB: u64 = 1 << 30;

// =============================================================================
// Bdev Provider
// =============================================================================

/// Block device provider for one engine's bdev configuration
pub struct BdevProvider {
    class: BdevClass,
    config: BdevConfig,
    ext: SystemExtRef,
}

impl BdevProvider {
    /// Create a provider; the config must name a class
    pub fn new(config: BdevConfig, ext: SystemExtRef) -> Result<Self> {
        let class = config.class.ok_or_else(|| {
            Error::Configuration("bdev provider requires bdev_class".into())
        })?;
        Ok(Self { class, config, ext })
    }

    pub fn class(&self) -> BdevClass {
        self.class
    }

    fn storage_class(&self) -> StorageClass {
        StorageClass::Bdev(self.class)
    }

    fn require_privilege(&self, operation: &str) -> Result<()> {
        if !self.ext.is_privileged() {
            return Err(Error::privilege(format!("{} {}", self.name(), operation)));
        }
        Ok(())
    }

    /// Devices targeted by a request, defaulting to the configured list
    fn targets<'a>(&'a self, requested: &'a [String]) -> &'a [String] {
        if requested.is_empty() {
            &self.config.device_list
        } else {
            requested
        }
    }

    fn malloc_names(&self) -> Vec<String> {
        (0..self.config.device_count)
            .map(|i| format!("Malloc{}", i))
            .collect()
    }

    // =========================================================================
    // Scan
    // =========================================================================

    fn scan_nvme(&self) -> Result<Vec<DeviceInfo>> {
        let nvme_path = self.ext.sysfs_root().join("class/nvme");
        if !nvme_path.exists() {
            debug!("No NVMe sysfs path found at {:?}", nvme_path);
            return Ok(Vec::new());
        }

        let mut devices = Vec::new();
        for entry in fs::read_dir(&nvme_path)? {
            let entry = entry?;
            let controller = entry.file_name().to_string_lossy().to_string();
            if !controller.starts_with("nvme") {
                continue;
            }

            let ctrl_path = entry.path();
            let address = match read_sysfs_attr(&ctrl_path, "address") {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Skipping controller {}: {}", controller, e);
                    continue;
                }
            };

            if !self.config.device_list.is_empty() && !self.config.device_list.contains(&address) {
                continue;
            }

            devices.push(DeviceInfo {
                model: read_sysfs_attr(&ctrl_path, "model").unwrap_or_default(),
                serial: read_sysfs_attr(&ctrl_path, "serial").unwrap_or_default(),
                capacity_bytes: self.namespace_capacity(&controller),
                formatted: false,
                mount_point: None,
                path: address,
            });
        }

        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    /// Sum of namespace sizes for a controller (nvme0 -> nvme0n1, nvme0n2 ...)
    fn namespace_capacity(&self, controller: &str) -> u64 {
        let block_path = self.ext.sysfs_root().join("class/block");
        let entries = match fs::read_dir(&block_path) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                is_namespace_of(&name, controller)
            })
            .filter_map(|e| read_sysfs_attr(&e.path(), "size").ok())
            .filter_map(|size| size.parse::<u64>().ok())
            .map(|sectors| sectors * 512)
            .sum()
    }

    /// PCI address -> namespace block devices, via sysfs
    fn namespaces_for_address(&self, address: &str) -> Result<Vec<String>> {
        let nvme_path = self.ext.sysfs_root().join("class/nvme");
        let block_path = self.ext.sysfs_root().join("class/block");

        for entry in fs::read_dir(&nvme_path)? {
            let entry = entry?;
            let controller = entry.file_name().to_string_lossy().to_string();
            if read_sysfs_attr(&entry.path(), "address").ok().as_deref() != Some(address) {
                continue;
            }

            let mut namespaces: Vec<String> = fs::read_dir(&block_path)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|name| is_namespace_of(name, &controller))
                .map(|name| format!("/dev/{}", name))
                .collect();
            namespaces.sort();
            return Ok(namespaces);
        }

        Err(Error::provider(
            self.name(),
            format!("no controller with address {}", address),
        ))
    }

    fn scan_kdev(&self) -> Result<Vec<DeviceInfo>> {
        let block_path = self.ext.sysfs_root().join("class/block");
        self.config
            .device_list
            .iter()
            .map(|dev| {
                let name = Path::new(dev)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let sys = block_path.join(&name);
                let sectors: u64 = read_sysfs_attr(&sys, "size")
                    .map_err(|_| Error::provider(self.name(), format!("device {} not found", dev)))?
                    .parse()
                    .map_err(|_| Error::provider(self.name(), format!("invalid size for {}", dev)))?;

                Ok(DeviceInfo {
                    model: read_sysfs_attr(&sys, "device/model").unwrap_or_default(),
                    serial: read_sysfs_attr(&sys, "device/serial").unwrap_or_default(),
                    capacity_bytes: sectors * 512,
                    ..DeviceInfo::bare(dev.clone())
                })
            })
            .collect()
    }

    async fn scan_file(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();
        for path in &self.config.device_list {
            let mut device = DeviceInfo::bare(path.clone());
            if let Ok(meta) = tokio::fs::metadata(path).await {
                device.capacity_bytes = meta.len();
                device.formatted = meta.len() > 0;
            }
            devices.push(device);
        }
        Ok(devices)
    }

    fn scan_malloc(&self) -> Vec<DeviceInfo> {
        let size = self.config.file_size_gb as u64 * GIB;
        self.malloc_names()
            .into_iter()
            .map(|name| DeviceInfo {
                model: "malloc".to_string(),
                capacity_bytes: size,
                ..DeviceInfo::bare(name)
            })
            .collect()
    }

    // =========================================================================
    // Prepare / Format
    // =========================================================================

    async fn prepare_nvme(&self, request: &PrepareRequest) -> Result<PrepareResponse> {
        self.require_privilege("prepare")?;

        let devices = self.targets(&request.devices).to_vec();
        let mut args = vec![
            format!("PCI_ALLOWED={}", devices.join(" ")),
            format!("NRHUGE={}", request.hugepages.unwrap_or(DEFAULT_HUGEPAGES)),
        ];
        if let Some(user) = &request.target_user {
            args.push(format!("TARGET_USER={}", user));
        }
        args.push(SPDK_SETUP_SCRIPT.to_string());
        args.push(if request.reset { "reset" } else { "config" }.to_string());

        self.ext.run("env", &args).await?;
        info!("Prepared {} NVMe controllers (reset: {})", devices.len(), request.reset);

        Ok(PrepareResponse {
            prepared: devices,
            reboot_required: false,
        })
    }

    async fn format_nvme(&self, request: &FormatRequest) -> Result<Vec<String>> {
        self.require_privilege("format")?;

        let mut formatted = Vec::new();
        for address in self.targets(&request.devices) {
            for ns in self.namespaces_for_address(address)? {
                self.ext
                    .run("nvme", &["format".to_string(), ns.clone(), "--force".to_string()])
                    .await?;
                debug!("Formatted namespace {} on {}", ns, address);
            }
            formatted.push(address.clone());
        }
        Ok(formatted)
    }

    async fn format_kdev(&self, request: &FormatRequest) -> Result<Vec<String>> {
        self.require_privilege("format")?;

        let mut formatted = Vec::new();
        for dev in self.targets(&request.devices) {
            self.ext
                .run("wipefs", &["-a".to_string(), dev.clone()])
                .await?;
            formatted.push(dev.clone());
        }
        Ok(formatted)
    }

    async fn format_file(&self, request: &FormatRequest) -> Result<Vec<String>> {
        let size_gb = request.size_gb.unwrap_or(self.config.file_size_gb);
        if size_gb == 0 {
            return Err(Error::provider(self.name(), "file format requires a size"));
        }
        let size = size_gb as u64 * GIB;

        let mut formatted = Vec::new();
        for path in self.targets(&request.devices) {
            let exists = tokio::fs::metadata(path).await.is_ok();
            if exists && !request.force {
                return Err(Error::provider(
                    self.name(),
                    format!("{} already formatted", path),
                ));
            }

            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .await?;
            file.set_len(size).await?;
            formatted.push(path.clone());
        }
        Ok(formatted)
    }
}

#[async_trait]
impl StorageProvider for BdevProvider {
    async fn scan(&self) -> Result<Inventory> {
        let devices = match self.class {
            BdevClass::Nvme => self.scan_nvme()?,
            BdevClass::Kdev => self.scan_kdev()?,
            BdevClass::File => self.scan_file().await?,
            BdevClass::Malloc => self.scan_malloc(),
        };
        debug!("{} scan found {} devices", self.name(), devices.len());
        Ok(Inventory::new(self.storage_class(), devices))
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse> {
        match self.class {
            BdevClass::Nvme => self.prepare_nvme(request).await,
            // Nothing to bind for emulated classes
            BdevClass::Kdev | BdevClass::File => Ok(PrepareResponse {
                prepared: self.targets(&request.devices).to_vec(),
                reboot_required: false,
            }),
            BdevClass::Malloc => Ok(PrepareResponse {
                prepared: self.malloc_names(),
                reboot_required: false,
            }),
        }
    }

    async fn format(&self, request: &FormatRequest) -> Result<FormatResponse> {
        let formatted = match self.class {
            BdevClass::Nvme => self.format_nvme(request).await?,
            BdevClass::Kdev => self.format_kdev(request).await?,
            BdevClass::File => self.format_file(request).await?,
            BdevClass::Malloc => self.malloc_names(),
        };
        info!("{} formatted {} devices", self.name(), formatted.len());
        Ok(FormatResponse {
            formatted,
            mount_point: None,
        })
    }

    fn name(&self) -> String {
        self.storage_class().to_string()
    }
}

/// nvme0n1 belongs to nvme0; nvme0n1p1 (partition) and nvme10n1 do not
fn is_namespace_of(name: &str, controller: &str) -> bool {
    match name.strip_prefix(controller).and_then(|rest| rest.strip_prefix('n')) {
        Some(nsid) => !nsid.is_empty() && nsid.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Read a trimmed sysfs attribute
fn read_sysfs_attr(base_path: &Path, attr: &str) -> Result<String> {
    let path = base_path.join(attr);
    fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::provider("sysfs", format!("failed to read {}: {}", path.display(), e)))
}
