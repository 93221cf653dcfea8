//! Storage-Class Memory Provider
//!
//! Manages the scm tier of every engine on the host: tmpfs emulation (ram
//! class) or persistent memory namespaces formatted ext4 and mounted with
//! DAX (dcpm class). One provider is shared by all engines; per-engine
//! details arrive in each request.

use crate::domain::ports::{
    DeviceInfo, FormatRequest, FormatResponse, Inventory, PrepareRequest, PrepareResponse,
    ScmClass, StorageClass, StorageProvider, SystemExtRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use tracing::{debug, info};

/// Persistent memory module management tool
pub const IPMCTL: &str = "ipmctl";

/// Persistent memory namespace management tool
pub const NDCTL: &str = "ndctl";

const DCPM_FSTYPE: &str = "ext4";
const DCPM_MOUNT_OPTS: &str = "dax";

/// Shared scm provider
pub struct ScmProvider {
    ext: SystemExtRef,
}

impl ScmProvider {
    pub fn new(ext: SystemExtRef) -> Self {
        Self { ext }
    }

    fn require_privilege(&self, operation: &str) -> Result<()> {
        if !self.ext.is_privileged() {
            return Err(Error::privilege(format!("scm {}", operation)));
        }
        Ok(())
    }

    /// Class from the request hint, else dcpm when devices are named
    fn class_for(hint: Option<StorageClass>, devices: &[String]) -> ScmClass {
        match hint {
            Some(StorageClass::Scm(class)) => class,
            _ if devices.is_empty() => ScmClass::Ram,
            _ => ScmClass::Dcpm,
        }
    }

    /// pmem block devices from sysfs
    fn pmem_devices(&self) -> Result<Vec<DeviceInfo>> {
        let block_path = self.ext.sysfs_root().join("class/block");
        if !block_path.exists() {
            return Ok(Vec::new());
        }

        let mut devices = Vec::new();
        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_pmem_namespace(&name) {
                continue;
            }
            let sectors = fs::read_to_string(entry.path().join("size"))
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0);
            devices.push(DeviceInfo {
                model: "pmem".to_string(),
                capacity_bytes: sectors * 512,
                ..DeviceInfo::bare(format!("/dev/{}", name))
            });
        }
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    async fn prepare_dcpm(&self, request: &PrepareRequest) -> Result<PrepareResponse> {
        self.require_privilege("prepare")?;

        if request.reset {
            self.ext
                .run(NDCTL, &args(&["destroy-namespace", "all", "--force"]))
                .await?;
            self.ext
                .run(IPMCTL, &args(&["create", "-f", "-goal", "MemoryMode=100"]))
                .await?;
            info!("Reset persistent memory goal, reboot required");
            return Ok(PrepareResponse {
                prepared: Vec::new(),
                reboot_required: true,
            });
        }

        let existing = self.pmem_devices()?;
        if !existing.is_empty() {
            debug!("{} pmem namespaces already present", existing.len());
            return Ok(PrepareResponse {
                prepared: existing.into_iter().map(|d| d.path).collect(),
                reboot_required: false,
            });
        }

        // Regions exist only after a reboot into AppDirect mode
        let regions = self.ext.run(NDCTL, &args(&["list", "--regions"])).await?;
        if regions.trim().is_empty() || regions.trim() == "[]" {
            self.ext
                .run(
                    IPMCTL,
                    &args(&["create", "-f", "-goal", "PersistentMemoryType=AppDirect"]),
                )
                .await?;
            info!("Set AppDirect goal, reboot required");
            return Ok(PrepareResponse {
                prepared: Vec::new(),
                reboot_required: true,
            });
        }

        self.ext
            .run(NDCTL, &args(&["create-namespace", "--mode", "fsdax", "--continue"]))
            .await?;
        let created = self.pmem_devices()?;
        Ok(PrepareResponse {
            prepared: created.into_iter().map(|d| d.path).collect(),
            reboot_required: false,
        })
    }
}

#[async_trait]
impl StorageProvider for ScmProvider {
    async fn scan(&self) -> Result<Inventory> {
        let devices = self.pmem_devices()?;
        Ok(Inventory::new(StorageClass::Scm(ScmClass::Dcpm), devices))
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse> {
        match Self::class_for(request.class, &request.devices) {
            ScmClass::Ram => Ok(PrepareResponse::default()),
            ScmClass::Dcpm => self.prepare_dcpm(request).await,
        }
    }

    async fn format(&self, request: &FormatRequest) -> Result<FormatResponse> {
        self.require_privilege("format")?;

        let mount_point = request
            .mount_point
            .clone()
            .ok_or_else(|| Error::provider(self.name(), "format requires a mount point"))?;

        if self.ext.is_mounted(&mount_point).await? {
            if !request.force {
                return Err(Error::provider(
                    self.name(),
                    format!("{} already mounted", mount_point.display()),
                ));
            }
            self.ext.unmount(&mount_point).await?;
        }

        let formatted = match Self::class_for(request.class, &request.devices) {
            ScmClass::Ram => {
                let size_gb = request.size_gb.filter(|s| *s > 0).ok_or_else(|| {
                    Error::provider(self.name(), "ram format requires a size")
                })?;
                self.ext
                    .mount("tmpfs", &mount_point, "tmpfs", &format!("size={}g", size_gb))
                    .await?;
                vec!["tmpfs".to_string()]
            }
            ScmClass::Dcpm => {
                let device = match request.devices.as_slice() {
                    [device] => device.clone(),
                    _ => {
                        return Err(Error::provider(
                            self.name(),
                            "dcpm format requires exactly one device",
                        ))
                    }
                };
                self.ext.mkfs(&device, DCPM_FSTYPE, true).await?;
                self.ext
                    .mount(&device, &mount_point, DCPM_FSTYPE, DCPM_MOUNT_OPTS)
                    .await?;
                vec![device]
            }
        };

        info!("Formatted scm at {}", mount_point.display());
        Ok(FormatResponse {
            formatted,
            mount_point: Some(mount_point),
        })
    }

    fn name(&self) -> String {
        "scm".to_string()
    }
}

/// pmem0, pmem1.1 are namespaces; pmem0p1 is a partition
fn is_pmem_namespace(name: &str) -> bool {
    match name.strip_prefix("pmem") {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.'),
        None => false,
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
