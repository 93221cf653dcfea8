//! Linux OS Extension
//!
//! Implements host operations with the standard Linux tools and procfs.

use crate::domain::ports::SystemExt;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Host operations backed by the running Linux system
#[derive(Debug, Clone)]
pub struct LinuxExt {
    sysfs_root: PathBuf,
}

impl Default for LinuxExt {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl LinuxExt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an alternative sysfs tree (for testing)
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    async fn exec(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("Running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::provider(program, format!("failed to run: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provider(
                program,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl SystemExt for LinuxExt {
    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn sysfs_root(&self) -> PathBuf {
        self.sysfs_root.clone()
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        let mounts = tokio::fs::read_to_string(PROC_MOUNTS).await?;
        Ok(mount_table_contains(&mounts, target))
    }

    async fn mount(&self, source: &str, target: &Path, fstype: &str, options: &str) -> Result<()> {
        tokio::fs::create_dir_all(target).await?;
        let mut args = vec!["-t".to_string(), fstype.to_string()];
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.to_string());
        }
        args.push(source.to_string());
        args.push(target.display().to_string());
        self.exec("mount", &args).await.map(|_| ())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.exec("umount", &[target.display().to_string()])
            .await
            .map(|_| ())
    }

    async fn mkfs(&self, device: &str, fstype: &str, force: bool) -> Result<()> {
        let mut args = Vec::new();
        if force {
            args.push("-F".to_string());
        }
        args.push(device.to_string());
        self.exec(&format!("mkfs.{}", fstype), &args).await.map(|_| ())
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        self.exec(program, args).await
    }
}

/// Check a `/proc/mounts` style table for a mount target
fn mount_table_contains(table: &str, target: &Path) -> bool {
    let wanted = target.to_string_lossy();
    let wanted = wanted.trim_end_matches('/');
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        // procfs escapes spaces in paths as \040
        .any(|mnt| mnt.replace("\\040", " ").trim_end_matches('/') == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_table_contains() {
        let table = "tmpfs /mnt/storctl tmpfs rw,relatime,size=4194304k 0 0\n\
                     /dev/pmem0 /mnt/pmem\\0400 ext4 rw,dax 0 0\n";
        assert!(mount_table_contains(table, Path::new("/mnt/storctl")));
        assert!(mount_table_contains(table, Path::new("/mnt/storctl/")));
        assert!(mount_table_contains(table, Path::new("/mnt/pmem 0")));
        assert!(!mount_table_contains(table, Path::new("/mnt")));
    }

    #[test]
    fn test_sysfs_override() {
        let ext = LinuxExt::new().with_sysfs_root("/tmp/fake-sys");
        assert_eq!(ext.sysfs_root(), PathBuf::from("/tmp/fake-sys"));
    }
}
