//! Mock OS Extension
//!
//! Records host operations instead of performing them.

use crate::domain::ports::SystemExt;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Recorded host operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysCall {
    Mount {
        source: String,
        target: PathBuf,
        fstype: String,
    },
    Unmount(PathBuf),
    Mkfs {
        device: String,
        fstype: String,
    },
    Run {
        program: String,
        args: Vec<String>,
    },
}

/// Host double with a configurable privilege level
#[derive(Debug)]
pub struct MockExt {
    privileged: bool,
    sysfs_root: PathBuf,
    mounted: Mutex<BTreeSet<PathBuf>>,
    calls: Mutex<Vec<SysCall>>,
    outputs: Mutex<HashMap<String, String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MockExt {
    pub fn new(privileged: bool) -> Self {
        Self {
            privileged,
            sysfs_root: PathBuf::from("/nonexistent/sys"),
            mounted: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            outputs: Mutex::new(HashMap::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Mark a target as already mounted
    pub fn set_mounted(&self, target: impl Into<PathBuf>) {
        self.mounted.lock().insert(target.into());
    }

    /// Canned stdout for `run(program, ..)`
    pub fn set_output(&self, program: &str, stdout: &str) {
        self.outputs.lock().insert(program.to_string(), stdout.to_string());
    }

    /// Make every operation involving `name` (program, fstype or mount) fail
    pub fn fail_on(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<SysCall> {
        self.calls.lock().clone()
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.failing.lock().contains(name) {
            return Err(Error::provider(name, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SystemExt for MockExt {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn sysfs_root(&self) -> PathBuf {
        self.sysfs_root.clone()
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounted.lock().contains(target))
    }

    async fn mount(&self, source: &str, target: &Path, fstype: &str, _options: &str) -> Result<()> {
        self.check("mount")?;
        self.calls.lock().push(SysCall::Mount {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
        });
        self.mounted.lock().insert(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.check("umount")?;
        self.calls.lock().push(SysCall::Unmount(target.to_path_buf()));
        self.mounted.lock().remove(target);
        Ok(())
    }

    async fn mkfs(&self, device: &str, fstype: &str, _force: bool) -> Result<()> {
        self.check("mkfs")?;
        self.calls.lock().push(SysCall::Mkfs {
            device: device.to_string(),
            fstype: fstype.to_string(),
        });
        Ok(())
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        self.check(program)?;
        self.calls.lock().push(SysCall::Run {
            program: program.to_string(),
            args: args.to_vec(),
        });
        Ok(self.outputs.lock().get(program).cloned().unwrap_or_default())
    }
}
