//! Storage Provider Module
//!
//! Provides the storage capability implementations:
//! - Bdev: NVMe, kernel device, file and malloc block devices
//! - Scm: tmpfs and persistent memory
//! - Forwarded: any of the above reached through the privileged helper
//! - Mock: in-memory test double

pub mod bdev;
pub mod scm;
pub mod forwarded;
pub mod mock;

pub use bdev::*;
pub use scm::*;
pub use forwarded::*;
pub use mock::*;

use crate::config::BdevConfig;
use crate::domain::ports::{StorageProviderRef, SystemExtRef};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Serializable description of a provider, rebuilt on either side of the
/// privilege boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderSpec {
    Bdev(BdevConfig),
    Scm,
}

impl ProviderSpec {
    pub fn is_bdev(&self) -> bool {
        matches!(self, ProviderSpec::Bdev(_))
    }
}

/// Factory for creating storage providers
pub struct ProviderFactory;

impl ProviderFactory {
    /// Build the local provider a spec describes
    pub fn create(spec: &ProviderSpec, ext: SystemExtRef) -> Result<StorageProviderRef> {
        match spec {
            ProviderSpec::Bdev(config) => Ok(Arc::new(BdevProvider::new(config.clone(), ext)?)),
            ProviderSpec::Scm => Ok(Arc::new(ScmProvider::new(ext))),
        }
    }
}
