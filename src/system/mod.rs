//! OS Extension Module
//!
//! Host operations used by storage providers: privilege checks, mounts,
//! filesystem creation and host tool execution.

pub mod linux;
pub mod mock;

pub use linux::*;
pub use mock::*;
