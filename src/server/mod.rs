//! Server Module
//!
//! Control-plane side of the engines on this host:
//! - Ctl Svc: fleet-wide storage scan, prepare and format
//! - Harness: the ordered set of supervised engine instances
//! - Instance: one engine's providers, runner and lifecycle

pub mod ctl_svc;
pub mod harness;
pub mod instance;

pub use ctl_svc::*;
pub use harness::*;
pub use instance::*;
