//! Privileged Binary Module
//!
//! Lets the unprivileged control process run storage administration through
//! a separate, higher-privileged helper binary:
//! - Policy: decides once whether requests are forwarded
//! - Protocol: newline-delimited JSON request/response envelopes
//! - Forwarder: launches, reuses and discards the helper process
//! - Handler: executes requests locally and serves them inside the helper

pub mod policy;
pub mod protocol;
pub mod handler;
pub mod forwarder;

pub use policy::*;
pub use protocol::*;
pub use handler::*;
pub use forwarder::*;

use std::time::Duration;

/// Name of the privileged helper binary
pub const HELPER_NAME: &str = "storage_admin";

/// Presence of this variable disables forwarding to the helper
pub const DISABLE_REQ_FWD_ENV: &str = "STORCTL_DISABLE_REQ_FWD";

/// Upper bound on a single forwarded request
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
