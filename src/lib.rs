//! storctl - Storage Control Plane Core
//!
//! Supervises the storage engine instances on one host and administers
//! their storage. Operations that need administrative privilege are
//! forwarded to a separate helper binary when the control process runs
//! unprivileged.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          storctl daemon                              │
//! │  ┌─────────────────────────┐        ┌─────────────────────────────┐  │
//! │  │ Storage Control Service │        │      IOServerHarness        │  │
//! │  │  scan / prepare / format│        │  instance 0 .. instance N   │  │
//! │  └────────────┬────────────┘        └──────┬───────────────┬──────┘  │
//! │               │                            │               │         │
//! │     ┌─────────┴─────────┐         ┌────────┴──────┐  ┌─────┴──────┐  │
//! │     │ ForwardingProvider│◄────────┤   providers   │  │   Runner   │  │
//! │     └─────────┬─────────┘         └───────────────┘  └─────┬──────┘  │
//! │               │ Forwarder                                  │         │
//! └───────────────┼────────────────────────────────────────────┼─────────┘
//!                 │ JSON lines over stdin/stdout               │ spawn
//!        ┌────────┴────────┐                          ┌────────┴────────┐
//!        │  storage_admin  │                          │ storage engine  │
//!        │  (privileged)   │                          │   subprocess    │
//!        └─────────────────┘                          └─────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`pbin`]: Privileged request forwarding and the helper-side server
//! - [`server`]: Storage control service, harness and instances
//! - [`storage`]: Bdev and scm providers
//! - [`ioserver`]: Engine process runners
//! - [`system`]: Host operations (mounts, mkfs, tools)
//! - [`config`]: Configuration file and validation
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod ioserver;
pub mod metrics;
pub mod pbin;
pub mod server;
pub mod storage;
pub mod system;

// Re-export commonly used types
pub use config::{
    BdevConfig, Configuration, EngineConfig, HelperConfig, ScmConfig, ServerConfig, StorageConfig,
};

pub use domain::ports::{
    BdevClass, DeviceInfo, ExitState, FormatRequest, FormatResponse, Inventory, PrepareRequest,
    PrepareResponse, Runner, RunnerRef, ScmClass, StorageClass, StorageProvider,
    StorageProviderRef, SystemExt, SystemExtRef,
};

pub use error::{Error, ForwardingCause, Result, Severity};

pub use pbin::{
    Forwarder, ForwardingPolicy, HelperDescriptor, HelperDispatcher, Method, PrivilegedRequest,
    PrivilegedResponse, RequestHandler,
};

pub use server::{
    FleetPrepareRequest, FleetResult, IOServerHarness, IOServerInstance, InstanceState,
    ServerOutcome, StorageControlService, Superblock,
};

pub use storage::{BdevProvider, ForwardingProvider, ProviderFactory, ProviderSpec, ScmProvider};

pub use ioserver::ProcessRunner;

pub use system::LinuxExt;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
