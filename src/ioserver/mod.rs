//! I/O Engine Runners
//!
//! - Runner: the engine subprocess
//! - Mock: scripted test double

pub mod runner;
pub mod mock;

pub use runner::*;
pub use mock::*;
