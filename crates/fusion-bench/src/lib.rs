//! Fusion command-line driver
//!
//! Runs test-time adaptive merging over a model pool described by a TOML
//! file.
//!
//! ## Usage
//!
//! ```bash
//! # AdaMerging with the settings in run.toml
//! fusion-bench --config run.toml
//!
//! # Gated merging, verbose
//! fusion-bench --config run.toml --method dawe --log-level debug
//! ```

pub mod config;
pub mod error;
pub mod pool;
pub mod runner;

pub use config::{BenchConfig, Method, PoolConfig};
pub use error::{BenchError, Result};
pub use pool::DirectoryModelPool;
pub use runner::{build_registry, run, RunSummary};
