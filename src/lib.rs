//! Supervisor core for appkeep.
//!
//! `ProcessManager` is the whole surface a front end needs: edit configs,
//! start and stop applications, adopt processes started elsewhere, and read
//! or subscribe to their output. Configs persist in a JSON file; instances
//! live only in memory.

pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod output;
pub mod process;
pub mod registry;
pub mod runner;
pub mod scan;

pub use error::{Result, SupervisorError};
pub use runner::ProcessManager;
