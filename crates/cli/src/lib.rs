//! Command-line driver for the transaction framework.
//!
//! Provides commands for:
//! - Running the demonstration transaction on the deterministic simulator
//! - Running it with one tokio task per node
//!
//! Both print the outcome and the summed linker statistics.

pub mod commands;
pub mod config;
pub mod demo;
pub mod runtime;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
