//! gattlink command-line client
//!
//! Thin front end over `gattlink-core` running on the btleplug platform.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::CliConfig;
pub use error::{CliError, Result};
