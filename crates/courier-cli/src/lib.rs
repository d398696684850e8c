//! Courier CLI library
//!
//! Terminal front end for the Courier sync engine: configuration layering,
//! the line-based interactive mode and plain-text rendering of engine output.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod input;
pub mod render;

pub use app::CourierApp;
pub use cli::{Cli, Commands};
pub use config::{CliAppConfig, ConfigError, ConfigOverrides};
pub use error::{CliError, Result};
