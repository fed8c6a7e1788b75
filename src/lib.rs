pub mod app;
pub mod cli;
pub mod clients;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod modules;
pub mod resilience;
pub mod supervisor;

pub use error::{BotError, Result};
