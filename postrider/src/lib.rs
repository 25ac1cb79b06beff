//! Configuration loading and component wiring for the postrider binaries.

pub mod config;
pub mod control_handler;

pub use config::AppConfig;
pub use control_handler::Handler;
