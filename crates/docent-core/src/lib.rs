//! Configuration loading and construction of the docent components.

pub mod bootstrap;
pub mod config;
pub mod vault;

pub use bootstrap::AppBuilder;
pub use config::Config;
