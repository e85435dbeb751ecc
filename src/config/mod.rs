pub mod cli;
pub mod database;
pub mod types;

pub use cli::CliConfig;
pub use database::{ConfigError, DatabaseConfig};
pub use types::LogLevel;
