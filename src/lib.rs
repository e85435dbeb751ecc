pub mod backoff;
pub mod config;
pub mod engine;
pub mod errors;
pub mod manager;
pub mod metrics;
pub mod postgres;
pub mod session;

pub use backoff::Backoff;
pub use config::{CliConfig, ConfigError, DatabaseConfig, LogLevel};
pub use engine::{Connection, Connector, Pool, QueryOutput};
pub use errors::{BackendError, CleanupError, DbError};
pub use manager::{ConnectionManager, EngineHandle, ManagerCell};
pub use metrics::{Counter, Metrics, MetricsSnapshot};
pub use postgres::PgConnector;
pub use session::{Session, SessionExit, SessionFactory, SessionGuard};
