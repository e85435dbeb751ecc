use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use std::{ffi::OsString, path::PathBuf, time::Duration};

use super::{ConfigError, DatabaseConfig, types::LogLevel};

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub config_file_location: Option<PathBuf>,
    pub env_prefix: String,
    pub database_url: Option<SecretString>,
    pub log_level: LogLevel,
    pub query: Option<String>,
    pub watch: Option<Duration>,
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Static -----------------------------------------------------

impl CliConfig {
    pub fn from_args() -> Self {
        Self::from(Args::parse())
    }

    pub fn try_from_iter<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Args::try_parse_from(iter).map(Self::from)
    }
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Public -----------------------------------------------------

impl CliConfig {
    /// TOML file when `--config` is given, the environment otherwise.
    /// `--database-url` overrides the target either way.
    pub async fn database_config(&self) -> Result<DatabaseConfig, ConfigError> {
        let config = match &self.config_file_location {
            Some(path) => DatabaseConfig::from_file(path).await?,
            None => DatabaseConfig::from_env(&self.env_prefix),
        };

        match &self.database_url {
            Some(url) => config.with_url(url.expose_secret()),
            None => Ok(config),
        }
    }
}

impl From<Args> for CliConfig {
    fn from(args: Args) -> Self {
        Self {
            config_file_location: args.config_file,
            env_prefix: args.env_prefix,
            database_url: args
                .database_url
                .map(|url| SecretString::new(url.into_boxed_str())),
            log_level: args.log_level,
            query: args.query,
            watch: args.watch,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "pgkeeper",
    version,
    about = "Postgres connection manager readiness probe"
)]
struct Args {
    // Optional TOML file; without it the environment is read.
    #[arg(long = "config", short = 'c', env = "PGKEEPER_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    // Prefix tried before the plain variable names (e.g. WIKI_ → WIKI_DB_POOL_SIZE).
    #[arg(long = "env-prefix", env = "PGKEEPER_ENV_PREFIX", default_value = "")]
    env_prefix: String,

    // Overrides whatever target the config source provides.
    #[arg(long = "database-url")]
    database_url: Option<String>,

    #[arg(long = "log", default_value = "info")]
    log_level: LogLevel,

    // Statement to run inside a managed session.
    #[arg(long = "query", short = 'q')]
    query: Option<String>,

    // Keep probing on this interval (e.g. 5s, 1m) until Ctrl-C.
    #[arg(long = "watch", short = 'w', value_parser = humantime::parse_duration)]
    watch: Option<Duration>,
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
