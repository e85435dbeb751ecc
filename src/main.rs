use std::{process::ExitCode, sync::Arc, time::Duration};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use pgkeeper::{
    CliConfig, ConfigError, ConnectionManager, DatabaseConfig, LogLevel, PgConnector,
    QueryOutput, SessionFactory,
};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "pgkeeper";

type Manager = Arc<ConnectionManager<PgConnector>>;

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliConfig::from_args();

    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{APP_NAME}: {e}");
            return ExitCode::from(2);
        }
    };

    init_tracing(cli.log_level, config.echo);

    let manager: Manager = Arc::new(ConnectionManager::new(config, PgConnector::new()));

    let healthy = match cli.watch {
        Some(interval) => watch(&manager, interval).await,
        None => probe_once(&manager, cli.query.as_deref()).await,
    };

    manager.dispose().await;

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

async fn load_config(cli: &CliConfig) -> Result<DatabaseConfig, ConfigError> {
    // Fallback warnings are emitted before the real subscriber exists.
    let bootstrap = fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .finish();
    let _guard = tracing::subscriber::set_default(bootstrap);

    cli.database_config().await
}

fn init_tracing(level: LogLevel, echo: bool) {
    let filter = EnvFilter::try_new(level.directive(echo)).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn probe_once(manager: &Manager, query: Option<&str>) -> bool {
    info!("{APP_NAME} checking {}", manager.config().url_redacted());

    if let Err(e) = manager.get_engine().await {
        error!("{e}");
        print_report(manager, false);
        return false;
    }

    let mut healthy = true;
    if let Some(sql) = query {
        let sql = sql.to_string();
        let factory = SessionFactory::new(manager.clone()).with_auto_commit(true);

        let outcome = factory
            .scope(move |session| Box::pin(async move { session.execute(&sql).await }))
            .await;

        match outcome {
            Ok(output) => print_rows(&output),
            Err(e) => {
                error!("query failed: {e}");
                healthy = false;
            }
        }
    }

    let healthy = healthy && manager.health_check().await;
    print_report(manager, healthy);
    healthy
}

async fn watch(manager: &Manager, interval: Duration) -> bool {
    info!(
        "{APP_NAME} watching {} every {}",
        manager.config().url_redacted(),
        humantime::format_duration(interval)
    );

    let mut ticker = tokio::time::interval(interval);
    let mut healthy = false;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("{APP_NAME} shutting down");
                break;
            }

            _ = ticker.tick() => {
                healthy = match manager.get_engine().await {
                    Ok(_) => manager.health_check().await,
                    Err(e) => {
                        warn!("{e}");
                        false
                    }
                };
                info!(healthy, generation = ?manager.generation(), "health check");
            }
        }
    }

    print_report(manager, healthy);
    healthy
}

// -----------------------------------------------------------------------------
// ----- Output ----------------------------------------------------------------

fn print_rows(output: &QueryOutput) {
    if !output.columns.is_empty() {
        println!("{}", output.columns.join("\t"));
    }
    for row in &output.rows {
        let cells: Vec<&str> = row.iter().map(|v| v.as_deref().unwrap_or("NULL")).collect();
        println!("{}", cells.join("\t"));
    }
    if let Some(tag) = &output.command_tag {
        println!("({tag})");
    }
}

fn print_report(manager: &Manager, healthy: bool) {
    println!("healthy={healthy}");
    if let Some(version) = manager.server_version() {
        println!("server_version={version}");
    }
    println!("{}", manager.metrics().snapshot());
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
