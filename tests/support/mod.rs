use std::{env, net::TcpListener, sync::Arc, time::Duration};
use tokio_postgres::NoTls;

use pgkeeper::engine::scripted::ScriptedConnector;
use pgkeeper::{ConnectionManager, DatabaseConfig, SessionFactory};

#[allow(dead_code)]
pub const LIVE_DATABASE_ENV: &str = "PGKEEPER_TEST_DATABASE_URL";

// Defaults with round-number delays so paused-clock tests can assert them.
#[allow(dead_code)]
pub fn scripted_config() -> DatabaseConfig {
    DatabaseConfig {
        max_retries: 3,
        retry_delay: Duration::from_secs(1),
        session_max_retries: 3,
        session_retry_delay: Duration::from_secs(1),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn scripted_manager(connector: &ScriptedConnector) -> Arc<ConnectionManager<ScriptedConnector>> {
    Arc::new(ConnectionManager::new(scripted_config(), connector.clone()))
}

#[allow(dead_code)]
pub fn scripted_factory(connector: &ScriptedConnector) -> SessionFactory<ScriptedConnector> {
    SessionFactory::new(scripted_manager(connector))
}

// Let tasks spawned by dropped guards run to completion.
#[allow(dead_code)]
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[allow(dead_code)]
pub fn reserve_port(host: &str) -> u16 {
    let addr = format!("{host}:0");
    let listener = TcpListener::bind(&addr).expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

// Live tests return early (and pass) unless the variable is set.
#[allow(dead_code)]
pub fn live_database_url() -> Option<String> {
    match env::var(LIVE_DATABASE_ENV) {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("{LIVE_DATABASE_ENV} not set; skipping live database test");
            None
        }
    }
}

// Reference answer from an independent client.
#[allow(dead_code)]
pub async fn reference_query(url: &str, sql: &str) -> Result<String, String> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| format!("reference connect failed: {e}"))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("reference connection error: {e}");
        }
    });

    let row = client
        .query_one(sql, &[])
        .await
        .map_err(|e| format!("reference query failed: {e}"))?;

    row.try_get(0)
        .map_err(|e| format!("reference bad result: {e}"))
}
