mod support;

use std::process::Command;

fn pgkeeper() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pgkeeper"));
    cmd.env_remove("PGKEEPER_CONFIG_FILE")
        .env_remove("PGKEEPER_ENV_PREFIX")
        .env_remove("DATABASE_URL")
        .env("DB_MAX_RETRIES", "1");
    cmd
}

#[test]
fn unreachable_database_exits_non_zero() {
    let port = support::reserve_port("127.0.0.1");
    let output = pgkeeper()
        .args([
            "--database-url",
            &format!("postgres://probe@127.0.0.1:{port}/wiki"),
            "--log",
            "error",
        ])
        .output()
        .expect("run pgkeeper");

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("healthy=false"));
    assert!(stdout.contains("last_failure="));
}

#[test]
fn bad_config_file_exits_with_usage_error() {
    let output = pgkeeper()
        .args(["--config", "/nonexistent/pgkeeper.toml"])
        .output()
        .expect("run pgkeeper");

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("/nonexistent/pgkeeper.toml"));
}

#[test]
fn live_database_is_reported_healthy() {
    let Some(url) = support::live_database_url() else {
        return;
    };

    let output = pgkeeper()
        .args(["--database-url", url.as_str(), "--query", "select 41 + 1"])
        .output()
        .expect("run pgkeeper");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("42"));
    assert!(stdout.contains("healthy=true"));
    assert!(stdout.contains("total_sessions=1"));
}
