mod support;

use std::time::Duration;

use pgkeeper::engine::scripted::ScriptedConnector;
use pgkeeper::{BackendError, Counter, DbError};

#[tokio::test]
async fn many_tasks_each_get_their_own_session() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector).with_auto_commit(true);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let factory = factory.clone();
        tasks.push(tokio::spawn(async move {
            factory
                .scope(move |session| {
                    Box::pin(async move {
                        session
                            .execute(&format!("insert into pages values ({i})"))
                            .await?;
                        Ok::<_, DbError>(())
                    })
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snap = factory.manager().metrics().snapshot();
    assert_eq!(snap.total_sessions, 10);
    assert_eq!(snap.successful_sessions, 10);
    assert_eq!(connector.count_statement("COMMIT"), 10);
    assert_eq!(connector.opens(), 1);
    assert_eq!(connector.connections_opened(), connector.connections_closed());
}

#[tokio::test(start_paused = true)]
async fn sessions_follow_the_engine_across_a_rebuild() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector);

    let guard = factory.acquire().await.unwrap();
    assert_eq!(guard.engine_generation(), 1);
    guard.complete().await.unwrap();

    connector.break_engine();

    let guard = factory.acquire().await.unwrap();
    assert_eq!(guard.engine_generation(), 2);
    guard.complete().await.unwrap();

    assert_eq!(connector.live_pools(), 1);
    assert_eq!(factory.manager().metrics().get(Counter::SuccessfulSessions), 2);
}

#[tokio::test]
async fn producer_form_failure_path() {
    let connector = ScriptedConnector::new();
    connector.fail_statement("update pages set title = null");
    let factory = support::scripted_factory(&connector);

    let mut guard = factory.acquire().await.unwrap();
    let err = guard
        .execute("update pages set title = null")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Backend(BackendError::Server { .. })));
    guard.fail(&err).await;

    let snap = factory.manager().metrics().snapshot();
    assert_eq!(snap.failed_sessions, 1);
    assert!(snap.last_failure.unwrap().contains("XX000"));
    assert_eq!(connector.count_statement("ROLLBACK"), 1);
    assert_eq!(connector.connections_opened(), connector.connections_closed());
}

#[tokio::test(start_paused = true)]
async fn cancelled_scope_is_released_and_counted() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector);

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        factory.scope(|session| {
            Box::pin(async move {
                session.execute("select * from pages").await?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, DbError>(())
            })
        }),
    )
    .await;
    assert!(outcome.is_err());

    support::settle().await;

    let snap = factory.manager().metrics().snapshot();
    assert_eq!(snap.cancelled_session_count, 1);
    assert_eq!(snap.failed_sessions, 0);
    assert_eq!(snap.successful_sessions, 0);
    assert_eq!(connector.count_statement("ROLLBACK"), 1);
    assert_eq!(connector.connections_opened(), connector.connections_closed());
}

#[tokio::test(start_paused = true)]
async fn cancelled_complete_still_closes_the_session() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector);

    let guard = factory.acquire().await.unwrap();
    connector.set_close_delay(Duration::from_millis(100));

    let outcome = tokio::time::timeout(Duration::from_millis(10), guard.complete()).await;
    assert!(outcome.is_err());
    assert!(connector.connections_closed() < connector.connections_opened());

    tokio::time::sleep(Duration::from_millis(200)).await;

    let snap = factory.manager().metrics().snapshot();
    assert_eq!(snap.successful_sessions, 1);
    assert_eq!(snap.cancelled_session_count, 0);
    assert_eq!(connector.connections_opened(), connector.connections_closed());
}

#[tokio::test(start_paused = true)]
async fn unawaited_fail_still_rolls_back_and_closes() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector);

    let mut guard = factory.acquire().await.unwrap();
    guard.execute("update pages set title = 'x'").await.unwrap();
    connector.set_close_delay(Duration::from_millis(100));

    drop(guard.fail(&"client went away"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snap = factory.manager().metrics().snapshot();
    assert_eq!(snap.failed_sessions, 1);
    assert_eq!(snap.cancelled_session_count, 0);
    assert_eq!(connector.count_statement("ROLLBACK"), 1);
    assert_eq!(connector.connections_opened(), connector.connections_closed());
}

#[tokio::test(start_paused = true)]
async fn acquisition_rebuilds_an_engine_lost_after_validation() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector);
    factory.manager().get_engine().await.unwrap();

    connector.break_engine_after_probes(1);

    let generation = factory
        .scope(|session| {
            Box::pin(async move {
                session.execute("select * from pages").await?;
                Ok::<_, DbError>(session.engine_generation())
            })
        })
        .await
        .unwrap();

    assert_eq!(generation, 2);
    assert_eq!(connector.opens(), 2);
    assert_eq!(connector.live_pools(), 1);

    let snap = factory.manager().metrics().snapshot();
    assert_eq!(snap.successful_sessions, 1);
    assert_eq!(snap.connection_test_failures, 1);
    assert_eq!(snap.failed_sessions, 0);
}

#[tokio::test]
async fn panicking_scope_still_releases_its_session() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector);

    let task = {
        let factory = factory.clone();
        tokio::spawn(async move {
            factory
                .scope(|session| {
                    Box::pin(async move {
                        session.execute("update pages set title = 'x'").await?;
                        if session.in_transaction() {
                            panic!("handler bug");
                        }
                        Ok::<_, DbError>(())
                    })
                })
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    support::settle().await;

    let snap = factory.manager().metrics().snapshot();
    assert_eq!(snap.failed_sessions, 1);
    assert_eq!(snap.cancelled_session_count, 0);
    assert!(snap.last_failure.unwrap().contains("handler bug"));
    assert_eq!(connector.count_statement("ROLLBACK"), 1);
    assert_eq!(connector.connections_opened(), connector.connections_closed());
}

#[tokio::test]
async fn reset_zeroes_every_counter() {
    let connector = ScriptedConnector::new();
    let factory = support::scripted_factory(&connector);

    factory.acquire().await.unwrap().complete().await.unwrap();
    let metrics = factory.manager().metrics();
    assert_eq!(metrics.get(Counter::TotalSessions), 1);

    metrics.reset();
    let snap = metrics.snapshot();
    assert!(snap.counters().all(|(_, value)| value == 0));
    assert!(snap.last_failure.is_none());
    assert!(snap.last_failure_time.is_none());
}
