mod common;

use common::{eventually, test_config, Counters, ScriptedEngine, TestServer, WAIT};
use std::sync::Arc;
use vosk_stream_server::{AppError, LifecycleManager};

#[actix_web::test]
async fn listener_is_restarted_after_bind_failure() {
    // Occupy a port so the first bind fails.
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let (engine, counters) = ScriptedEngine::new();
    let mut config = test_config();
    config.server.port = port;

    let manager = LifecycleManager::new(Arc::new(engine), config);
    let handle = manager.handle();
    let state = manager.state();
    let task = actix_web::rt::spawn(manager.run());

    let restarts = state.clone();
    eventually("first restart", || restarts.get_metrics_snapshot().restarts >= 1).await;
    drop(blocker);

    let addr = tokio::time::timeout(WAIT, handle.bound_addr())
        .await
        .expect("server did not rebind in time")
        .expect("lifecycle manager stopped before binding");
    assert_eq!(addr.port(), port);

    // Each cycle reloads the model.
    let loads = Counters::get(&counters.model_loads);
    assert!(loads >= 2, "expected a reload per cycle, got {}", loads);
    assert_eq!(loads as u64, state.get_metrics_snapshot().restarts + 1);

    handle.shutdown();
    let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(result, Ok(()));
}

#[actix_web::test]
async fn unusable_model_is_fatal_and_never_retried() {
    let (mut engine, counters) = ScriptedEngine::new();
    engine.fail_model_load = true;

    let manager = LifecycleManager::new(Arc::new(engine), test_config());
    let state = manager.state();

    let result = tokio::time::timeout(WAIT, manager.run()).await.unwrap();
    assert!(matches!(result, Err(AppError::Config(_))));
    assert_eq!(Counters::get(&counters.model_loads), 1);
    assert_eq!(state.get_metrics_snapshot().restarts, 0);
}

#[actix_web::test]
async fn shutdown_with_idle_server_is_graceful() {
    let (engine, counters) = ScriptedEngine::new();
    let server = TestServer::start(engine, test_config()).await;
    let handle = server.handle.clone();

    assert_eq!(server.stop().await, Ok(()));
    assert_eq!(Counters::get(&counters.model_loads), 1);

    // A stopped manager no longer advertises an address.
    assert_eq!(
        tokio::time::timeout(WAIT, handle.bound_addr()).await.unwrap(),
        None
    );
}

#[actix_web::test]
async fn shutdown_releases_in_flight_sessions() {
    let (engine, counters) = ScriptedEngine::new();
    let server = TestServer::start(engine, test_config()).await;
    let state = server.state.clone();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = server.connect().await;
        client.send_audio(b"abcd").await;
        client.next_json().await;
        clients.push(client);
    }
    assert_eq!(Counters::get(&counters.created), 3);

    assert_eq!(server.stop().await, Ok(()));

    eventually("every recognizer released", || {
        Counters::get(&counters.released) == Counters::get(&counters.created)
    })
    .await;
    eventually("no active sessions", || state.get_metrics_snapshot().active_sessions == 0).await;
    drop(clients);
}

#[actix_web::test]
async fn shutdown_requested_during_backoff_stops_promptly() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let (engine, _counters) = ScriptedEngine::new();
    let mut config = test_config();
    config.server.port = port;
    config.server.restart_backoff_ms = 60_000;

    let manager = LifecycleManager::new(Arc::new(engine), config);
    let handle = manager.handle();
    let state = manager.state();
    let task = actix_web::rt::spawn(manager.run());

    let restarts = state.clone();
    eventually("first restart", || restarts.get_metrics_snapshot().restarts == 1).await;
    handle.shutdown();

    let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(result, Ok(()));
    drop(blocker);
}
