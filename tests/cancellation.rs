use async_trait::async_trait;
use lobbyline::logger::{SinkFuture, APPEND_TIMEOUT};
use lobbyline::prelude::*;
use lobbyline::{AttemptOutcome, ControllerState, Step};
use std::convert::Infallible;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::Service;

/// Accepts entries and never finishes writing them.
#[derive(Clone, Debug)]
struct StuckSink;

impl Service<LogEntry> for StuckSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _entry: LogEntry) -> Self::Future {
        Box::pin(std::future::pending::<Result<(), Infallible>>())
    }
}

impl LogSink for StuckSink {
    type SinkError = Infallible;
}

/// Cancels the Join from inside the connection attempt, then accepts.
#[derive(Debug, Clone, Default)]
struct CancelOnConnect {
    handle: Arc<OnceLock<CancelHandle>>,
}

#[async_trait]
impl LobbyConnector for CancelOnConnect {
    async fn connect(&self, _lobby_id: &str) -> Result<(), Signal> {
        if let Some(handle) = self.handle.get() {
            handle.cancel();
        }
        Ok(())
    }
}

#[tokio::test]
async fn cancel_before_join_makes_no_attempt() {
    let log = MemorySink::new();
    let connector = ScriptedConnector::always_accept();
    let loader = InMemoryLoader::with_resources(["map"]);
    let controller = ConnectionController::builder(connector.clone(), loader.clone())
        .log_sink(log.clone())
        .build();
    controller.cancel_handle().cancel();

    let outcome = controller.join("L1", ["map"]).await;

    assert!(outcome.was_cancelled());
    assert_eq!(outcome.attempts, 0);
    assert_eq!(connector.attempts(), 0);
    assert_eq!(loader.calls(), 0);
    assert_eq!(log.len(), 1);
    assert_eq!(log.entries()[0].cause, FailureCause::Cancelled);
    assert_eq!(log.entries()[0].kind, ErrorKind::Unknown);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_hanging_connect() {
    let connector = ScriptedConnector::new([Step::Hang]);
    let config = JoinConfig::builder().connect_timeout(Duration::from_secs(300)).build().unwrap();
    let controller = ConnectionController::builder(connector, InMemoryLoader::default())
        .config(config)
        .build();
    let cancel = controller.cancel_handle();
    let state = controller.watch_state();

    let start = Instant::now();
    let join = tokio::spawn(controller.join("L1", ["map"]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*state.borrow(), ControllerState::Connecting { attempt: 1 });
    cancel.cancel();
    let outcome = join.await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(300));
    assert!(outcome.was_cancelled());
    assert_eq!(outcome.attempts, 1);
    assert_eq!(*state.borrow(), ControllerState::Failed(ErrorKind::Unknown));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_loading_releases_every_slot() {
    let log = MemorySink::new();
    let loader = InMemoryLoader::builder()
        .resource("map")
        .hanging("texture")
        .hanging("audio")
        .hanging("shaders")
        .build();
    let config = JoinConfig::builder()
        .per_item_timeout(Duration::from_secs(600))
        .concurrency_limit(2)
        .build()
        .unwrap();
    let connector = ScriptedConnector::always_accept();
    let controller = ConnectionController::builder(connector, loader.clone())
        .config(config)
        .log_sink(log.clone())
        .build();
    let cancel = controller.cancel_handle();
    let mut events = controller.subscribe();

    let join = tokio::spawn(controller.join("L1", ["map", "texture", "audio", "shaders"]));
    // Wait until loading is under way.
    loop {
        if let Ok(JoinEvent::Loading { .. }) = events.recv().await {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(loader.in_flight() > 0);
    cancel.cancel();
    let outcome = join.await.unwrap();

    assert!(outcome.was_cancelled());
    assert!(outcome.batch.is_none());
    assert_eq!(loader.in_flight(), 0);
    assert!(loader.max_in_flight() <= 2);
    assert_eq!(log.entries_of(ErrorKind::Unknown).len(), 1);
}

#[tokio::test]
async fn cancel_handle_is_idempotent() {
    let controller =
        ConnectionController::builder(ScriptedConnector::always_accept(), InMemoryLoader::default())
            .build();
    let handle = controller.cancel_handle();
    let clone = handle.clone();

    assert!(!handle.is_cancelled());
    handle.cancel();
    clone.cancel();
    assert!(handle.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn coordinator_frees_permits_for_later_batches_after_cancel() {
    let loader = InMemoryLoader::builder().hanging("a").hanging("b").resource("c").build();
    let coordinator = LoadBatchCoordinator::new(std::sync::Arc::new(loader.clone()));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let first = coordinator.run_batch("L1", ["a", "b"], Duration::from_secs(60), 2, &cancel).await;
    assert!(first.is_err());
    assert_eq!(loader.in_flight(), 0);

    let second = coordinator
        .run_batch("L1", ["c"], Duration::from_secs(1), 2, &CancellationToken::new())
        .await
        .unwrap();
    assert!(second.all_succeeded());
}

#[tokio::test]
async fn cancel_as_connect_succeeds_fails_every_batch_shape() {
    for resources in [vec![], vec!["map"], vec!["map", "map"]] {
        let log = MemorySink::new();
        let connector = CancelOnConnect::default();
        let loader = InMemoryLoader::with_resources(["map"]);
        let controller = ConnectionController::builder(connector.clone(), loader.clone())
            .log_sink(log.clone())
            .build();
        connector.handle.set(controller.cancel_handle()).unwrap();
        let state = controller.watch_state();

        let outcome = controller.join("L1", resources.clone()).await;

        assert_eq!(
            outcome.status,
            JoinStatus::Failed { kind: ErrorKind::Unknown, cause: FailureCause::Cancelled },
            "resources {resources:?}"
        );
        assert_eq!(outcome.history[0].outcome, AttemptOutcome::Succeeded);
        assert!(outcome.batch.is_none());
        assert_eq!(loader.calls(), 0);
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].cause, FailureCause::Cancelled);
        assert_eq!(*state.borrow(), ControllerState::Failed(ErrorKind::Unknown));
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_is_prompt_even_with_a_stuck_log_sink() {
    let loader = InMemoryLoader::builder().resource("map").hanging("texture").build();
    let config = JoinConfig::builder().per_item_timeout(Duration::from_secs(600)).build().unwrap();
    let controller = ConnectionController::builder(ScriptedConnector::always_accept(), loader)
        .config(config)
        .log_sink(StuckSink)
        .build();
    let cancel = controller.cancel_handle();

    let join = tokio::spawn(controller.join("L1", ["map", "texture"]));
    tokio::time::sleep(Duration::from_secs(1)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(3600), join)
        .await
        .expect("join should finish after cancel")
        .unwrap();

    assert!(cancelled_at.elapsed() < APPEND_TIMEOUT);
    assert!(outcome.was_cancelled());
}
