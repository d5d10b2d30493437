//! Bounded-concurrency batch loading with partial-failure tolerance.
//!
//! [`LoadBatchCoordinator::run_batch`] spawns one worker task per resource. Workers queue on a
//! semaphore sized to the concurrency limit, so at most `concurrency_limit` loads run at once.
//! Each worker owns its [`ResourceRequest`] until the load reaches a terminal state and then
//! hands it back to the coordinator, which is the only place that aggregates outcomes, writes
//! log entries and publishes progress.
//!
//! Invariants:
//! - A failing load never cancels its siblings; the batch finishes when every id is terminal.
//! - `succeeded` and `failed` partition the requested ids exactly.
//! - Every load is bounded by its deadline even if the loader ignores it.
//! - On cancellation every worker is aborted and awaited before `run_batch` returns, so no
//!   load keeps holding a permit.

use crate::clock::{Clock, SystemClock};
use crate::deadline::{deadline_after, with_deadline};
use crate::error::BatchError;
use crate::events::{EventBus, JoinEvent};
use crate::loader::{LoadResult, ResourceLoader};
use crate::logger::{append_bounded, LogEntry, LogSink, NullSink};
use crate::{ErrorKind, FailureCause};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Lifecycle of one resource within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Loading,
    Loaded,
    Failed(ErrorKind),
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Loaded | RequestState::Failed(_))
    }
}

/// One resource being loaded as part of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub id: String,
    pub state: RequestState,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl ResourceRequest {
    fn queued(id: String) -> Self {
        Self { id, state: RequestState::Queued, started_at: None, finished_at: None }
    }

    fn start(&mut self, at: SystemTime) {
        self.state = RequestState::Loading;
        self.started_at = Some(at);
    }

    fn finish(&mut self, at: SystemTime, outcome: LoadResult) {
        self.state = match outcome {
            Ok(()) => RequestState::Loaded,
            Err(kind) => RequestState::Failed(kind),
        };
        self.finished_at = Some(at);
    }

    /// Time spent loading, once both timestamps are known.
    pub fn elapsed(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        end.duration_since(start).ok()
    }
}

/// Aggregated, immutable outcome of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBatchResult {
    pub batch_id: Uuid,
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeMap<String, ErrorKind>,
    /// Final record of every request, keyed by id.
    pub requests: BTreeMap<String, ResourceRequest>,
}

impl LoadBatchResult {
    fn empty(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            succeeded: BTreeSet::new(),
            failed: BTreeMap::new(),
            requests: BTreeMap::new(),
        }
    }

    /// Partition terminal requests. A request that somehow never reached a terminal state
    /// counts as failed with `Unknown`.
    fn from_requests<I>(batch_id: Uuid, requests: I) -> Self
    where
        I: IntoIterator<Item = ResourceRequest>,
    {
        let mut result = Self::empty(batch_id);
        for request in requests {
            match request.state {
                RequestState::Loaded => {
                    result.succeeded.insert(request.id.clone());
                }
                RequestState::Failed(kind) => {
                    result.failed.insert(request.id.clone(), kind);
                }
                RequestState::Queued | RequestState::Loading => {
                    result.failed.insert(request.id.clone(), ErrorKind::Unknown);
                }
            }
            result.requests.insert(request.id.clone(), request);
        }
        result
    }

    /// Every id that was requested.
    pub fn requested(&self) -> BTreeSet<String> {
        self.succeeded.iter().chain(self.failed.keys()).cloned().collect()
    }

    /// Ids that failed to load.
    pub fn missing(&self) -> BTreeSet<String> {
        self.failed.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing failed (including the empty batch).
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when at least one resource was requested and none loaded.
    pub fn all_failed(&self) -> bool {
        !self.failed.is_empty() && self.succeeded.is_empty()
    }

    /// Aggregate kind of a failed batch; see [`ErrorKind::dominant`].
    pub fn dominant_failure(&self) -> Option<ErrorKind> {
        ErrorKind::dominant(self.failed.values().copied())
    }
}

/// Fans out resource loads through a [`ResourceLoader`].
#[derive(Clone)]
pub struct LoadBatchCoordinator<S = NullSink> {
    loader: Arc<dyn ResourceLoader>,
    sink: S,
    clock: Arc<dyn Clock>,
    events: Option<EventBus>,
}

impl<S> std::fmt::Debug for LoadBatchCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBatchCoordinator")
            .field("loader", &self.loader)
            .field("sink", &"<sink>")
            .field("clock", &self.clock)
            .finish()
    }
}

impl LoadBatchCoordinator<NullSink> {
    /// Coordinator that discards log entries.
    pub fn new(loader: Arc<dyn ResourceLoader>) -> Self {
        Self::with_sink(loader, NullSink)
    }
}

impl<S: LogSink> LoadBatchCoordinator<S> {
    pub fn with_sink(loader: Arc<dyn ResourceLoader>, sink: S) -> Self {
        Self { loader, sink, clock: Arc::new(SystemClock), events: None }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish `Loading` progress events on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Load every id, at most `concurrency_limit` at a time.
    ///
    /// Returns `Err(DuplicateId)` without loading anything if an id repeats, and
    /// `Err(Cancelled)` once `cancel` fires. A limit of zero is treated as one.
    pub async fn run_batch<I, T>(
        &self,
        lobby_id: &str,
        ids: I,
        per_item_timeout: Duration,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<LoadBatchResult, BatchError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let batch_id = Uuid::new_v4();
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let total = ids.len();
        let span = tracing::info_span!("load_batch", %batch_id, lobby = lobby_id, total);

        async move {
            if cancel.is_cancelled() {
                tracing::info!("batch cancelled before dispatch");
                return Err(BatchError::Cancelled);
            }
            if let Some(duplicate) = first_duplicate(&ids) {
                let entry = LogEntry::new(
                    self.clock.now(),
                    ErrorKind::Unknown,
                    FailureCause::InvalidBatch,
                    lobby_id,
                    format!("batch rejected: resource id {:?} requested more than once", duplicate),
                )
                .with_resource(duplicate.clone());
                append_bounded(self.sink.clone(), entry, cancel).await;
                tracing::warn!(resource = %duplicate, "duplicate resource id in batch");
                return Err(BatchError::DuplicateId { id: duplicate });
            }
            if ids.is_empty() {
                return Ok(LoadBatchResult::empty(batch_id));
            }
            let limit = concurrency_limit.max(1);
            self.dispatch(lobby_id, batch_id, ids, per_item_timeout, limit, cancel).await
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        lobby_id: &str,
        batch_id: Uuid,
        ids: Vec<String>,
        per_item_timeout: Duration,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<LoadBatchResult, BatchError> {
        let total = ids.len();
        let permits = Arc::new(Semaphore::new(concurrency_limit));
        let mut outstanding: HashSet<String> = ids.iter().cloned().collect();
        let mut finished = Vec::with_capacity(total);
        let mut workers = JoinSet::new();

        self.publish(JoinEvent::Loading { completed: 0, total });
        for id in ids {
            let request = ResourceRequest::queued(id);
            let worker = Worker {
                loader: self.loader.clone(),
                clock: self.clock.clone(),
                permits: permits.clone(),
                per_item_timeout,
            };
            workers.spawn(worker.run(request).in_current_span());
        }

        while !workers.is_empty() {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    tracing::info!(completed = finished.len(), total, "batch cancelled");
                    return Err(BatchError::Cancelled);
                }
                joined = workers.join_next() => joined,
            };
            let request = match joined {
                Some(Ok(request)) => request,
                Some(Err(err)) => {
                    tracing::error!(error = %err, "resource worker ended without a result");
                    continue;
                }
                None => break,
            };
            outstanding.remove(&request.id);
            if let RequestState::Failed(kind) = request.state {
                self.log_failure(lobby_id, &request, kind, cancel).await;
            } else {
                tracing::debug!(resource = %request.id, "resource loaded");
            }
            finished.push(request);
            self.publish(JoinEvent::Loading { completed: finished.len(), total });
        }

        // Workers that vanished without reporting are still accounted for.
        for id in outstanding {
            let mut request = ResourceRequest::queued(id);
            request.finish(self.clock.now(), Err(ErrorKind::Unknown));
            self.log_failure(lobby_id, &request, ErrorKind::Unknown, cancel).await;
            finished.push(request);
        }
        let result = LoadBatchResult::from_requests(batch_id, finished);
        tracing::debug!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "batch complete"
        );
        Ok(result)
    }

    async fn log_failure(
        &self,
        lobby_id: &str,
        request: &ResourceRequest,
        kind: ErrorKind,
        cancel: &CancellationToken,
    ) {
        tracing::warn!(resource = %request.id, %kind, "resource failed to load");
        let entry = LogEntry::new(
            request.finished_at.unwrap_or_else(|| self.clock.now()),
            kind,
            FailureCause::ResourceLoad,
            lobby_id,
            format!("resource {:?} failed to load: {}", request.id, kind),
        )
        .with_resource(request.id.clone());
        append_bounded(self.sink.clone(), entry, cancel).await;
    }

    fn publish(&self, event: JoinEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

fn first_duplicate(ids: &[String]) -> Option<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().find(|id| !seen.insert(id.as_str())).cloned()
}

struct Worker {
    loader: Arc<dyn ResourceLoader>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    per_item_timeout: Duration,
}

impl Worker {
    async fn run(self, mut request: ResourceRequest) -> ResourceRequest {
        let Ok(_permit) = self.permits.acquire_owned().await else {
            request.finish(self.clock.now(), Err(ErrorKind::Unknown));
            return request;
        };
        request.start(self.clock.now());
        let deadline = deadline_after(self.per_item_timeout);
        let load = AssertUnwindSafe(self.loader.load(&request.id, deadline)).catch_unwind();
        let outcome = match with_deadline(deadline, load).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_panic)) => {
                tracing::error!(resource = %request.id, "resource loader panicked");
                Err(ErrorKind::Unknown)
            }
            Err(_elapsed) => Err(ErrorKind::Timeout),
        };
        request.finish(self.clock.now(), outcome);
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::loader::InMemoryLoader;
    use crate::logger::MemorySink;

    const SECOND: Duration = Duration::from_secs(1);

    fn coordinator(loader: InMemoryLoader) -> (LoadBatchCoordinator<MemorySink>, MemorySink) {
        let sink = MemorySink::new();
        (LoadBatchCoordinator::with_sink(Arc::new(loader), sink.clone()), sink)
    }

    #[tokio::test]
    async fn empty_batch_succeeds_immediately() {
        let (coordinator, sink) = coordinator(InMemoryLoader::default());
        let result = coordinator
            .run_batch("L1", Vec::<String>::new(), SECOND, 4, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(result.all_succeeded());
        assert!(!result.all_failed());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn partial_failure_is_partitioned_and_logged() {
        let loader = InMemoryLoader::builder()
            .resource("map")
            .failing("texture", ErrorKind::NotFound)
            .build();
        let (coordinator, sink) = coordinator(loader);

        let result = coordinator
            .run_batch("L1", ["map", "texture"], SECOND, 2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded, BTreeSet::from(["map".to_string()]));
        assert_eq!(result.failed.get("texture"), Some(&ErrorKind::NotFound));
        assert_eq!(result.requests["texture"].state, RequestState::Failed(ErrorKind::NotFound));
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ErrorKind::NotFound);
        assert_eq!(entries[0].cause, FailureCause::ResourceLoad);
        assert_eq!(entries[0].resource_id.as_deref(), Some("texture"));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_and_logged_once() {
        let loader = InMemoryLoader::with_resources(["map"]);
        let (coordinator, sink) = coordinator(loader.clone());

        let err = coordinator
            .run_batch("L1", ["map", "map"], Duration::from_secs(1), 2, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, BatchError::DuplicateId { id: "map".into() });
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.entries()[0].kind, ErrorKind::Unknown);
        assert_eq!(sink.entries()[0].cause, FailureCause::InvalidBatch);
        assert_eq!(loader.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let ids: Vec<String> = (0..12).map(|i| format!("chunk-{i}")).collect();
        let loader = ids
            .iter()
            .fold(InMemoryLoader::builder().default_latency(Duration::from_millis(50)), |b, id| {
                b.resource(id.clone())
            })
            .build();
        let (coordinator, _sink) = coordinator(loader.clone());

        let result = coordinator
            .run_batch("L1", ids.clone(), Duration::from_secs(5), 3, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded.len(), 12);
        assert!(loader.max_in_flight() <= 3, "max in flight {}", loader.max_in_flight());
        assert_eq!(loader.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_loader_is_abandoned_at_deadline() {
        let loader = InMemoryLoader::builder().resource("map").hanging("shader-cache").build();
        let (coordinator, sink) = coordinator(loader.clone());

        let result = coordinator
            .run_batch(
                "L1",
                ["map", "shader-cache"],
                Duration::from_millis(250),
                1,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failed.get("shader-cache"), Some(&ErrorKind::Timeout));
        assert!(result.succeeded.contains("map"));
        assert_eq!(sink.entries_of(ErrorKind::Timeout).len(), 1);
        assert_eq!(loader.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_loads() {
        let loader = InMemoryLoader::builder()
            .slow_resource("map", Duration::from_secs(30))
            .slow_resource("texture", Duration::from_secs(30))
            .build();
        let (coordinator, sink) = coordinator(loader.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = coordinator
            .run_batch("L1", ["map", "texture"], Duration::from_secs(60), 2, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, BatchError::Cancelled);
        assert_eq!(loader.in_flight(), 0);
        assert!(sink.is_empty());
    }

    /// Panics the first time it is read, then behaves.
    #[derive(Debug, Default)]
    struct FlakyClock {
        reads: std::sync::atomic::AtomicUsize,
    }

    impl Clock for FlakyClock {
        fn now(&self) -> SystemTime {
            let read = self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            assert!(read > 0, "clock unavailable");
            SystemTime::UNIX_EPOCH
        }
    }

    #[tokio::test]
    async fn crashed_worker_is_failed_and_logged() {
        let (coordinator, sink) = coordinator(InMemoryLoader::with_resources(["map"]));
        let coordinator = coordinator.with_clock(Arc::new(FlakyClock::default()));

        let result = coordinator
            .run_batch("L1", ["map"], SECOND, 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.failed.get("map"), Some(&ErrorKind::Unknown));
        assert_eq!(result.requests["map"].state, RequestState::Failed(ErrorKind::Unknown));
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_id.as_deref(), Some("map"));
        assert_eq!(entries[0].cause, FailureCause::ResourceLoad);
    }

    #[tokio::test]
    async fn already_cancelled_batch_loads_nothing() {
        let loader = InMemoryLoader::with_resources(["map"]);
        let (coordinator, sink) = coordinator(loader.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        for ids in [vec![], vec!["map"], vec!["map", "map"]] {
            let err = coordinator.run_batch("L1", ids, SECOND, 1, &cancel).await.unwrap_err();
            assert_eq!(err, BatchError::Cancelled);
        }
        assert_eq!(loader.calls(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn records_timestamps_from_clock() {
        let clock = ManualClock::at_millis(5_000);
        let (coordinator, _sink) = coordinator(InMemoryLoader::with_resources(["map"]));
        let coordinator = coordinator.with_clock(Arc::new(clock));

        let result = coordinator
            .run_batch("L1", ["map"], Duration::from_secs(1), 1, &CancellationToken::new())
            .await
            .unwrap();

        let request = &result.requests["map"];
        assert_eq!(request.started_at, Some(SystemTime::UNIX_EPOCH + Duration::from_secs(5)));
        assert_eq!(request.elapsed(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn publishes_progress() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let (coordinator, _sink) = coordinator(InMemoryLoader::with_resources(["a", "b"]));
        let coordinator = coordinator.with_events(bus);

        coordinator
            .run_batch("L1", ["a", "b"], Duration::from_secs(1), 2, &CancellationToken::new())
            .await
            .unwrap();

        let mut progress = Vec::new();
        while let Ok(JoinEvent::Loading { completed, total }) = rx.try_recv() {
            progress.push((completed, total));
        }
        assert_eq!(progress, vec![(0, 2), (1, 2), (2, 2)]);
    }

    #[test]
    fn dominant_failure_uses_tie_break() {
        let result = LoadBatchResult::from_requests(
            Uuid::nil(),
            [("a", ErrorKind::Refused), ("b", ErrorKind::Timeout)].map(|(id, kind)| {
                let mut r = ResourceRequest::queued(id.to_string());
                r.finish(SystemTime::UNIX_EPOCH, Err(kind));
                r
            }),
        );
        assert!(result.all_failed());
        assert_eq!(result.dominant_failure(), Some(ErrorKind::Timeout));
        assert_eq!(result.missing().len(), 2);
    }
}
