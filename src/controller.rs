//! The Join state machine.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Loading -> { Joined | PartiallyLoaded | Failed }
//!            |  ^                       |
//!            +--+ (retry)               +-> Failed
//!            +-> Failed
//! ```
//!
//! A [`ConnectionController`] runs exactly one Join: [`ConnectionController::join`] consumes
//! it, so attempt counts and history never leak into a later session. Connection attempts
//! are sequential and governed by the [`RetryPolicy`]; once connected, resources are handed
//! to the [`LoadBatchCoordinator`]. Every failure is classified before it leaves this module,
//! and the terminal outcome is published exactly once.
//!
//! Log entries:
//! - one per failed connection attempt (the final one included);
//! - one per failed resource (written by the coordinator);
//! - one aggregate entry when every resource failed;
//! - one entry on cancellation.
//!
//! ```rust
//! use lobbyline::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let controller = ConnectionController::builder(
//!     ScriptedConnector::always_accept(),
//!     InMemoryLoader::with_resources(["map", "texture"]),
//! )
//! .config(presets::testing())
//! .build();
//!
//! let outcome = controller.join("L1", ["map", "texture"]).await;
//! assert_eq!(outcome.status, JoinStatus::Joined);
//! assert_eq!(outcome.attempts, 1);
//! # }
//! ```

use crate::classifier::{ErrorClassifier, Signal, StandardClassifier};
use crate::clock::{Clock, SystemClock};
use crate::connector::LobbyConnector;
use crate::coordinator::{LoadBatchCoordinator, LoadBatchResult};
use crate::deadline::{deadline_after, with_deadline};
use crate::error::{BatchError, ConfigError};
use crate::events::{EventBus, JoinEvent};
use crate::loader::ResourceLoader;
use crate::logger::{append_bounded, LogEntry, LogSink, NullSink};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::{ErrorKind, FailureCause};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const DEFAULT_PER_ITEM_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONCURRENCY_LIMIT: usize = 4;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    Loading,
    Joined,
    PartiallyLoaded,
    Failed(ErrorKind),
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerState::Joined | ControllerState::PartiallyLoaded | ControllerState::Failed(_)
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Failed` is reachable from every non-terminal state because cancellation can land
    /// anywhere.
    pub fn can_transition_to(&self, next: &ControllerState) -> bool {
        use ControllerState::*;
        match (self, next) {
            (_, Failed(_)) => !self.is_terminal(),
            (Idle, Connecting { attempt }) => *attempt == 1,
            (Connecting { attempt: from }, Connecting { attempt: to }) => *to == from + 1,
            (Connecting { .. }, Connected) => true,
            (Connected, Loading) => true,
            (Loading, Joined | PartiallyLoaded) => true,
            _ => false,
        }
    }
}

/// Outcome of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed(ErrorKind),
}

/// Record of one connection attempt. Immutable once its outcome is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub lobby_id: String,
    pub attempt_number: u32,
    pub started_at: SystemTime,
    pub outcome: AttemptOutcome,
}

/// Terminal status of a Join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStatus {
    Joined,
    PartiallyLoaded { missing: BTreeSet<String> },
    Failed { kind: ErrorKind, cause: FailureCause },
}

impl JoinStatus {
    fn state(&self) -> ControllerState {
        match self {
            JoinStatus::Joined => ControllerState::Joined,
            JoinStatus::PartiallyLoaded { .. } => ControllerState::PartiallyLoaded,
            JoinStatus::Failed { kind, .. } => ControllerState::Failed(*kind),
        }
    }

    fn event(&self) -> JoinEvent {
        match self {
            JoinStatus::Joined => JoinEvent::Joined,
            JoinStatus::PartiallyLoaded { missing } => {
                JoinEvent::PartiallyLoaded { missing: missing.clone() }
            }
            JoinStatus::Failed { kind, cause } => JoinEvent::Failed { kind: *kind, cause: *cause },
        }
    }
}

/// Everything a caller needs to render the result of a Join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub lobby_id: String,
    /// Connection attempts made.
    pub attempts: u32,
    pub history: Vec<ConnectionAttempt>,
    /// Present once loading completed; absent when the Join failed before or during it.
    pub batch: Option<LoadBatchResult>,
    pub status: JoinStatus,
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        self.status == JoinStatus::Joined
    }

    /// Resources that failed to load, for a partially loaded Join.
    pub fn missing(&self) -> Option<&BTreeSet<String>> {
        match &self.status {
            JoinStatus::PartiallyLoaded { missing } => Some(missing),
            _ => None,
        }
    }

    /// Failure kind, when the Join failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            JoinStatus::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.status, JoinStatus::Failed { cause: FailureCause::Cancelled, .. })
    }
}

/// Validated settings for one Join.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinConfig {
    retry: RetryConfig,
    per_item_timeout: Duration,
    concurrency_limit: usize,
    connect_timeout: Duration,
}

impl JoinConfig {
    pub fn builder() -> JoinConfigBuilder {
        JoinConfigBuilder::default()
    }

    pub(crate) const fn from_parts(
        retry: RetryConfig,
        per_item_timeout: Duration,
        concurrency_limit: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self { retry, per_item_timeout, concurrency_limit, connect_timeout }
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn per_item_timeout(&self) -> Duration {
        self.per_item_timeout
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Time limit for a single connection attempt.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self::from_parts(
            RetryConfig::default(),
            Duration::from_secs(DEFAULT_PER_ITEM_TIMEOUT_SECS),
            DEFAULT_CONCURRENCY_LIMIT,
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }
}

/// Builder for [`JoinConfig`].
#[derive(Debug, Clone)]
pub struct JoinConfigBuilder {
    retry: RetryConfig,
    per_item_timeout: Duration,
    concurrency_limit: usize,
    connect_timeout: Duration,
}

impl Default for JoinConfigBuilder {
    fn default() -> Self {
        let defaults = JoinConfig::default();
        Self {
            retry: defaults.retry,
            per_item_timeout: defaults.per_item_timeout,
            concurrency_limit: defaults.concurrency_limit,
            connect_timeout: defaults.connect_timeout,
        }
    }
}

impl JoinConfigBuilder {
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = timeout;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<JoinConfig, ConfigError> {
        if self.per_item_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "per_item_timeout" });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "connect_timeout" });
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::InvalidConcurrencyLimit);
        }
        Ok(JoinConfig::from_parts(
            self.retry,
            self.per_item_timeout,
            self.concurrency_limit,
            self.connect_timeout,
        ))
    }
}

/// Cancels an in-flight Join. Cloneable; cancelling twice is a no-op.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Drives one Join from `Idle` to a terminal state.
pub struct ConnectionController<S = NullSink> {
    connector: Arc<dyn LobbyConnector>,
    coordinator: LoadBatchCoordinator<S>,
    sink: S,
    config: JoinConfig,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn ErrorClassifier>,
    events: EventBus,
    state: watch::Sender<ControllerState>,
    cancel: CancellationToken,
}

impl<S> std::fmt::Debug for ConnectionController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("connector", &self.connector)
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ConnectionController<NullSink> {
    pub fn builder<C, L>(connector: C, loader: L) -> ControllerBuilder<NullSink>
    where
        C: LobbyConnector + 'static,
        L: ResourceLoader + 'static,
    {
        ControllerBuilder {
            connector: Arc::new(connector),
            loader: Arc::new(loader),
            sink: NullSink,
            config: JoinConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            classifier: Arc::new(StandardClassifier),
            events: EventBus::default(),
        }
    }
}

impl<S: LogSink> ConnectionController<S> {
    /// Current state, for collaborators that poll.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change, including after `join` consumes the
    /// controller.
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Push notifications for this Join.
    pub fn subscribe(&self) -> broadcast::Receiver<JoinEvent> {
        self.events.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { token: self.cancel.clone() }
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Run the Join to completion. Always returns a terminal outcome.
    pub async fn join<I, T>(self, lobby_id: impl Into<String>, resources: I) -> JoinOutcome
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let lobby_id = lobby_id.into();
        let resources: Vec<String> = resources.into_iter().map(Into::into).collect();
        let span = tracing::info_span!("join", lobby = %lobby_id, resources = resources.len());
        self.run(Session::new(lobby_id), resources).instrument(span).await
    }

    async fn run(&self, mut session: Session, resources: Vec<String>) -> JoinOutcome {
        if let Err((kind, cause)) = self.connect(&mut session).await {
            return self.finish(session, None, JoinStatus::Failed { kind, cause });
        }
        // Cancelled while the final attempt was resolving.
        if self.cancel.is_cancelled() {
            let (kind, cause) = self.cancelled(&session).await;
            return self.finish(session, None, JoinStatus::Failed { kind, cause });
        }
        self.transition(ControllerState::Connected);
        self.events.publish(JoinEvent::Connected { attempts: session.attempts() });

        self.transition(ControllerState::Loading);
        let batch = self
            .coordinator
            .run_batch(
                &session.lobby_id,
                resources,
                self.config.per_item_timeout(),
                self.config.concurrency_limit(),
                &self.cancel,
            )
            .await;

        match batch {
            Ok(result) => self.settle(session, result).await,
            Err(BatchError::Cancelled) => {
                let (kind, cause) = self.cancelled(&session).await;
                self.finish(session, None, JoinStatus::Failed { kind, cause })
            }
            // Already logged by the coordinator.
            Err(err) => {
                let status = JoinStatus::Failed { kind: err.kind(), cause: err.cause() };
                self.finish(session, None, status)
            }
        }
    }

    /// Attempt the connection until it succeeds or the retry policy gives up.
    async fn connect(&self, session: &mut Session) -> Result<(), (ErrorKind, FailureCause)> {
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(session).await);
            }
            self.transition(ControllerState::Connecting { attempt });
            self.events.publish(JoinEvent::Connecting { attempt });

            session.begin(attempt, self.clock.now());
            let deadline = deadline_after(self.config.connect_timeout());
            let connect = with_deadline(deadline, self.connector.connect(&session.lobby_id));
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = connect => Some(result),
            };
            let signal = match result {
                None => {
                    session.resolve(AttemptOutcome::Failed(ErrorKind::Unknown));
                    return Err(self.cancelled(session).await);
                }
                Some(Ok(Ok(()))) => {
                    session.resolve(AttemptOutcome::Succeeded);
                    tracing::debug!(attempt, "connected");
                    return Ok(());
                }
                Some(Ok(Err(signal))) => signal,
                Some(Err(_elapsed)) => Signal::ConnectTimeout,
            };

            let kind = self.classifier.classify(&signal);
            session.resolve(AttemptOutcome::Failed(kind));
            let decision = self.policy.next_delay(attempt, kind);

            if !decision.retry {
                let cause = if kind.is_retryable() {
                    FailureCause::RetriesExhausted
                } else {
                    FailureCause::Transport
                };
                tracing::warn!(attempt, %kind, %cause, "connection failed");
                let context = format!("connection attempt {} failed: {}", attempt, signal);
                self.log(&session.lobby_id, kind, cause, Some(attempt), context).await;
                return Err((kind, cause));
            }

            tracing::warn!(
                attempt,
                %kind,
                delay = ?decision.delay,
                "connection attempt failed; retrying"
            );
            let context = format!(
                "connection attempt {} failed: {}; retrying in {:?}",
                attempt, signal, decision.delay
            );
            self.log(&session.lobby_id, kind, FailureCause::Transport, Some(attempt), context)
                .await;

            let waited = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                _ = self.sleeper.sleep(decision.delay) => true,
            };
            if !waited {
                return Err(self.cancelled(session).await);
            }
            attempt += 1;
        }
    }

    async fn settle(&self, session: Session, result: LoadBatchResult) -> JoinOutcome {
        let status = if result.all_succeeded() {
            JoinStatus::Joined
        } else if result.all_failed() {
            let kind = result.dominant_failure().unwrap_or(ErrorKind::Unknown);
            let context = format!(
                "all {} resources failed to load; dominant failure {}",
                result.failed.len(),
                kind
            );
            self.log(&session.lobby_id, kind, FailureCause::BatchFailed, None, context).await;
            JoinStatus::Failed { kind, cause: FailureCause::BatchFailed }
        } else {
            JoinStatus::PartiallyLoaded { missing: result.missing() }
        };
        self.finish(session, Some(result), status)
    }

    async fn cancelled(&self, session: &Session) -> (ErrorKind, FailureCause) {
        tracing::info!(attempts = session.attempts(), "join cancelled");
        let context = format!("join cancelled after {} connection attempt(s)", session.attempts());
        self.log(&session.lobby_id, ErrorKind::Unknown, FailureCause::Cancelled, None, context)
            .await;
        (ErrorKind::Unknown, FailureCause::Cancelled)
    }

    fn finish(
        &self,
        session: Session,
        batch: Option<LoadBatchResult>,
        status: JoinStatus,
    ) -> JoinOutcome {
        self.transition(status.state());
        self.events.publish(status.event());
        tracing::info!(status = ?status, attempts = session.attempts(), "join finished");
        JoinOutcome {
            attempts: session.attempts(),
            lobby_id: session.lobby_id,
            history: session.history,
            batch,
            status,
        }
    }

    async fn log(
        &self,
        lobby_id: &str,
        kind: ErrorKind,
        cause: FailureCause,
        attempt: Option<u32>,
        context: String,
    ) {
        let mut entry = LogEntry::new(self.clock.now(), kind, cause, lobby_id, context);
        if let Some(attempt) = attempt {
            entry = entry.with_attempt(attempt);
        }
        append_bounded(self.sink.clone(), entry, &self.cancel).await;
    }

    fn transition(&self, next: ControllerState) {
        self.state.send_modify(|current| {
            debug_assert!(
                current.can_transition_to(&next),
                "illegal transition {:?} -> {:?}",
                current,
                next
            );
            tracing::debug!(from = ?current, to = ?next, "state transition");
            *current = next;
        });
    }
}

/// Per-Join bookkeeping owned by the running controller.
struct Session {
    lobby_id: String,
    history: Vec<ConnectionAttempt>,
}

impl Session {
    fn new(lobby_id: String) -> Self {
        Self { lobby_id, history: Vec::new() }
    }

    fn attempts(&self) -> u32 {
        u32::try_from(self.history.len()).unwrap_or(u32::MAX)
    }

    /// Open a new attempt as `Pending`.
    fn begin(&mut self, attempt_number: u32, started_at: SystemTime) {
        self.history.push(ConnectionAttempt {
            lobby_id: self.lobby_id.clone(),
            attempt_number,
            started_at,
            outcome: AttemptOutcome::Pending,
        });
    }

    /// Set the outcome of the open attempt. Settled attempts are never touched again.
    fn resolve(&mut self, outcome: AttemptOutcome) {
        if let Some(attempt) = self.history.last_mut() {
            if attempt.outcome == AttemptOutcome::Pending {
                attempt.outcome = outcome;
            }
        }
    }
}

/// Builder for [`ConnectionController`].
pub struct ControllerBuilder<S = NullSink> {
    connector: Arc<dyn LobbyConnector>,
    loader: Arc<dyn ResourceLoader>,
    sink: S,
    config: JoinConfig,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn ErrorClassifier>,
    events: EventBus,
}

impl<S> ControllerBuilder<S> {
    pub fn config(mut self, config: JoinConfig) -> Self {
        self.config = config;
        self
    }

    /// Where failure records go. Defaults to [`NullSink`].
    pub fn log_sink<S2: LogSink>(self, sink: S2) -> ControllerBuilder<S2> {
        ControllerBuilder {
            connector: self.connector,
            loader: self.loader,
            sink,
            config: self.config,
            sleeper: self.sleeper,
            clock: self.clock,
            classifier: self.classifier,
            events: self.events,
        }
    }

    /// How retry delays are waited out. Defaults to [`TokioSleeper`].
    pub fn sleeper<T: Sleeper + 'static>(mut self, sleeper: T) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn clock<T: Clock + 'static>(mut self, clock: T) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn classifier<T: ErrorClassifier + 'static>(mut self, classifier: T) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Publish events on a shared bus instead of a private one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}

impl<S: LogSink> ControllerBuilder<S> {
    pub fn build(self) -> ConnectionController<S> {
        let coordinator = LoadBatchCoordinator::with_sink(self.loader, self.sink.clone())
            .with_clock(self.clock.clone())
            .with_events(self.events.clone());
        let (state, _) = watch::channel(ControllerState::Idle);
        ConnectionController {
            connector: self.connector,
            coordinator,
            sink: self.sink,
            policy: self.config.retry().policy(),
            config: self.config,
            sleeper: self.sleeper,
            clock: self.clock,
            classifier: self.classifier,
            events: self.events,
            state,
            cancel: CancellationToken::new(),
        }
    }
}
