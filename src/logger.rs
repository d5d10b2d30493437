//! Failure records and the sinks that receive them.
//!
//! The controller and the coordinator append one [`LogEntry`] per failure to an injected
//! [`LogSink`]. A sink is a `tower::Service<LogEntry>`, so sinks compose with ordinary tower
//! combinators, and callers can bring any existing service as a log backend.
//!
//! Appends are fire-and-forget: [`append_best_effort`] honours `poll_ready`, and swallows
//! any error so a broken sink can never change the outcome of a Join. The core goes through
//! [`append_bounded`], which also caps how long a slow sink can hold up a Join at
//! [`APPEND_TIMEOUT`] and hands an unfinished append to a background task once the Join is
//! cancelled.
//!
//! # Sinks
//!
//! - [`NullSink`]: discards everything.
//! - [`TracingSink`]: forwards entries to `tracing` at `WARN`.
//! - [`MemorySink`]: bounded in-memory recorder, for tests and post-mortems.
//! - [`NonBlockingSink`]: hands entries to a worker task over a bounded channel.
//! - [`MulticastSink`]: tees every entry into two sinks.

use crate::clock::unix_millis;
use crate::{ErrorKind, FailureCause};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tower::Service;

/// Longest a single append may run before the entry is dropped.
pub const APPEND_TIMEOUT: Duration = Duration::from_millis(500);

/// One failure record. Write-only from the core's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub kind: ErrorKind,
    pub cause: FailureCause,
    /// Human-readable description of what failed.
    pub context: String,
    pub lobby_id: String,
    /// Connection attempt number, for connection failures.
    pub attempt: Option<u32>,
    /// Resource id, for per-resource failures.
    pub resource_id: Option<String>,
}

impl LogEntry {
    pub fn new(
        timestamp: SystemTime,
        kind: ErrorKind,
        cause: FailureCause,
        lobby_id: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            kind,
            cause,
            context: context.into(),
            lobby_id: lobby_id.into(),
            attempt: None,
            resource_id: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] lobby={} kind={} cause={}",
            unix_millis(self.timestamp),
            self.lobby_id,
            self.kind,
            self.cause
        )?;
        if let Some(attempt) = self.attempt {
            write!(f, " attempt={}", attempt)?;
        }
        if let Some(id) = &self.resource_id {
            write!(f, " resource={}", id)?;
        }
        write!(f, ": {}", self.context)
    }
}

/// A sink that consumes failure records.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use lobbyline::logger::{LogEntry, LogSink};
/// use tower::Service;
/// use std::task::{Context, Poll};
/// use std::pin::Pin;
/// use std::future::Future;
///
/// #[derive(Clone)]
/// struct StderrSink;
///
/// impl Service<LogEntry> for StderrSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, entry: LogEntry) -> Self::Future {
///         eprintln!("{}", entry);
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl LogSink for StderrSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait LogSink:
    Service<LogEntry, Response = (), Error = Self::SinkError, Future = SinkFuture<Self::SinkError>>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Boxed future type every sink in this module uses.
pub type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// Best-effort append that honors `poll_ready` and swallows errors.
pub async fn append_best_effort<S>(sink: S, entry: LogEntry)
where
    S: Service<LogEntry, Response = ()> + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    match sink.ready_oneshot().await {
        Ok(mut ready_sink) => {
            if let Err(err) = ready_sink.call(entry).await {
                tracing::debug!(error = %err, "log sink rejected entry");
            }
        }
        Err(err) => tracing::debug!(error = %err, "log sink not ready"),
    }
}

/// Append without letting the sink stall the caller.
///
/// The append runs inline for at most [`APPEND_TIMEOUT`]. If `cancel` fires first, the
/// remainder moves to a detached task and this returns immediately.
pub async fn append_bounded<S>(sink: S, entry: LogEntry, cancel: &CancellationToken)
where
    S: Service<LogEntry, Response = ()> + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    let append = tokio::time::timeout(APPEND_TIMEOUT, append_best_effort(sink, entry));
    let mut append = Box::pin(append);
    tokio::select! {
        biased;
        appended = &mut append => {
            if appended.is_err() {
                tracing::warn!(timeout = ?APPEND_TIMEOUT, "log sink too slow; entry dropped");
            }
        }
        _ = cancel.cancelled() => {
            tokio::spawn(async move {
                if append.await.is_err() {
                    tracing::warn!(timeout = ?APPEND_TIMEOUT, "log sink too slow; entry dropped");
                }
            });
        }
    }
}

/// A no-op sink that discards all entries.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LogEntry> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _entry: LogEntry) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl LogSink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs entries using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

impl Service<LogEntry> for TracingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: LogEntry) -> Self::Future {
        tracing::warn!(
            lobby = %entry.lobby_id,
            kind = %entry.kind,
            cause = %entry.cause,
            attempt = ?entry.attempt,
            resource = ?entry.resource_id,
            "{}",
            entry.context
        );
        Box::pin(async { Ok(()) })
    }
}

impl LogSink for TracingSink {
    type SinkError = Infallible;
}

/// A sink that stores entries in memory, evicting the oldest beyond `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.guard().iter().cloned().collect()
    }

    /// Entries of one kind, in append order.
    pub fn entries_of(&self, kind: ErrorKind) -> Vec<LogEntry> {
        self.guard().iter().filter(|e| e.kind == kind).cloned().collect()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LogEntry> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: LogEntry) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(entry);
        Box::pin(async { Ok(()) })
    }
}

impl LogSink for MemorySink {
    type SinkError = Infallible;
}

/// Offloads appends to a bounded channel and worker task. Drops entries when full.
///
/// Must be constructed inside a tokio runtime.
#[derive(Clone, Debug)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: Service<LogEntry, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let mut sink = sink;

        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(entry) = rx.recv().await {
                if let Ok(ready) = sink.ready().await {
                    if let Err(err) = ready.call(entry).await {
                        tracing::debug!(error = %err, "background log sink rejected entry");
                    }
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<LogEntry> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: LogEntry) -> Self::Future {
        if self.tx.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl LogSink for NonBlockingSink {
    type SinkError = Infallible;
}

#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Sends each entry to both sinks; the second still runs if the first fails.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<LogEntry> for MulticastSink<A, B>
where
    A: LogSink,
    A::SinkError: Sync,
    B: LogSink,
    B::SinkError: Sync,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: LogEntry) -> Self::Future {
        let sink_a = self.sink_a.clone();
        let sink_b = self.sink_b.clone();
        let entry_clone = entry.clone();

        Box::pin(async move {
            use tower::ServiceExt;
            let (res_a, res_b) =
                tokio::join!(sink_a.oneshot(entry), sink_b.oneshot(entry_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> LogSink for MulticastSink<A, B>
where
    A: LogSink,
    A::SinkError: Sync,
    B: LogSink,
    B::SinkError: Sync,
{
    type SinkError = ComposedSinkError;
}
