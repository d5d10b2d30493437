//! The resource-loading capability and two reference implementations.
//!
//! A [`ResourceLoader`] loads one opaque resource id before a deadline. It must give up and
//! return `Err(ErrorKind::Timeout)` once the deadline passes; it must never surface an
//! unclassified failure. The coordinator is polymorphic over this one trait and never
//! inspects what a resource actually is.
//!
//! - [`InMemoryLoader`]: scripted per-id latency and outcome, for tests and demos.
//! - [`FsLoader`]: reads `<root>/<id>` from disk, with an optional byte budget.

use crate::classifier::Classify;
use crate::deadline::with_deadline;
use crate::ErrorKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

/// Outcome of a single load: `Ok(())` is Loaded.
pub type LoadResult = Result<(), ErrorKind>;

/// Loads one resource by id. May be invoked concurrently.
#[async_trait]
pub trait ResourceLoader: Send + Sync + std::fmt::Debug {
    async fn load(&self, id: &str, deadline: Instant) -> LoadResult;
}

#[async_trait]
impl<L: ResourceLoader + ?Sized> ResourceLoader for Arc<L> {
    async fn load(&self, id: &str, deadline: Instant) -> LoadResult {
        (**self).load(id, deadline).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Script {
    Complete { latency: Duration, outcome: LoadResult },
    /// Never completes and ignores its deadline.
    Hang,
}

/// Scripted in-memory loader.
///
/// Unknown ids fail with `NotFound`. Latency is simulated with `tokio::time`, so tests can
/// run it under a paused clock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    scripts: Arc<HashMap<String, Script>>,
    stats: Arc<LoaderStats>,
}

#[derive(Debug, Default)]
struct LoaderStats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryLoader {
    pub fn builder() -> InMemoryLoaderBuilder {
        InMemoryLoaderBuilder::default()
    }

    /// Loader where every listed id loads instantly.
    pub fn with_resources<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter().fold(Self::builder(), |b, id| b.resource(id)).build()
    }

    /// Total `load` calls so far.
    pub fn calls(&self) -> usize {
        self.stats.calls.load(Ordering::SeqCst)
    }

    /// Loads currently executing.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous loads observed.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight gauge even when the load future is dropped mid-flight.
struct InFlightGuard<'a>(&'a LoaderStats);

impl<'a> InFlightGuard<'a> {
    fn enter(stats: &'a LoaderStats) -> Self {
        let current = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(current, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceLoader for InMemoryLoader {
    async fn load(&self, id: &str, deadline: Instant) -> LoadResult {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard::enter(&self.stats);

        match self.scripts.get(id).copied() {
            None => Err(ErrorKind::NotFound),
            Some(Script::Hang) => futures::future::pending().await,
            Some(Script::Complete { latency, outcome }) => {
                let ready_at = Instant::now() + latency;
                if ready_at > deadline {
                    tokio::time::sleep_until(deadline).await;
                    return Err(ErrorKind::Timeout);
                }
                tokio::time::sleep_until(ready_at).await;
                outcome
            }
        }
    }
}

/// Builder for [`InMemoryLoader`].
#[derive(Debug, Default)]
pub struct InMemoryLoaderBuilder {
    scripts: HashMap<String, Script>,
    default_latency: Duration,
}

impl InMemoryLoaderBuilder {
    /// Latency applied to ids added after this call without an explicit latency.
    pub fn default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn resource(mut self, id: impl Into<String>) -> Self {
        let latency = self.default_latency;
        self.scripts.insert(id.into(), Script::Complete { latency, outcome: Ok(()) });
        self
    }

    pub fn slow_resource(mut self, id: impl Into<String>, latency: Duration) -> Self {
        self.scripts.insert(id.into(), Script::Complete { latency, outcome: Ok(()) });
        self
    }

    pub fn failing(mut self, id: impl Into<String>, kind: ErrorKind) -> Self {
        let latency = self.default_latency;
        self.scripts.insert(id.into(), Script::Complete { latency, outcome: Err(kind) });
        self
    }

    /// An id whose load never finishes and ignores its deadline.
    pub fn hanging(mut self, id: impl Into<String>) -> Self {
        self.scripts.insert(id.into(), Script::Hang);
        self
    }

    pub fn build(self) -> InMemoryLoader {
        InMemoryLoader { scripts: Arc::new(self.scripts), stats: Arc::default() }
    }
}

/// Loads resources from files under a root directory.
///
/// Ids are relative paths; ids that are empty, absolute or contain `..` are rejected as
/// `NotFound` without touching the filesystem. With a byte budget, a load that would push
/// the total past the budget fails with `ResourceExhausted` before any of the file is read:
/// the file's size is reserved up front and never more than that is read.
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
    budget: Option<u64>,
    loaded_bytes: Arc<AtomicU64>,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), budget: None, loaded_bytes: Arc::new(AtomicU64::new(0)) }
    }

    /// Cap the total bytes this loader (and its clones) may load.
    pub fn with_byte_budget(mut self, bytes: u64) -> Self {
        self.budget = Some(bytes);
        self
    }

    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_bytes.load(Ordering::SeqCst)
    }

    fn resolve(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        if id.is_empty() {
            return None;
        }
        let safe = relative.components().all(|c| matches!(c, Component::Normal(_)));
        safe.then(|| self.root.join(relative))
    }

    fn reserve(&self, len: u64) -> Result<Reservation<'_>, ErrorKind> {
        match self.budget {
            None => {
                self.loaded_bytes.fetch_add(len, Ordering::SeqCst);
            }
            Some(budget) => {
                self.loaded_bytes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                        used.checked_add(len).filter(|total| *total <= budget)
                    })
                    .map_err(|_| ErrorKind::ResourceExhausted)?;
            }
        }
        Ok(Reservation { loaded_bytes: &*self.loaded_bytes, reserved: len, used: 0 })
    }
}

/// Bytes held against the budget for one load. Whatever was not used is handed back on
/// drop, including when the load is abandoned mid-read.
struct Reservation<'a> {
    loaded_bytes: &'a AtomicU64,
    reserved: u64,
    used: u64,
}

impl Reservation<'_> {
    fn commit(mut self, used: u64) {
        self.used = used.min(self.reserved);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.loaded_bytes.fetch_sub(self.reserved - self.used, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceLoader for FsLoader {
    async fn load(&self, id: &str, deadline: Instant) -> LoadResult {
        let Some(path) = self.resolve(id) else {
            tracing::debug!(resource = id, "rejected resource id outside loader root");
            return Err(ErrorKind::NotFound);
        };
        let open = async {
            let file = tokio::fs::File::open(&path).await?;
            let len = file.metadata().await?.len();
            Ok::<_, std::io::Error>((file, len))
        };
        let (file, len) = match with_deadline(deadline, open).await {
            Err(_) => return Err(ErrorKind::Timeout),
            Ok(Err(err)) => return Err(err.classify()),
            Ok(Ok(opened)) => opened,
        };
        let reservation = self.reserve(len)?;
        let mut bytes = Vec::new();
        match with_deadline(deadline, file.take(len).read_to_end(&mut bytes)).await {
            Err(_) => Err(ErrorKind::Timeout),
            Ok(Err(err)) => Err(err.classify()),
            Ok(Ok(read)) => {
                reservation.commit(read as u64);
                Ok(())
            }
        }
    }
}
