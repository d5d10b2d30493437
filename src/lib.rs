#![forbid(unsafe_code)]

//! # lobbyline
//!
//! Resilient lobby join for async Rust: connect to a lobby through retry with backoff, load
//! its dependent resources concurrently with partial-failure tolerance, and report exactly
//! one terminal outcome.
//!
//! ## Features
//!
//! - **Closed failure taxonomy**: every failure is classified into one of five [`ErrorKind`]s
//! - **Retry policy** with capped exponential backoff and proportional jitter
//! - **Bounded batch loading** where one failing resource never cancels its siblings
//! - **Deadlines** enforced around every connect attempt and every resource load
//! - **Cancellation** of an in-flight Join at any point, with prompt slot release
//! - **Pluggable collaborators**: log sinks (`tower::Service`), loaders, connectors, clocks
//!
//! ## Quick Start
//!
//! ```rust
//! use lobbyline::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let log = MemorySink::new();
//!     let loader = InMemoryLoader::builder()
//!         .resource("map")
//!         .failing("texture", ErrorKind::NotFound)
//!         .build();
//!
//!     let controller = ConnectionController::builder(ScriptedConnector::always_accept(), loader)
//!         .config(presets::testing())
//!         .log_sink(log.clone())
//!         .build();
//!
//!     let outcome = controller.join("L1", ["map", "texture"]).await;
//!     assert_eq!(outcome.missing().map(|m| m.len()), Some(1));
//!     assert_eq!(log.entries_of(ErrorKind::NotFound).len(), 1);
//! }
//! ```

pub mod backoff;
pub mod classifier;
pub mod clock;
pub mod connector;
pub mod controller;
pub mod coordinator;
pub mod deadline;
pub mod error;
pub mod events;
pub mod jitter;
pub mod loader;
pub mod logger;
pub mod presets;
pub mod retry;
pub mod sleeper;

pub mod prelude;

// Re-exports
pub use backoff::Backoff;
pub use classifier::{classify, Classify, ErrorClassifier, Signal, StandardClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connector::{LobbyConnector, ScriptedConnector, Step};
pub use controller::{
    AttemptOutcome, CancelHandle, ConnectionAttempt, ConnectionController, ControllerBuilder,
    ControllerState, JoinConfig, JoinConfigBuilder, JoinOutcome, JoinStatus,
};
pub use coordinator::{LoadBatchCoordinator, LoadBatchResult, RequestState, ResourceRequest};
pub use deadline::{with_deadline, DeadlineExceeded};
pub use error::{BatchError, ConfigError, ErrorKind, FailureCause};
pub use events::{EventBus, JoinEvent};
pub use jitter::Jitter;
pub use loader::{FsLoader, InMemoryLoader, InMemoryLoaderBuilder, LoadResult, ResourceLoader};
pub use logger::{
    LogEntry, LogSink, MemorySink, MulticastSink, NonBlockingSink, NullSink, TracingSink,
};
pub use retry::{RetryConfig, RetryConfigBuilder, RetryDecision, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
