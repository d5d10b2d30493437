//! Convenient re-exports for common lobbyline types.
pub use crate::{
    classifier::{classify, Signal},
    connector::{LobbyConnector, ScriptedConnector, Step},
    controller::{CancelHandle, ConnectionController, JoinConfig, JoinOutcome, JoinStatus},
    coordinator::{LoadBatchCoordinator, LoadBatchResult},
    error::{ErrorKind, FailureCause},
    events::{EventBus, JoinEvent},
    loader::{FsLoader, InMemoryLoader, ResourceLoader},
    logger::{LogEntry, LogSink, MemorySink, NullSink, TracingSink},
    presets,
    retry::{RetryConfig, RetryPolicy},
    sleeper::{InstantSleeper, TokioSleeper},
};
