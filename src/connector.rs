//! The lobby connection capability.
//!
//! A [`LobbyConnector`] performs one connection attempt and reports failure as a raw
//! [`Signal`]; the controller owns classification, retry and the per-attempt time limit.

use crate::Signal;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Performs a single connection attempt to a lobby.
#[async_trait]
pub trait LobbyConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self, lobby_id: &str) -> Result<(), Signal>;
}

#[async_trait]
impl<C: LobbyConnector + ?Sized> LobbyConnector for Arc<C> {
    async fn connect(&self, lobby_id: &str) -> Result<(), Signal> {
        (**self).connect(lobby_id).await
    }
}

/// One scripted connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Accept,
    Fail(Signal),
    /// Accept after the given latency.
    AcceptAfter(Duration),
    /// Never resolve.
    Hang,
}

/// Replays a fixed sequence of attempt outcomes; once the script runs out every further
/// attempt is accepted.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    steps: Arc<Mutex<VecDeque<Step>>>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = Step>,
    {
        Self { steps: Arc::new(Mutex::new(steps.into_iter().collect())), attempts: Arc::default() }
    }

    /// Connector that accepts every attempt.
    pub fn always_accept() -> Self {
        Self::default()
    }

    /// Fail `times` attempts with `signal`, then accept.
    pub fn failing_then_accept(signal: Signal, times: usize) -> Self {
        Self::new(std::iter::repeat(Step::Fail(signal)).take(times))
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LobbyConnector for ScriptedConnector {
    async fn connect(&self, lobby_id: &str) -> Result<(), Signal> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Step::Accept);
        tracing::trace!(lobby = lobby_id, attempt, step = ?step, "scripted connect");
        match step {
            Step::Accept => Ok(()),
            Step::Fail(signal) => Err(signal),
            Step::AcceptAfter(latency) => {
                tokio::time::sleep(latency).await;
                Ok(())
            }
            Step::Hang => futures::future::pending().await,
        }
    }
}
