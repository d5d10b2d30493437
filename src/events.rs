//! State-change notifications for the UI/notification collaborator.
//!
//! The controller publishes a [`JoinEvent`] at every transition. Delivery is push via a
//! broadcast [`EventBus`]; collaborators that prefer polling read
//! [`ConnectionController::state`](crate::ConnectionController::state) instead.

use crate::{ErrorKind, FailureCause};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted as a Join progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinEvent {
    /// A connection attempt is starting.
    Connecting { attempt: u32 },
    /// The lobby accepted the connection.
    Connected { attempts: u32 },
    /// Resource loading progress; emitted once with `completed = 0` and after every
    /// resource that reaches a terminal state.
    Loading { completed: usize, total: usize },
    /// Every resource loaded.
    Joined,
    /// Some resources failed; the Join can proceed degraded.
    PartiallyLoaded { missing: BTreeSet<String> },
    /// The Join failed.
    Failed { kind: ErrorKind, cause: FailureCause },
}

impl JoinEvent {
    /// Whether this event ends the Join.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JoinEvent::Joined | JoinEvent::PartiallyLoaded { .. } | JoinEvent::Failed { .. }
        )
    }
}

impl fmt::Display for JoinEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinEvent::Connecting { attempt } => write!(f, "Connecting(#{})", attempt),
            JoinEvent::Connected { attempts } => write!(f, "Connected(after {})", attempts),
            JoinEvent::Loading { completed, total } => {
                write!(f, "Loading({}/{})", completed, total)
            }
            JoinEvent::Joined => write!(f, "Joined"),
            JoinEvent::PartiallyLoaded { missing } => {
                write!(f, "PartiallyLoaded(missing={})", missing.len())
            }
            JoinEvent::Failed { kind, cause } => write!(f, "Failed({}, {})", kind, cause),
        }
    }
}

/// Broadcast channel of [`JoinEvent`]s with a count of events nobody was listening for.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<JoinEvent>,
    unheard: Arc<AtomicU64>,
}

impl EventBus {
    /// Bus retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, unheard: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JoinEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published while no subscriber existed.
    pub fn unheard_count(&self) -> u64 {
        self.unheard.load(Ordering::Relaxed)
    }

    pub fn publish(&self, event: JoinEvent) {
        tracing::trace!(event = %event, "join_event");
        if self.sender.send(event).is_err() {
            self.unheard.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(JoinEvent::Connecting { attempt: 1 });
        bus.publish(JoinEvent::Joined);

        assert_eq!(rx.recv().await.unwrap(), JoinEvent::Connecting { attempt: 1 });
        assert_eq!(rx.recv().await.unwrap(), JoinEvent::Joined);
        assert_eq!(bus.unheard_count(), 0);
    }

    #[test]
    fn counts_events_without_listeners() {
        let bus = EventBus::new(8);
        bus.publish(JoinEvent::Joined);
        assert_eq!(bus.receiver_count(), 0);
        assert_eq!(bus.unheard_count(), 1);
    }

    #[test]
    fn terminal_events() {
        assert!(JoinEvent::Joined.is_terminal());
        assert!(JoinEvent::PartiallyLoaded { missing: BTreeSet::new() }.is_terminal());
        assert!(JoinEvent::Failed { kind: ErrorKind::Unknown, cause: FailureCause::Cancelled }
            .is_terminal());
        assert!(!JoinEvent::Loading { completed: 0, total: 2 }.is_terminal());
        assert!(!JoinEvent::Connecting { attempt: 2 }.is_terminal());
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(JoinEvent::Loading { completed: 1, total: 3 }.to_string(), "Loading(1/3)");
        assert_eq!(
            JoinEvent::Failed { kind: ErrorKind::NotFound, cause: FailureCause::Transport }
                .to_string(),
            "Failed(not_found, transport)"
        );
    }
}
