//! JSON-lines log sink for `lobbyline`. Writes one [`LogEntry`] per line.
//! Always appends; bring your own path.

use lobbyline::clock::unix_millis;
use lobbyline::logger::{LogEntry, LogSink, SinkFuture};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    // Clones share the lock so concurrent appends never interleave within a line.
    write_lock: Arc<Mutex<()>>,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: Arc::new(path.into()), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<LogEntry> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = SinkFuture<io::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: LogEntry) -> Self::Future {
        let path = self.path.clone();
        let lock = self.write_lock.clone();
        let line = entry_to_json(&entry).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let _guard = lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_path())
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(path = %path.display(), "appended log entry");
            Ok(())
        })
    }
}

impl LogSink for JsonlSink {
    type SinkError = io::Error;
}

/// Stable JSON shape of a [`LogEntry`].
pub fn entry_to_json(entry: &LogEntry) -> serde_json::Value {
    json!({
        "timestamp_ms": unix_millis(entry.timestamp),
        "kind": entry.kind.as_str(),
        "cause": entry.cause.as_str(),
        "lobby_id": entry.lobby_id,
        "attempt": entry.attempt,
        "resource_id": entry.resource_id,
        "context": entry.context,
    })
}
