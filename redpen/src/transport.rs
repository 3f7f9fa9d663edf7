//! Push stream from the watch registry to one browser connection.
//!
//! Each connection is a spawned task that owns one watch [`Subscription`] and
//! forwards two kinds of [`PushMessage`] into an unbounded channel:
//! - **`file-changed`**: one per settled change under the watched root.
//! - **`keepalive`**: on a fixed interval, independent of file traffic, so the
//!   client can tell a quiet connection from a dead one.
//!
//! The task stops when the receiving side is dropped (client disconnect), a
//! send fails, the subscription's event channel ends, or the server begins
//! shutting down. Every path falls through to the same teardown, which
//! unsubscribes exactly once and then drops the sender so the response body
//! ends.

use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use redpen_core::{ChangeKind, WatchError, WatchRegistry};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// A message pushed to the client. Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PushMessage {
    FileChanged {
        event: ChangeKind,
        path: String,
        timestamp: i64,
    },
    Keepalive {
        timestamp: i64,
    },
}

impl PushMessage {
    pub fn keepalive() -> Self {
        PushMessage::Keepalive { timestamp: now_millis() }
    }

    /// SSE event name the browser listens for.
    pub fn event_name(&self) -> &'static str {
        match self {
            PushMessage::FileChanged { .. } => "file-changed",
            PushMessage::Keepalive { .. } => "keepalive",
        }
    }

    pub fn to_sse(&self) -> Event {
        let event = Event::default().event(self.event_name());
        match event.json_data(self) {
            Ok(event) => event,
            Err(err) => {
                // Only reachable if serialization itself fails.
                warn!(%err, "failed to encode push message");
                Event::default().event(self.event_name()).data("{}")
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Subscribes to `root` and spawns the connection task feeding `tx`.
///
/// The first keepalive goes out one full `keepalive` period after the
/// connection opens. The task ends once `shutdown` reads `true` or its sender
/// is dropped.
///
/// # Errors
///
/// Returns [`WatchError::Start`] if the root cannot be watched; no task is
/// spawned in that case.
pub fn spawn_connection(
    registry: &WatchRegistry,
    root: &Path,
    keepalive: Duration,
    tx: mpsc::UnboundedSender<PushMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, WatchError> {
    let (change_tx, mut change_rx) = mpsc::unbounded_channel();
    let subscription = registry.subscribe(root, move |event| {
        // Fails only after the connection task has ended.
        let _ = change_tx.send(event);
    })?;
    debug!(root = %subscription.root().display(), "push connection opened");

    Ok(tokio::spawn(async move {
        let mut heartbeat = interval_at(Instant::now() + keepalive, keepalive);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = stopped(&mut shutdown) => break,
                _ = heartbeat.tick() => {
                    if tx.send(PushMessage::keepalive()).is_err() {
                        break;
                    }
                }
                maybe_change = change_rx.recv() => {
                    let Some(change) = maybe_change else {
                        break;
                    };
                    let message = PushMessage::FileChanged {
                        event: change.kind,
                        path: change.path,
                        timestamp: now_millis(),
                    };
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            }
        }

        debug!(root = %subscription.root().display(), "push connection closed");
        subscription.unsubscribe();
    }))
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Adapts a connection's receiver into an SSE response body.
///
/// Dropping the response (client disconnect) drops `rx`, which the
/// connection task sees through `tx.closed()`.
pub fn sse_stream(
    rx: mpsc::UnboundedReceiver<PushMessage>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = UnboundedReceiverStream::new(rx).map(|message| Ok(message.to_sse()));
    // Application-level keepalives are already on the stream; the comment
    // frames only guard against proxies with shorter idle timeouts.
    Sse::new(stream).keep_alive(KeepAlive::default())
}
