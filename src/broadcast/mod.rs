//! Fan-out of reconciler deltas to attached client sessions.
//!
//! `BroadcastHub` holds one delivery cursor per session plus the latest window
//! snapshot. It is owned by a single task driven through `FanoutHandle`, so
//! attach and publish are serialized: a session either gets a signal in its
//! catch-up or in a later delta, never both and never neither.

pub mod outbound;

pub use outbound::{BackpressureState, Drained, OutboundQueue, PushOutcome};

use crate::engine::window::{Delta, WindowSnapshot};
use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::models::{Cursor, Signal};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 1024;

/// Window entries a newly attached session has not seen yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatchUp {
    /// Ascending by cursor.
    pub signals: Vec<Arc<Signal>>,
    /// Delivery cursor the session starts from.
    pub cursor: Option<Cursor>,
}

struct Subscriber {
    cursor: Option<Cursor>,
    queue: Arc<OutboundQueue>,
}

pub struct BroadcastHub {
    sessions: HashMap<u64, Subscriber>,
    snapshot: Arc<WindowSnapshot>,
    metrics: Arc<Metrics>,
    session_count: watch::Sender<usize>,
}

impl BroadcastHub {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (session_count, _) = watch::channel(0);
        Self {
            sessions: HashMap::new(),
            snapshot: Arc::new(WindowSnapshot::default()),
            metrics,
            session_count,
        }
    }

    pub fn subscribe_sessions(&self) -> watch::Receiver<usize> {
        self.session_count.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Arc<WindowSnapshot> {
        self.snapshot.clone()
    }

    pub fn cursor_of(&self, connection_id: u64) -> Option<Cursor> {
        self.sessions.get(&connection_id).and_then(|s| s.cursor)
    }

    /// Replaces the snapshot used for catch-up without touching sessions.
    pub fn set_snapshot(&mut self, snapshot: Arc<WindowSnapshot>) {
        self.snapshot = snapshot;
    }

    /// Registers a session and returns what it must be sent before any delta.
    ///
    /// A resuming client passes the last cursor it saw; everything in the window
    /// after it is returned. Without a cursor the whole window is returned.
    pub fn on_client_attach(
        &mut self,
        connection_id: u64,
        cursor: Option<Cursor>,
        queue: Arc<OutboundQueue>,
    ) -> CatchUp {
        let signals = self.snapshot.after(cursor);
        let start = cursor.max(self.snapshot.cursor);
        self.sessions.insert(connection_id, Subscriber { cursor: start, queue });
        self.publish_count();

        debug!(
            connection_id = connection_id,
            catch_up = signals.len(),
            sessions = self.sessions.len(),
            "BroadcastHub: session attached"
        );
        CatchUp {
            signals,
            cursor: start,
        }
    }

    pub fn on_client_detach(&mut self, connection_id: u64) -> bool {
        let removed = self.sessions.remove(&connection_id).is_some();
        if removed {
            self.publish_count();
            debug!(connection_id = connection_id, "BroadcastHub: session detached");
        }
        removed
    }

    /// Queues the delta for every session whose cursor it passes. Returns the
    /// sessions that were dropped for exceeding the backpressure grace period.
    ///
    /// Delivery requires a cursor strictly after the session's. An update that
    /// keeps its `(timestamp, id)` therefore never reaches a session already at
    /// that cursor; the session picks up the new content on its next catch-up.
    pub fn on_delta(&mut self, delta: &Delta, snapshot: Arc<WindowSnapshot>, now: Instant) -> Vec<u64> {
        self.snapshot = snapshot;
        let mut disconnected = Vec::new();

        for (&connection_id, subscriber) in self.sessions.iter_mut() {
            let mut queued = false;
            for event in delta.after(subscriber.cursor) {
                match subscriber.queue.push(event.clone(), now) {
                    PushOutcome::Queued => {}
                    PushOutcome::DroppedOldest => self.metrics.backpressure_dropped_total.inc(),
                    PushOutcome::Disconnect => {
                        disconnected.push(connection_id);
                        break;
                    }
                }
                subscriber.cursor = Some(event.cursor());
                queued = true;
            }
            if queued {
                subscriber.queue.wake();
            }
        }

        for connection_id in &disconnected {
            if let Some(subscriber) = self.sessions.remove(connection_id) {
                subscriber.queue.mark_disconnecting();
                warn!(
                    connection_id = *connection_id,
                    dropped = subscriber.queue.dropped(),
                    "BroadcastHub: session exceeded backpressure grace, disconnecting"
                );
            }
        }
        if !disconnected.is_empty() {
            self.publish_count();
        }
        disconnected
    }

    /// Closes every session queue and forgets all sessions.
    pub fn close_all(&mut self) {
        for (_, subscriber) in self.sessions.drain() {
            subscriber.queue.close();
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        let count = self.sessions.len();
        self.metrics.sessions_active.set(count as i64);
        self.session_count.send_replace(count);
    }
}

enum HubCommand {
    Publish {
        delta: Arc<Delta>,
        snapshot: Arc<WindowSnapshot>,
    },
    Attach {
        connection_id: u64,
        cursor: Option<Cursor>,
        queue: Arc<OutboundQueue>,
        reply: oneshot::Sender<CatchUp>,
    },
    Detach {
        connection_id: u64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the task that owns the `BroadcastHub`.
#[derive(Clone)]
pub struct FanoutHandle {
    tx: mpsc::Sender<HubCommand>,
    sessions: watch::Receiver<usize>,
}

impl FanoutHandle {
    pub fn spawn(hub: BroadcastHub) -> (FanoutHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let sessions = hub.subscribe_sessions();
        let handle = tokio::spawn(run_hub(hub, rx));
        (FanoutHandle { tx, sessions }, handle)
    }

    pub async fn publish(&self, delta: Arc<Delta>, snapshot: Arc<WindowSnapshot>) -> Result<()> {
        self.tx
            .send(HubCommand::Publish { delta, snapshot })
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn attach(
        &self,
        connection_id: u64,
        cursor: Option<Cursor>,
        queue: Arc<OutboundQueue>,
    ) -> Result<CatchUp> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Attach {
                connection_id,
                cursor,
                queue,
                reply,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn detach(&self, connection_id: u64) {
        let _ = self.tx.send(HubCommand::Detach { connection_id }).await;
    }

    /// Closes every session queue and stops the hub task. Later attaches fail.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn session_count(&self) -> usize {
        *self.sessions.borrow()
    }

    pub fn subscribe_sessions(&self) -> watch::Receiver<usize> {
        self.sessions.clone()
    }
}

async fn run_hub(mut hub: BroadcastHub, mut rx: mpsc::Receiver<HubCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Publish { delta, snapshot } => {
                let disconnected = hub.on_delta(&delta, snapshot, Instant::now());
                if !disconnected.is_empty() {
                    debug!(count = disconnected.len(), "BroadcastHub: dropped slow sessions");
                }
            }
            HubCommand::Attach {
                connection_id,
                cursor,
                queue,
                reply,
            } => {
                let catch_up = hub.on_client_attach(connection_id, cursor, queue);
                if reply.send(catch_up).is_err() {
                    // Session went away while waiting for its catch-up.
                    hub.on_client_detach(connection_id);
                }
            }
            HubCommand::Detach { connection_id } => {
                hub.on_client_detach(connection_id);
            }
            HubCommand::Shutdown { done } => {
                let sessions = hub.session_count();
                hub.close_all();
                info!(sessions = sessions, "BroadcastHub: closed {} session(s)", sessions);
                let _ = done.send(());
                break;
            }
        }
    }
}
