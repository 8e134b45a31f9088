//! Typed event stream for observers of managed servers.
//!
//! Every state change the presentation layer reacts to is published here as a
//! tagged [`EventKind`]. Events are broadcast to all subscribers through a
//! Tokio broadcast channel and a bounded history is kept for late joiners.
//!
//! Publishing assigns a sequence number and pushes to history and channel
//! under one lock, so every subscriber sees events in publication order.

use crate::server::{ServerId, ServerStatus};
use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// A lifecycle operation on one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Install/update, then launch
    Start,
    /// Graceful stop through the remote command endpoint
    Stop,
    /// Unconditional process termination
    ForceStop,
    /// Standalone install/update
    Install,
    /// Record deletion
    Delete,
    /// Record mutation
    Save,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventKind {
    /// The set of server records changed
    ServersReloaded,
    /// A server record was persisted
    ServerSaved,
    /// The server moved to a new status
    StatusChanged {
        /// New status
        status: ServerStatus,
    },
    /// The server process is gone
    ServerExited {
        /// Exit code, if the OS reported one
        exit_code: Option<i32>,
        /// Released by a force stop
        forced: bool,
        /// OS process id of the exited process
        pid: u32,
    },
    /// The install pipeline entered a stage
    StageChanged {
        /// Stage name
        stage: String,
    },
    /// The install pipeline made progress
    ProgressUpdated {
        /// Stage the progress belongs to
        stage: String,
        /// Overall progress, 0.0 to 100.0
        percent: f64,
    },
    /// The install pipeline completed
    AppInstalled,
    /// An operation failed
    OperationFailed {
        /// Operation that failed
        operation: Operation,
        /// Install stage that failed, if any
        stage: Option<String>,
        /// Remote command that failed, if any
        command: Option<String>,
        /// Error text
        message: String,
    },
}

impl EventKind {
    /// Name of the presentation signal this event maps to, if it has one
    pub fn signal_name(&self) -> Option<&'static str> {
        match self {
            EventKind::ServersReloaded => Some("reloadServers"),
            EventKind::ServerSaved => Some("serverSaved"),
            EventKind::ServerExited { .. } => Some("onServerExit"),
            EventKind::StageChanged { .. } => Some("installingUpdateAction"),
            EventKind::ProgressUpdated { .. } => Some("installingUpdateProgress"),
            EventKind::AppInstalled => Some("appInstalled"),
            EventKind::StatusChanged { .. } | EventKind::OperationFailed { .. } => None,
        }
    }
}

/// A published event
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// Server the event is about; `None` for store-wide events
    pub server_id: Option<ServerId>,
    /// Event payload
    pub kind: EventKind,
    /// Publication order, starting at 1
    pub sequence: u64,
    /// Publication time
    pub timestamp: Instant,
}

struct History {
    next_sequence: u64,
    events: VecDeque<LifecycleEvent>,
}

/// Publish/subscribe hub for lifecycle events
pub struct EventBus {
    /// Broadcast channel for sending events to all subscribers
    sender: broadcast::Sender<LifecycleEvent>,
    /// Recent events
    history: Mutex<History>,
    /// Maximum number of events kept in history
    history_limit: usize,
}

impl EventBus {
    /// Create a bus
    ///
    /// # Arguments
    ///
    /// * `capacity` - Events buffered per subscriber before the slowest one starts lagging
    /// * `history_limit` - Events kept for [`recent_events`](Self::recent_events)
    pub fn new(capacity: usize, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(History {
                next_sequence: 1,
                events: VecDeque::new(),
            }),
            history_limit,
        }
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`.
    ///
    /// A subscriber that falls behind skips the events it missed (logged) and
    /// keeps going; the stream ends when the bus is dropped.
    pub fn stream(&self) -> impl Stream<Item = LifecycleEvent> + Send + 'static {
        let mut rx = self.sender.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Publish an event about one server
    pub fn publish(&self, server_id: ServerId, kind: EventKind) -> LifecycleEvent {
        self.publish_event(Some(server_id), kind)
    }

    /// Publish an event not tied to one server
    pub fn publish_global(&self, kind: EventKind) -> LifecycleEvent {
        self.publish_event(None, kind)
    }

    fn publish_event(&self, server_id: Option<ServerId>, kind: EventKind) -> LifecycleEvent {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let event = LifecycleEvent {
            server_id,
            kind,
            sequence: history.next_sequence,
            timestamp: Instant::now(),
        };
        history.next_sequence += 1;

        history.events.push_back(event.clone());
        while history.events.len() > self.history_limit {
            history.events.pop_front();
        }

        // Sending fails only when nobody is subscribed
        if self.sender.send(event.clone()).is_err() {
            tracing::trace!(sequence = event.sequence, "No event subscribers, event kept in history only");
        }

        event
    }

    /// Recent events, newest first.
    ///
    /// With `server_id` set only that server's events are returned.
    pub fn recent_events(&self, server_id: Option<ServerId>, limit: Option<usize>) -> Vec<LifecycleEvent> {
        let history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let events = history
            .events
            .iter()
            .rev()
            .filter(|e| server_id.is_none() || e.server_id == server_id)
            .cloned();

        match limit {
            Some(limit) => events.take(limit).collect(),
            None => events.collect(),
        }
    }

    /// Clear history
    pub fn clear_history(&self) {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        history.events.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256, 1000)
    }
}
