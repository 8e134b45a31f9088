use crate::error::{Error, Result};
use crate::server::{ProcessSupervisor, ServerId, ServerRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

/// Cached liveness answer for one server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Server the snapshot describes
    pub server_id: ServerId,
    /// Whether the server was found alive
    pub is_running: bool,
    /// When the probe ran
    pub last_checked_at: Instant,
    /// The probe errored; `is_running` was forced to false
    pub probe_failed: bool,
}

impl StatusSnapshot {
    /// Whether the snapshot is younger than `freshness`
    pub fn is_fresh(&self, freshness: Duration) -> bool {
        self.last_checked_at.elapsed() < freshness
    }
}

/// A way of finding out whether a server is alive.
///
/// `Ok(false)` means the server is unreachable; `Err` means the probe itself
/// could not give an answer.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Probe one server
    async fn probe(&self, record: &ServerRecord) -> Result<bool>;
}

/// Asks the process supervisor whether it holds a handle
pub struct SupervisorProbe {
    supervisor: Arc<ProcessSupervisor>,
}

impl SupervisorProbe {
    /// Probe through `supervisor`
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl LivenessProbe for SupervisorProbe {
    async fn probe(&self, record: &ServerRecord) -> Result<bool> {
        Ok(self.supervisor.is_running(record.id))
    }
}

/// Attempts a TCP connection to the server's remote command port.
///
/// Finds servers started outside this runner, at the cost of a network
/// round trip.
pub struct RemoteEndpointProbe {
    timeout: Duration,
}

impl RemoteEndpointProbe {
    /// Probe with a connect bound of `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LivenessProbe for RemoteEndpointProbe {
    async fn probe(&self, record: &ServerRecord) -> Result<bool> {
        let addr = (record.network_address.as_str(), record.remote_command_port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => Ok(false),
            Ok(Err(e)) => Err(Error::Communication(format!("Probe connect failed: {}", e))),
            Err(_) => Ok(false),
        }
    }
}

type Entry = Arc<AsyncMutex<Option<StatusSnapshot>>>;

/// Per-server cache of liveness answers.
///
/// Each entry is guarded by its own async lock, so a query's
/// read-check-probe-write is atomic against concurrent queries and
/// invalidations of the same server while other servers proceed in parallel.
pub struct StatusCache {
    /// Probe used on a miss or stale entry
    probe: Arc<dyn LivenessProbe>,
    /// How long an answer stays fresh
    freshness: Duration,
    /// Cache entries by server id
    entries: Mutex<HashMap<ServerId, Entry>>,
}

impl StatusCache {
    /// Create a cache that answers through `probe`
    pub fn new(probe: Arc<dyn LivenessProbe>, freshness: Duration) -> Self {
        Self {
            probe,
            freshness,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Freshness threshold
    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Liveness of a server, probing when the cached answer is missing or stale.
    ///
    /// Never fails: a probe error is logged and reported as not running.
    #[tracing::instrument(skip(self, record), fields(server_id = %record.id))]
    pub async fn query(&self, record: &ServerRecord) -> StatusSnapshot {
        let entry = self.entry(record.id);
        let mut cached = entry.lock().await;

        if let Some(snapshot) = cached.as_ref() {
            if snapshot.is_fresh(self.freshness) {
                tracing::trace!(is_running = snapshot.is_running, "Status served from cache");
                return *snapshot;
            }
        }

        let (is_running, probe_failed) = match self.probe.probe(record).await {
            Ok(alive) => (alive, false),
            Err(e) => {
                tracing::warn!(error = %e, "Liveness probe failed, reporting not running");
                (false, true)
            }
        };

        let snapshot = StatusSnapshot {
            server_id: record.id,
            is_running,
            last_checked_at: Instant::now(),
            probe_failed,
        };
        *cached = Some(snapshot);

        tracing::debug!(is_running, probe_failed, "Status probed");
        snapshot
    }

    /// The cached answer without probing
    pub async fn peek(&self, id: ServerId) -> Option<StatusSnapshot> {
        let entry = self.existing_entry(id)?;
        let cached = entry.lock().await;
        *cached
    }

    /// Force the next query for `id` to probe
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn invalidate(&self, id: ServerId) {
        if let Some(entry) = self.existing_entry(id) {
            *entry.lock().await = None;
            tracing::debug!("Status invalidated");
        }
    }

    /// Drop the entry of a deleted server
    pub fn remove(&self, id: ServerId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&id);
        }
    }

    fn entry(&self, id: ServerId) -> Entry {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(entries.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(None))))
    }

    fn existing_entry(&self, id: ServerId) -> Option<Entry> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(&id).cloned()
    }
}
