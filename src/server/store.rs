use crate::error::{Error, Result};
use crate::server::{ServerId, ServerRecord};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RECORD_FILE: &str = "server.json";
const INSTALL_DIR: &str = "install";
const NEXT_ID_FILE: &str = "next_id";

/// Durable store of server records.
///
/// Each server owns a profile directory `<root>/<id>/` holding its
/// `server.json`. Reads are served from an in-memory copy; every mutation is
/// written through to disk immediately. [`reload_from_disk`](Self::reload_from_disk)
/// is the only way to pick up edits made to the files by hand.
///
/// Ids are never reissued: the next id is persisted in `<root>/next_id` and
/// only ever grows, so a deleted server's id stays retired.
pub struct ServerStore {
    /// Directory holding one profile directory per server
    root: PathBuf,
    /// Records as last loaded or written
    records: Mutex<BTreeMap<ServerId, ServerRecord>>,
    /// Id the next created record gets
    next_id: Mutex<u32>,
}

impl ServerStore {
    /// Open (or create) a store rooted at `root` and load every record in it
    #[tracing::instrument(skip(root), fields(root = ?root.as_ref()))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            Error::Storage(format!("Failed to create servers directory {}: {}", root.display(), e))
        })?;

        let records = load_records(&root)?;
        let next_id = read_next_id(&root).max(after_highest(&records));
        tracing::info!(num_servers = records.len(), next_id, "Opened server store");

        Ok(Self {
            root,
            records: Mutex::new(records),
            next_id: Mutex::new(next_id),
        })
    }

    /// Directory holding the server profiles
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Profile directory of one server
    pub fn profile_dir(&self, id: ServerId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Create a new server record with an id never used before in this store.
    ///
    /// With `scaffold` set, an `install` directory is created inside the
    /// profile and used as the install path.
    #[tracing::instrument(skip(self))]
    pub fn create(&self, scaffold: bool) -> Result<ServerRecord> {
        let mut records = self.lock()?;
        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| Error::Other("Failed to lock next server id".to_string()))?;

        let id = ServerId::new(*next_id);
        let following = id
            .get()
            .checked_add(1)
            .ok_or_else(|| Error::Storage("Server ids exhausted".to_string()))?;
        // Retire the id before anything refers to it
        write_atomic(&self.root.join(NEXT_ID_FILE), following.to_string().as_bytes())?;
        *next_id = following;

        let mut record = ServerRecord::new(id);

        if scaffold {
            let install_dir = self.profile_dir(id).join(INSTALL_DIR);
            fs::create_dir_all(&install_dir).map_err(|e| {
                Error::Storage(format!("Failed to scaffold {}: {}", install_dir.display(), e))
            })?;
            record.install_path = install_dir;
        }

        self.write_record(&record)?;
        records.insert(id, record.clone());

        tracing::info!(server_id = %id, "Created server record");
        Ok(record)
    }

    /// Get a record from the in-memory copy
    pub fn get(&self, id: ServerId) -> Result<ServerRecord> {
        self.lock()?.get(&id).cloned().ok_or(Error::ServerNotFound(id))
    }

    /// Whether a record exists
    pub fn contains(&self, id: ServerId) -> bool {
        self.lock().map(|records| records.contains_key(&id)).unwrap_or(false)
    }

    /// All records from the in-memory copy, ordered by id
    pub fn all(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    /// Persist a record, replacing whatever was stored before
    #[tracing::instrument(skip(self, record), fields(server_id = %record.id))]
    pub fn save(&self, record: &ServerRecord) -> Result<()> {
        let mut records = self.lock()?;
        if !records.contains_key(&record.id) {
            return Err(Error::ServerNotFound(record.id));
        }

        self.write_record(record)?;
        records.insert(record.id, record.clone());

        tracing::debug!("Saved server record");
        Ok(())
    }

    /// Re-read every record from disk, replacing the in-memory copy
    #[tracing::instrument(skip(self))]
    pub fn reload_from_disk(&self) -> Result<Vec<ServerRecord>> {
        let loaded = load_records(&self.root)?;
        let mut records = self.lock()?;
        if let Ok(mut next_id) = self.next_id.lock() {
            *next_id = (*next_id).max(after_highest(&loaded));
        }
        *records = loaded;

        tracing::info!(num_servers = records.len(), "Reloaded server records from disk");
        Ok(records.values().cloned().collect())
    }

    /// Remove a record and its profile directory
    #[tracing::instrument(skip(self))]
    pub fn delete(&self, id: ServerId) -> Result<()> {
        let mut records = self.lock()?;
        if records.remove(&id).is_none() {
            return Err(Error::ServerNotFound(id));
        }

        let dir = self.profile_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                Error::Storage(format!("Failed to remove {}: {}", dir.display(), e))
            })?;
        }

        tracing::info!("Deleted server record");
        Ok(())
    }

    fn write_record(&self, record: &ServerRecord) -> Result<()> {
        let dir = self.profile_dir(record.id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("Failed to create {}: {}", dir.display(), e)))?;

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Error::Serialization(format!("Failed to serialize server record: {}", e)))?;

        write_atomic(&dir.join(RECORD_FILE), json.as_bytes())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<ServerId, ServerRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::Other("Failed to lock server records".to_string()))
    }
}

// Writes to a sibling file first so a crash never leaves half a file
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)
        .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Storage(format!("Failed to replace {}: {}", path.display(), e)))
}

fn after_highest(records: &BTreeMap<ServerId, ServerRecord>) -> u32 {
    records
        .keys()
        .next_back()
        .map(|id| id.get().saturating_add(1))
        .unwrap_or(1)
}

fn read_next_id(root: &Path) -> u32 {
    let path = root.join(NEXT_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => content.trim().parse().unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed next id");
            1
        }),
        Err(_) => 1,
    }
}

fn load_records(root: &Path) -> Result<BTreeMap<ServerId, ServerRecord>> {
    let entries = fs::read_dir(root)
        .map_err(|e| Error::Storage(format!("Failed to read {}: {}", root.display(), e)))?;

    let mut records = BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path().join(RECORD_FILE);
        if !path.is_file() {
            continue;
        }

        let record = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                serde_json::from_str::<ServerRecord>(&content).map_err(|e| e.to_string())
            });

        match record {
            Ok(record) => {
                records.insert(record.id, record);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable server record");
            }
        }
    }

    Ok(records)
}
