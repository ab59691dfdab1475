//! Transactional record store shared by the claim and draw coordinators.
//!
//! Every record lives under a [`RecordKey`] and carries a version taken from a
//! monotonic commit sequence. A [`Transaction`] reads from the snapshot taken
//! when it began and buffers its writes; [`TransactionalStore::commit`] only
//! applies them if nothing the transaction touched moved in the meantime.
//! [`run_transaction`] wraps that in a bounded retry loop.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use draw_core::{Identity, NameKey, ParticipantName};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Placeholder for timestamp fields; replaced with the commit time when the
/// record is written.
pub const SERVER_TIMESTAMP: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "collection", content = "id", rename_all = "snake_case")]
pub enum RecordKey {
    Claim(Identity),
    Ownership(NameKey),
    DrawMeta,
    Assignment(NameKey),
}

impl RecordKey {
    fn accepts(&self, record: &Record) -> bool {
        matches!(
            (self, record),
            (RecordKey::Claim(_), Record::Claim(_))
                | (RecordKey::Ownership(_), Record::Ownership(_))
                | (RecordKey::DrawMeta, Record::DrawMeta(_))
                | (RecordKey::Assignment(_), Record::Assignment(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub claimed_name_key: NameKey,
    pub claimed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub participant_name: ParticipantName,
    pub owner_identity: Identity,
    pub claimed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawingMetadata {
    pub locked: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub name: ParticipantName,
    pub assigned_to: ParticipantName,
    pub drawn_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Claim(ClaimRecord),
    Ownership(OwnershipRecord),
    DrawMeta(DrawingMetadata),
    Assignment(AssignmentRecord),
}

impl Record {
    fn stamp(&mut self, now: u64) {
        match self {
            Record::Claim(r) => r.claimed_at = now,
            Record::Ownership(r) => r.claimed_at = now,
            Record::DrawMeta(r) => r.created_at = now,
            Record::Assignment(r) => r.drawn_at = now,
        }
    }

    pub fn into_claim(self) -> Option<ClaimRecord> {
        match self {
            Record::Claim(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_ownership(self) -> Option<OwnershipRecord> {
        match self {
            Record::Ownership(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_draw_meta(self) -> Option<DrawingMetadata> {
        match self {
            Record::DrawMeta(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_assignment(self) -> Option<AssignmentRecord> {
        match self {
            Record::Assignment(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transaction conflicted with a concurrent commit")]
    Conflict,
    #[error("transaction gave up after {attempts} conflicting attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("record kind does not match key {0:?}")]
    KindMismatch(RecordKey),
    #[error("persist error: {0}")]
    Persist(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
struct Versioned {
    version: u64,
    record: Record,
}

/// A unit of work over a consistent snapshot of the store.
#[derive(Debug)]
pub struct Transaction {
    snapshot: HashMap<RecordKey, Versioned>,
    observed: BTreeMap<RecordKey, u64>,
    writes: BTreeMap<RecordKey, Record>,
}

impl Transaction {
    fn over(snapshot: HashMap<RecordKey, Versioned>) -> Self {
        Self {
            snapshot,
            observed: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    fn snapshot_version(&self, key: &RecordKey) -> u64 {
        self.snapshot.get(key).map(|v| v.version).unwrap_or(0)
    }

    /// Reads a record as of the snapshot, or this transaction's own pending
    /// write for the key.
    pub fn get(&mut self, key: &RecordKey) -> Option<Record> {
        let version = self.snapshot_version(key);
        self.observed.insert(key.clone(), version);
        if let Some(pending) = self.writes.get(key) {
            return Some(pending.clone());
        }
        self.snapshot.get(key).map(|v| v.record.clone())
    }

    pub fn set(&mut self, key: RecordKey, record: Record) -> Result<(), StoreError> {
        if !key.accepts(&record) {
            return Err(StoreError::KindMismatch(key));
        }
        let version = self.snapshot_version(&key);
        self.observed.entry(key.clone()).or_insert(version);
        self.writes.insert(key, record);
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Minimal contract the coordinators need from a store.
pub trait TransactionalStore: Send + Sync {
    /// Point read outside any transaction.
    fn get(&self, key: &RecordKey)
        -> impl Future<Output = Result<Option<Record>, StoreError>> + Send;

    fn begin(&self) -> impl Future<Output = Transaction> + Send;

    /// Applies every buffered write atomically, or none of them with
    /// [`StoreError::Conflict`] if a record the transaction touched changed
    /// since its snapshot.
    fn commit(&self, tx: Transaction) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Runs `body` in a fresh transaction until it commits, the body fails, or
/// `policy.max_attempts` conflicts have been seen.
///
/// The body may run more than once and must not have side effects outside
/// the transaction.
pub async fn run_transaction<S, T, E, F>(store: &S, policy: RetryPolicy, mut body: F) -> Result<T, E>
where
    S: TransactionalStore,
    F: FnMut(&mut Transaction) -> Result<T, E> + Send,
    T: Send,
    E: From<StoreError> + Send,
{
    for attempt in 1..=policy.max_attempts {
        let mut tx = store.begin().await;
        let value = body(&mut tx)?;
        if tx.is_read_only() {
            return Ok(value);
        }
        match store.commit(tx).await {
            Ok(()) => return Ok(value),
            Err(StoreError::Conflict) => {
                debug!(attempt, "transaction conflict, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
    warn!(attempts = policy.max_attempts, "transaction retries exhausted");
    Err(StoreError::RetriesExhausted {
        attempts: policy.max_attempts,
    }
    .into())
}

#[derive(Default)]
struct StoreState {
    records: HashMap<RecordKey, Versioned>,
    commit_seq: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    key: RecordKey,
    version: u64,
    record: Record,
}

/// In-process store, optionally mirrored to a JSON file on every commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Opens a store backed by `path`, loading whatever a previous run
    /// committed there. A missing file starts empty.
    pub async fn with_persistence(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut state = StoreState::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let saved: Vec<PersistedRecord> = serde_json::from_slice(&bytes)?;
                for entry in saved {
                    state.commit_seq = state.commit_seq.max(entry.version);
                    state.records.insert(
                        entry.key,
                        Versioned {
                            version: entry.version,
                            record: entry.record,
                        },
                    );
                }
                debug!(path = %path.display(), records = state.records.len(), "loaded store");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            persist_path: Some(path),
        })
    }

    /// Commit sequence number that last wrote `key`.
    #[cfg(test)]
    pub(crate) async fn version(&self, key: &RecordKey) -> Option<u64> {
        self.state.read().await.records.get(key).map(|v| v.version)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, records: &HashMap<RecordKey, Versioned>) -> Result<(), StoreError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let mut entries: Vec<PersistedRecord> = records
            .iter()
            .map(|(key, v)| PersistedRecord {
                key: key.clone(),
                version: v.version,
                record: v.record.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let json = serde_json::to_vec_pretty(&entries)?;

        // The previous snapshot stays in place until the new one is complete.
        let staging = staging_path(path);
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

impl TransactionalStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .records
            .get(key)
            .map(|v| v.record.clone()))
    }

    async fn begin(&self) -> Transaction {
        Transaction::over(self.state.read().await.records.clone())
    }

    async fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stale = tx.observed.iter().any(|(key, seen)| {
            let current = state.records.get(key).map(|v| v.version).unwrap_or(0);
            current != *seen
        });
        if stale {
            return Err(StoreError::Conflict);
        }

        let version = state.commit_seq + 1;
        let now = now_millis();
        let mut next = state.records.clone();
        for (key, mut record) in tx.writes {
            record.stamp(now);
            next.insert(key, Versioned { version, record });
        }
        self.persist(&next).await?;

        state.records = next;
        state.commit_seq = version;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
