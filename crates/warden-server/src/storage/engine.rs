//! Snapshot storage engine.
//!
//! State is an immutable [`Snapshot`] swapped behind a lock. Writers hold the
//! write mutex for the whole validate-and-commit step, build the next snapshot
//! copy-on-write, persist the entry to the WAL and then publish. Readers clone
//! the current `Arc` and never observe a partial mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};
use warden_common::{Result, WardenError};

use super::catalog::{Catalog, DocWrite};
use super::wal::{CheckpointImage, Wal, WalConfig};
use super::{Document, USERS_NS};
use crate::authz::RoleGraph;
use crate::config::StorageConfig;
use crate::replication::{LogEntry, LogPosition, LogView, RollbackPlan};

/// A consistent view of the catalog and the role graph derived from it.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub catalog: Catalog,
    pub roles: Arc<RoleGraph>,
    pub last_applied: LogPosition,
}

impl Snapshot {
    pub fn get(&self, ns: &str, id: &str) -> Option<&Document> {
        self.catalog.get(ns, id)
    }

    /// Whether any principal exists.
    pub fn has_users(&self) -> bool {
        self.catalog.contains_collection(USERS_NS)
    }
}

/// Outcome of a completed rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackSummary {
    pub common_point: LogPosition,
    pub undone: usize,
    pub reapplied: usize,
    /// Undone entries that touched users or roles.
    pub auth_entries_undone: usize,
    pub last_applied: LogPosition,
}

#[derive(Debug, Default)]
struct LogState {
    checkpoint: Option<Arc<CheckpointImage>>,
    entries: Vec<LogEntry>,
}

impl LogState {
    fn start(&self) -> LogPosition {
        self.checkpoint
            .as_ref()
            .map(|c| c.position)
            .unwrap_or(LogPosition::ZERO)
    }
}

/// Storage engine owning the catalog, the in-memory log and the WAL.
pub struct StorageEngine {
    current: RwLock<Arc<Snapshot>>,
    log: RwLock<LogState>,
    wal: Option<Mutex<Wal>>,
    write_lock: Mutex<()>,
    generation: AtomicU64,
}

impl StorageEngine {
    /// Engine without persistence.
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            log: RwLock::new(LogState::default()),
            wal: None,
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Open the engine, replaying the WAL when a data directory is configured.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let Some(dir) = &config.data_dir else {
            return Ok(Self::in_memory());
        };

        let (wal, recovered) = Wal::open(WalConfig::in_dir(dir, config.sync_on_write))?;

        let mut catalog = recovered
            .checkpoint
            .as_ref()
            .map(|image| Catalog::from_collections(image.collections.clone()))
            .unwrap_or_default();
        let log = LogState {
            checkpoint: recovered.checkpoint.map(Arc::new),
            entries: recovered.entries,
        };

        let mut last_applied = log.start();
        for entry in &log.entries {
            if entry.position <= last_applied {
                return Err(WardenError::Storage(format!(
                    "WAL out of order: {} after {}",
                    entry.position, last_applied
                )));
            }
            for write in &entry.writes {
                catalog.apply(write);
            }
            last_applied = entry.position;
        }

        info!(
            path = %wal.path().display(),
            entries = log.entries.len(),
            last_applied = %last_applied,
            "Recovered storage from WAL"
        );

        let engine = Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            log: RwLock::new(log),
            wal: Some(Mutex::new(wal)),
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        };
        let roles = RoleGraph::from_catalog(&catalog, engine.next_generation());
        *engine.current.write() = Arc::new(Snapshot {
            catalog,
            roles: Arc::new(roles),
            last_applied,
        });
        Ok(engine)
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn last_position(&self) -> LogPosition {
        self.current.read().last_applied
    }

    /// Whether the retained log holds an entry at `position`.
    pub fn contains(&self, position: LogPosition) -> bool {
        let log = self.log.read();
        position == log.start()
            || log
                .entries
                .binary_search_by_key(&position, |e| e.position)
                .is_ok()
    }

    /// Copy of the retained log.
    pub fn log_view(&self) -> LogView {
        let log = self.log.read();
        LogView {
            start: log.start(),
            entries: log.entries.clone(),
        }
    }

    /// Begin a local write. The returned transaction holds the write mutex.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        let guard = self.write_lock.lock();
        WriteTxn {
            engine: self,
            base: self.snapshot(),
            _guard: guard,
        }
    }

    /// Apply entries shipped from another member.
    ///
    /// Entries at or before the last applied position are skipped. The first
    /// new entry must directly follow it.
    pub fn apply_replicated(&self, entries: &[LogEntry]) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let base = self.snapshot();

        let fresh: Vec<LogEntry> = entries
            .iter()
            .filter(|e| e.position > base.last_applied)
            .cloned()
            .collect();
        let Some(first) = fresh.first() else {
            return Ok(0);
        };
        if first.position.index != base.last_applied.index + 1 {
            return Err(WardenError::Storage(format!(
                "Log gap: {} does not follow {}",
                first.position, base.last_applied
            )));
        }

        self.install(&base, &fresh)?;
        Ok(fresh.len())
    }

    /// Undo local entries after the plan's common point and apply the source's
    /// entries in their place.
    pub fn rollback_to(&self, plan: &RollbackPlan) -> Result<RollbackSummary> {
        let _guard = self.write_lock.lock();
        let base = self.snapshot();
        let mut log = self.log.write();

        if plan.common_point < log.start() {
            return Err(WardenError::RollbackFailed(format!(
                "common point {} precedes checkpoint {}",
                plan.common_point,
                log.start()
            )));
        }

        let split = log
            .entries
            .partition_point(|e| e.position <= plan.common_point);
        let undone = &log.entries[split..];

        let mut catalog = base.catalog.clone();
        for entry in undone.iter().rev() {
            debug!(position = %entry.position, "Undoing log entry");
            for write in entry.writes.iter().rev() {
                catalog.undo(write);
            }
        }
        let mut last_applied = plan.common_point;
        for entry in &plan.reapply {
            if entry.position <= last_applied {
                return Err(WardenError::RollbackFailed(format!(
                    "source entry {} out of order",
                    entry.position
                )));
            }
            for write in &entry.writes {
                catalog.apply(write);
            }
            last_applied = entry.position;
        }

        let mut entries = log.entries[..split].to_vec();
        entries.extend(plan.reapply.iter().cloned());

        if let Some(wal) = &self.wal {
            wal.lock()
                .rewrite(log.checkpoint.as_deref(), &entries)
                .map_err(|e| WardenError::RollbackFailed(e.to_string()))?;
        }

        let summary = RollbackSummary {
            common_point: plan.common_point,
            undone: undone.len(),
            reapplied: plan.reapply.len(),
            auth_entries_undone: undone.iter().filter(|e| e.touches_auth()).count(),
            last_applied,
        };

        let roles = RoleGraph::from_catalog(&catalog, self.next_generation());
        log.entries = entries;
        *self.current.write() = Arc::new(Snapshot {
            catalog,
            roles: Arc::new(roles),
            last_applied,
        });

        Ok(summary)
    }

    /// Fold the whole log into a checkpoint image.
    ///
    /// Members whose history diverged before the checkpoint can no longer
    /// find a common point with this member.
    pub fn checkpoint(&self) -> Result<LogPosition> {
        let _guard = self.write_lock.lock();
        let base = self.snapshot();
        let image = CheckpointImage {
            position: base.last_applied,
            collections: base
                .catalog
                .iter()
                .map(|(ns, docs)| (ns.to_string(), docs.clone()))
                .collect(),
        };

        if let Some(wal) = &self.wal {
            wal.lock().rewrite(Some(&image), &[])?;
        }

        let mut log = self.log.write();
        log.entries.clear();
        log.checkpoint = Some(Arc::new(image));
        info!(position = %base.last_applied, "Checkpoint written");
        Ok(base.last_applied)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Persist and publish entries on top of `base`. Caller holds the write mutex.
    fn install(&self, base: &Snapshot, entries: &[LogEntry]) -> Result<Arc<Snapshot>> {
        let mut catalog = base.catalog.clone();
        let mut roles = base.roles.clone();
        let mut last_applied = base.last_applied;

        for entry in entries {
            for write in &entry.writes {
                catalog.apply(write);
            }
            if entry.touches_auth() {
                roles = Arc::new(roles.with_writes(&entry.writes, self.next_generation()));
            }
            last_applied = entry.position;
        }

        if let Some(wal) = &self.wal {
            let mut wal = wal.lock();
            for entry in entries {
                wal.append(entry)?;
            }
        }

        let snapshot = Arc::new(Snapshot {
            catalog,
            roles,
            last_applied,
        });
        self.log.write().entries.extend(entries.iter().cloned());
        *self.current.write() = snapshot.clone();
        Ok(snapshot)
    }
}

/// A local write in progress.
pub struct WriteTxn<'a> {
    engine: &'a StorageEngine,
    base: Arc<Snapshot>,
    _guard: MutexGuard<'a, ()>,
}

impl WriteTxn<'_> {
    /// The snapshot validation runs against.
    pub fn snapshot(&self) -> &Snapshot {
        &self.base
    }

    /// Commit `writes` as one entry in `term`.
    pub fn commit(self, term: u64, writes: Vec<DocWrite>) -> Result<LogEntry> {
        let entry = LogEntry {
            position: self.base.last_applied.next(term),
            writes,
        };
        self.engine
            .install(&self.base, std::slice::from_ref(&entry))?;
        Ok(entry)
    }
}
