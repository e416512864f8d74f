//! Run lock management.
//!
//! One lock file per run directory guarantees a single worker process per
//! run. The lock is created with a unique-create (hard link of a fully
//! written temp file, so no reader ever sees a half-written lock), refreshed
//! by heartbeats, and deleted on clean release. A lock whose heartbeat is
//! older than the stale TTL is presumed abandoned and is archived by rename,
//! never deleted.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{LockError, StateError};
use crate::storage;

/// File name of the lock inside a run directory.
pub const LOCK_FILE_NAME: &str = "run.lock";
/// Directory (inside the run directory) that receives archived stale locks.
pub const LOCK_ARCHIVE_DIR: &str = "locks";

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub run_id: String,
    /// Random per-acquisition token; distinguishes two acquisitions by the same pid.
    pub token: Uuid,
}

impl LockRecord {
    fn new(run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            pid: std::process::id(),
            host: get_hostname(),
            started_at: now,
            last_heartbeat_at: now,
            run_id: run_id.to_string(),
            token: Uuid::new_v4(),
        }
    }

    /// Human-readable holder description used in conflict errors.
    pub fn holder(&self) -> String {
        format!(
            "pid {} on {} (run {}, since {})",
            self.pid,
            self.host,
            self.run_id,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Seconds since the last heartbeat. Negative ages (clock skew) count as zero.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_heartbeat_at).max(chrono::Duration::zero())
    }
}

fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// On-disk identity of a lock file (device + inode on unix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(Self {
                dev: meta.dev(),
                ino: meta.ino(),
            })
        }
        #[cfg(not(unix))]
        {
            // No stable inode; the record token carries identity instead.
            let _ = meta;
            Ok(Self { dev: 0, ino: 0 })
        }
    }
}

/// Proof of lock ownership returned by [`RunLock::acquire`].
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub path: PathBuf,
    pub identity: FileIdentity,
    pub record: LockRecord,
}

impl LockHandle {
    pub fn run_id(&self) -> &str {
        &self.record.run_id
    }
}

/// Tunables for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// A lock whose heartbeat is older than this is stale.
    pub stale_ttl: Duration,
    /// Contended attempts before giving up with [`LockError::Race`].
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts; jitter is added on top.
    pub retry_base: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_ttl: Duration::from_secs(120),
            retry_attempts: 5,
            retry_base: Duration::from_millis(200),
        }
    }
}

/// What was found when inspecting an existing lock file.
#[derive(Debug, Clone)]
pub enum LockInspection {
    Fresh { record: LockRecord, age_secs: i64 },
    Stale { record: LockRecord, age_secs: i64 },
}

/// Lock manager for a single run directory.
#[derive(Debug, Clone)]
pub struct RunLock {
    run_dir: PathBuf,
    settings: LockSettings,
}

enum CreateOutcome {
    Created(LockHandle),
    Exists,
}

enum ExistingLock {
    Fresh(LockRecord, i64),
    Stale(LockRecord, FileIdentity, i64),
    Vanished,
}

impl RunLock {
    pub fn new(run_dir: impl Into<PathBuf>, settings: LockSettings) -> Self {
        Self {
            run_dir: run_dir.into(),
            settings,
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.run_dir.join(LOCK_FILE_NAME)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.run_dir.join(LOCK_ARCHIVE_DIR)
    }

    /// Acquire the run lock.
    ///
    /// Fails immediately with [`LockError::Active`] if a fresh lock exists.
    /// A stale lock is archived and acquisition retried with jittered
    /// backoff; [`LockError::Race`] is returned if every attempt is lost to
    /// other waiters.
    pub async fn acquire(&self, run_id: &str) -> Result<LockHandle, LockError> {
        fs::create_dir_all(&self.run_dir).map_err(|source| LockError::Io {
            path: self.run_dir.clone(),
            source,
        })?;

        let attempts = self.settings.retry_attempts.max(1);
        for attempt in 0..attempts {
            let now = Utc::now();
            if let CreateOutcome::Created(handle) = self.try_create(run_id, now)? {
                info!(run_id, pid = handle.record.pid, "Acquired run lock");
                return Ok(handle);
            }

            match self.inspect_existing(run_id, now)? {
                ExistingLock::Fresh(record, age) => {
                    return Err(LockError::Active {
                        holder: record.holder(),
                        heartbeat_age_secs: age,
                    });
                }
                ExistingLock::Stale(record, identity, age) => {
                    warn!(
                        run_id,
                        stale_pid = record.pid,
                        age_secs = age,
                        "Found stale run lock, archiving"
                    );
                    self.archive(&record, identity, now)?;
                }
                ExistingLock::Vanished => {
                    debug!(run_id, "Lock vanished while inspecting, retrying");
                }
            }

            tokio::time::sleep(self.backoff(attempt)).await;
        }

        Err(LockError::Race { attempts })
    }

    /// Refresh `last_heartbeat_at`, provided the on-disk lock is still ours.
    ///
    /// Any identity or run_id mismatch returns [`LockError::Lost`]; the
    /// caller must stop work. I/O failures return [`LockError::Io`] and may
    /// be retried on the next tick.
    pub fn heartbeat(&self, handle: &mut LockHandle) -> Result<(), LockError> {
        self.heartbeat_at(handle, Utc::now())
    }

    pub(crate) fn heartbeat_at(
        &self,
        handle: &mut LockHandle,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        let record = self.verify_owned(handle)?.ok_or_else(|| LockError::Lost {
            reason: "lock file removed".to_string(),
        })?;

        let updated = LockRecord {
            last_heartbeat_at: now,
            ..record
        };
        storage::write_json_atomic(&handle.path, &updated).map_err(lock_io)?;

        // Atomic replace changes the inode; re-anchor identity to the new file.
        handle.identity = FileIdentity::of(&handle.path).map_err(|source| LockError::Io {
            path: handle.path.clone(),
            source,
        })?;
        handle.record = updated;
        Ok(())
    }

    /// Delete the lock if it is still ours.
    ///
    /// Returns `Ok(false)` if the lock is already gone.
    pub fn release(&self, handle: &LockHandle, run_id: &str) -> Result<bool, LockError> {
        if handle.record.run_id != run_id {
            return Err(LockError::Lost {
                reason: format!(
                    "release requested for run {} but handle belongs to {}",
                    run_id, handle.record.run_id
                ),
            });
        }
        if self.verify_owned(handle)?.is_none() {
            return Ok(false);
        }

        match fs::remove_file(&handle.path) {
            Ok(()) => {
                info!(run_id, "Released run lock");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LockError::Io {
                path: handle.path.clone(),
                source,
            }),
        }
    }

    /// Read-only view of the current lock, if any.
    pub fn inspect(&self, now: DateTime<Utc>) -> Result<Option<LockInspection>, LockError> {
        let path = self.lock_path();
        let Some(record) = read_record(&path)? else {
            return Ok(None);
        };
        let age = record.heartbeat_age(now);
        let age_secs = age.num_seconds();
        if self.is_stale(age) {
            Ok(Some(LockInspection::Stale { record, age_secs }))
        } else {
            Ok(Some(LockInspection::Fresh { record, age_secs }))
        }
    }

    fn is_stale(&self, age: chrono::Duration) -> bool {
        let ttl = chrono::Duration::from_std(self.settings.stale_ttl)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        age > ttl
    }

    /// Confirm the on-disk lock still matches `handle`. `Ok(None)` if absent.
    fn verify_owned(&self, handle: &LockHandle) -> Result<Option<LockRecord>, LockError> {
        let identity = match FileIdentity::of(&handle.path) {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LockError::Io {
                    path: handle.path.clone(),
                    source,
                });
            }
        };
        if identity != handle.identity {
            return Err(LockError::Lost {
                reason: format!(
                    "lock file identity changed (expected dev {} ino {}, found dev {} ino {})",
                    handle.identity.dev, handle.identity.ino, identity.dev, identity.ino
                ),
            });
        }

        let record = match read_record(&handle.path) {
            Ok(Some(r)) => r,
            Ok(None) => return Ok(None),
            Err(LockError::Invalid { reason, .. }) => {
                return Err(LockError::Lost {
                    reason: format!("lock file rewritten with unreadable contents: {reason}"),
                });
            }
            Err(e) => return Err(e),
        };
        if record.run_id != handle.record.run_id || record.token != handle.record.token {
            return Err(LockError::Lost {
                reason: format!(
                    "lock now held by {} (token {})",
                    record.holder(),
                    record.token
                ),
            });
        }
        Ok(Some(record))
    }

    fn try_create(&self, run_id: &str, now: DateTime<Utc>) -> Result<CreateOutcome, LockError> {
        let path = self.lock_path();
        let record = LockRecord::new(run_id, now);
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| LockError::Invalid {
            path: path.clone(),
            reason: format!("cannot encode lock record: {e}"),
        })?;

        let io = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        let mut temp = tempfile::Builder::new()
            .prefix(".lock-")
            .tempfile_in(&self.run_dir)
            .map_err(io)?;
        temp.write_all(&bytes).map_err(io)?;
        temp.as_file().sync_all().map_err(io)?;

        match fs::hard_link(temp.path(), &path) {
            Ok(()) => {
                storage::sync_dir(&self.run_dir).map_err(lock_io)?;
                let identity = FileIdentity::of(&path).map_err(io)?;
                Ok(CreateOutcome::Created(LockHandle {
                    path,
                    identity,
                    record,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(CreateOutcome::Exists),
            Err(e) => Err(io(e)),
        }
    }

    fn inspect_existing(&self, run_id: &str, now: DateTime<Utc>) -> Result<ExistingLock, LockError> {
        let path = self.lock_path();
        let identity = match FileIdentity::of(&path) {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ExistingLock::Vanished),
            Err(source) => return Err(LockError::Io { path, source }),
        };
        let Some(record) = read_record(&path)? else {
            return Ok(ExistingLock::Vanished);
        };

        if record.run_id != run_id {
            return Err(LockError::Invalid {
                path,
                reason: format!(
                    "lock belongs to run '{}', expected '{}'",
                    record.run_id, run_id
                ),
            });
        }

        let age = record.heartbeat_age(now);
        if self.is_stale(age) {
            Ok(ExistingLock::Stale(record, identity, age.num_seconds()))
        } else {
            Ok(ExistingLock::Fresh(record, age.num_seconds()))
        }
    }

    /// Move a stale lock into the archive directory.
    ///
    /// Only the file observed as stale is moved: if the identity changed in
    /// the meantime another waiter already replaced it and nothing is done.
    fn archive(
        &self,
        record: &LockRecord,
        observed: FileIdentity,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        let path = self.lock_path();
        match FileIdentity::of(&path) {
            Ok(current) if current == observed => {}
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(LockError::Io { path, source }),
        }

        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir).map_err(|source| LockError::Io {
            path: archive_dir.clone(),
            source,
        })?;
        let target = archive_dir.join(format!(
            "{}.stale-{}-{}",
            LOCK_FILE_NAME,
            now.format("%Y%m%dT%H%M%S%.3fZ"),
            record.pid
        ));

        match fs::rename(&path, &target) {
            Ok(()) => {
                storage::sync_dir(&self.run_dir).map_err(lock_io)?;
                info!(archived = %target.display(), "Archived stale run lock");
                Ok(())
            }
            // Another waiter archived it first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = u64::try_from(self.settings.retry_base.as_millis()).unwrap_or(u64::MAX);
        let exp = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = if base == 0 {
            0
        } else {
            rand::rng().random_range(0..=base)
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>, LockError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| LockError::Invalid {
            path: path.to_path_buf(),
            reason: format!("unparseable lock record: {e}"),
        })
}

fn lock_io(err: StateError) -> LockError {
    match err {
        StateError::Io { path, source } => LockError::Io { path, source },
        other => LockError::Invalid {
            path: PathBuf::new(),
            reason: other.to_string(),
        },
    }
}
