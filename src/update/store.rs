//! SQLite persistence for known releases and the check-state singleton.
//!
//! The check lock is purely transactional: `acquire_due_lock` opens an
//! `IMMEDIATE` transaction with a zero busy-timeout, so a conflicting writer
//! surfaces as SQLITE_BUSY (`StoreError::LockUnavailable`) instead of
//! blocking. Killing the holder aborts the transaction and releases the lock
//! through the normal connection lifecycle; nothing survives a restart.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::update::error::StoreError;
use crate::update::version::RuntimeVersion;

/// The singleton check-state row. Mutated only while the check lock is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckState {
    pub last_checked: Option<DateTime<Utc>>,
    pub last_checked_by: Option<String>,
}

/// One known release of the runtime, keyed by its version string.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRecord {
    pub version: String,
    /// Free-text classification from the feed, e.g. "bug_fix". May be empty.
    pub level: String,
    pub date_released: DateTime<Utc>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub hidden_from_ui: bool,
    pub end_of_maintenance: Option<DateTime<Utc>>,
    pub end_of_basic_support: Option<DateTime<Utc>>,
    pub eom_dismissed_until: Option<DateTime<Utc>>,
    pub eobs_dismissed_until: Option<DateTime<Utc>>,
    pub yanked: Option<bool>,
}

impl ReleaseRecord {
    /// A visible record with every optional field unset.
    pub fn new(version: &str, level: &str, date_released: DateTime<Utc>) -> Self {
        Self {
            version: version.to_string(),
            level: level.to_string(),
            date_released,
            description: None,
            url: None,
            hidden_from_ui: false,
            end_of_maintenance: None,
            end_of_basic_support: None,
            eom_dismissed_until: None,
            eobs_dismissed_until: None,
            yanked: None,
        }
    }
}

const RELEASE_COLUMNS: &str = "version, level, date_released, description, url, hidden_from_ui, \
     end_of_maintenance, end_of_basic_support, eom_dismissed_until, eobs_dismissed_until, yanked";

pub struct ReleaseStore {
    conn: Mutex<Connection>,
}

impl ReleaseStore {
    /// Open (or create) the database file. Does not create tables; schema
    /// management happens through [`ReleaseStore::create_schema`] before the
    /// core starts.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("opening release store at {:?}", path);

        let conn = Connection::open(path)?;

        // WAL keeps status reads from blocking while a check transaction is
        // open on another connection.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // A conflicting lock must fail immediately, never wait.
        conn.busy_timeout(std::time::Duration::ZERO)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create both tables. The schema-management entry point, not called by
    /// the running core.
    pub async fn create_schema(&self) -> Result<(), StoreError> {
        debug!("creating update-check schema");

        let conn = self.conn.lock().await;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS version_check (
                singleton INTEGER NOT NULL PRIMARY KEY CHECK (singleton = 1),
                last_checked TEXT,
                last_checked_by TEXT
            );

            CREATE TABLE IF NOT EXISTS available_release (
                version TEXT NOT NULL PRIMARY KEY,
                level TEXT NOT NULL,
                date_released TEXT NOT NULL,
                description TEXT,
                url TEXT,
                hidden_from_ui INTEGER NOT NULL DEFAULT 0,
                end_of_maintenance TEXT,
                end_of_basic_support TEXT,
                eom_dismissed_until TEXT,
                eobs_dismissed_until TEXT,
                yanked INTEGER DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_available_release_hidden
                ON available_release (hidden_from_ui);
            "#,
        )?;

        Ok(())
    }

    /// Whether both tables exist. The core refuses to start without them.
    pub async fn tables_present(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('version_check', 'available_release')",
            [],
            |row| row.get(0),
        )?;
        Ok(count == 2)
    }

    /// Guarantee the singleton row exists. Losing an insert race to another
    /// process is success, not an error.
    pub async fn ensure_singleton(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO version_check (singleton) VALUES (1)",
            [],
        )?;
        Ok(())
    }

    /// Plain read of the check-state row, no locking.
    pub async fn get_singleton(&self) -> Result<CheckState, StoreError> {
        let conn = self.conn.lock().await;
        read_state(&conn)
    }

    /// Try to take the cluster-wide check lock if a check is due.
    ///
    /// Returns `None` when the row exists but the interval has not elapsed,
    /// and `StoreError::LockUnavailable` when another transaction holds the
    /// lock. A returned lease keeps the transaction (and therefore the lock)
    /// open until `commit` or drop.
    pub async fn acquire_due_lock(
        &self,
        interval: std::time::Duration,
    ) -> Result<Option<CheckLease<'_>>, StoreError> {
        let guard = self.conn.lock().await;

        match guard.execute_batch("BEGIN IMMEDIATE") {
            Ok(()) => {}
            Err(e) if is_lock_contention(&e) => return Err(StoreError::LockUnavailable),
            Err(e) => return Err(e.into()),
        }

        let state = match read_state(&guard) {
            Ok(state) => state,
            Err(e) => {
                let _ = guard.execute_batch("ROLLBACK");
                return Err(e);
            }
        };

        let due = match state.last_checked {
            None => true,
            Some(checked) => {
                checked <= Utc::now() - ChronoDuration::seconds(interval.as_secs() as i64)
            }
        };

        if !due {
            let _ = guard.execute_batch("ROLLBACK");
            return Ok(None);
        }

        Ok(Some(CheckLease {
            guard,
            state,
            open: true,
        }))
    }

    pub async fn upsert_release(&self, record: &ReleaseRecord) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        upsert_in(&conn, record)
    }

    pub async fn find_release(&self, version: &str) -> Result<Option<ReleaseRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                &format!("SELECT {RELEASE_COLUMNS} FROM available_release WHERE version = ?1"),
                [version],
                release_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All records an operator may be shown: not hidden, and yanked is
    /// null-or-false.
    pub async fn list_visible_releases(&self) -> Result<Vec<ReleaseRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELEASE_COLUMNS} FROM available_release
             WHERE hidden_from_ui = 0 AND (yanked IS NULL OR yanked = 0)"
        ))?;

        let releases = stmt
            .query_map([], release_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(releases)
    }

    /// Hide every release the running version supersedes (version less than
    /// or equal to `current`). Returns the number of rows hidden.
    pub async fn hide_versions_not_newer_than(
        &self,
        current: &RuntimeVersion,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let superseded = {
            let mut stmt =
                tx.prepare("SELECT version FROM available_release WHERE hidden_from_ui = 0")?;
            let versions = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut superseded = Vec::new();
            for version in versions {
                if &RuntimeVersion::parse(&version)? <= current {
                    superseded.push(version);
                }
            }
            superseded
        };

        for version in &superseded {
            tx.execute(
                "UPDATE available_release SET hidden_from_ui = 1 WHERE version = ?1",
                [version],
            )?;
        }

        tx.commit()?;
        Ok(superseded.len())
    }

    pub async fn set_eom_dismissed_until(
        &self,
        version: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE available_release SET eom_dismissed_until = ?2 WHERE version = ?1",
            params![version, until],
        )?;
        Ok(updated > 0)
    }

    pub async fn set_eobs_dismissed_until(
        &self,
        version: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE available_release SET eobs_dismissed_until = ?2 WHERE version = ?1",
            params![version, until],
        )?;
        Ok(updated > 0)
    }

    /// Clear `last_checked` so the next cycle runs immediately. Operator
    /// affordance, not used by the loop itself.
    pub async fn reset_last_checked(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE version_check SET last_checked = NULL WHERE singleton = 1",
            [],
        )?;
        Ok(())
    }
}

/// An open check transaction holding the cluster-wide update-check lock.
///
/// The lock lives exactly as long as the transaction: `commit` publishes the
/// cycle's writes and releases it; dropping the lease rolls back instead.
#[derive(Debug)]
pub struct CheckLease<'a> {
    guard: MutexGuard<'a, Connection>,
    state: CheckState,
    open: bool,
}

impl CheckLease<'_> {
    /// The check-state row as it was when the lock was taken.
    pub fn state(&self) -> &CheckState {
        &self.state
    }

    /// Write `last_checked`/`last_checked_by` inside the open transaction.
    /// Issued before any network I/O so the lock-holding intent is recorded
    /// while the lock stays held for the rest of the cycle.
    pub fn touch(&mut self, now: DateTime<Utc>, by: &str) -> Result<(), StoreError> {
        self.guard.execute(
            "UPDATE version_check SET last_checked = ?1, last_checked_by = ?2 WHERE singleton = 1",
            params![now, by],
        )?;
        self.state.last_checked = Some(now);
        self.state.last_checked_by = Some(by.to_string());
        Ok(())
    }

    /// Insert or merge a release within the check transaction. Returns true
    /// iff the version was not known before. Merging never clears stored
    /// dismissals, which only the operator writes.
    pub fn upsert_release(&mut self, record: &ReleaseRecord) -> Result<bool, StoreError> {
        upsert_in(&self.guard, record)
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.guard.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for CheckLease<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.guard.execute_batch("ROLLBACK") {
                warn!("failed to roll back abandoned check transaction: {e}");
            }
        }
    }
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn read_state(conn: &Connection) -> Result<CheckState, StoreError> {
    let state = conn.query_row(
        "SELECT last_checked, last_checked_by FROM version_check WHERE singleton = 1",
        [],
        |row| {
            Ok(CheckState {
                last_checked: row.get(0)?,
                last_checked_by: row.get(1)?,
            })
        },
    )?;
    Ok(state)
}

fn release_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReleaseRecord> {
    Ok(ReleaseRecord {
        version: row.get(0)?,
        level: row.get(1)?,
        date_released: row.get(2)?,
        description: row.get(3)?,
        url: row.get(4)?,
        hidden_from_ui: row.get(5)?,
        end_of_maintenance: row.get(6)?,
        end_of_basic_support: row.get(7)?,
        eom_dismissed_until: row.get(8)?,
        eobs_dismissed_until: row.get(9)?,
        yanked: row.get(10)?,
    })
}

fn upsert_in(conn: &Connection, record: &ReleaseRecord) -> Result<bool, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM available_release WHERE version = ?1)",
        [&record.version],
        |row| row.get(0),
    )?;

    if exists {
        conn.execute(
            "UPDATE available_release SET
                level = ?2, date_released = ?3, description = ?4, url = ?5,
                hidden_from_ui = ?6, end_of_maintenance = ?7,
                end_of_basic_support = ?8, yanked = ?9
             WHERE version = ?1",
            params![
                record.version,
                record.level,
                record.date_released,
                record.description,
                record.url,
                record.hidden_from_ui,
                record.end_of_maintenance,
                record.end_of_basic_support,
                record.yanked,
            ],
        )?;
        Ok(false)
    } else {
        conn.execute(
            &format!(
                "INSERT INTO available_release ({RELEASE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.version,
                record.level,
                record.date_released,
                record.description,
                record.url,
                record.hidden_from_ui,
                record.end_of_maintenance,
                record.end_of_basic_support,
                record.eom_dismissed_until,
                record.eobs_dismissed_until,
                record.yanked,
            ],
        )?;
        Ok(true)
    }
}
