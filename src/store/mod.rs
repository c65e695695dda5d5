//! Durable Account Session records.
//!
//! One row per normalized account number holds the credential blob the
//! protocol layer needs to resume without re-pairing, the sparse config
//! override mapping and three timestamps. A second table keeps the list of
//! numbers that have completed pairing, used for bulk reconnection.
//!
//! Credential writes are conditional upserts keyed on the time the rotation
//! event was observed, so a late-arriving older update never replaces a newer
//! blob. Rows are independent: a failed write for one number never touches
//! another number's record.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;

use crate::db::{self, pool::DbPool};

/// Opaque structured secret material owned by the protocol layer.
pub type CredentialBlob = Value;

/// Sparse per-account config differing from the process-wide defaults.
pub type Overrides = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct AccountSession {
    pub number: String,
    pub creds: Option<CredentialBlob>,
    pub config: Overrides,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

pub struct CredentialStore {
    db: DbPool,
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_overrides(raw: &str) -> Overrides {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl CredentialStore {
    /// Open (creating if needed) the store and apply migrations.
    ///
    /// Any failure here is a startup failure: callers must not continue
    /// without a working store.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create db dir: {}", parent.display()))?;
            }
        }
        let path_str = path.to_str().context("database_path is not valid UTF-8")?;
        let db = DbPool::open(path_str, 4).context("failed to open session database")?;
        db::run_migrations(&db).context("failed to run session migrations")?;

        let store = Self { db };
        store.ping().context("session database is not readable")?;
        Ok(store)
    }

    pub fn ping(&self) -> anyhow::Result<()> {
        self.db.read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    pub fn get(&self, number: &str) -> anyhow::Result<Option<CredentialBlob>> {
        let raw: Option<Option<String>> = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT creds FROM sessions WHERE number = ?1",
                    [number],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match raw.flatten() {
            Some(text) => {
                let blob = serde_json::from_str(&text)
                    .with_context(|| format!("corrupt credential blob for {number}"))?;
                Ok(Some(blob))
            }
            None => Ok(None),
        }
    }

    /// Insert-or-update the credential blob observed at `observed_at`.
    ///
    /// Returns `false` when a newer blob is already stored and this write was
    /// discarded.
    pub fn put(
        &self,
        number: &str,
        creds: &CredentialBlob,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let text = serde_json::to_string(creds)?;
        let at = millis(observed_at);
        let changed = self.db.write(|conn| {
            Ok(conn.execute(
                "INSERT INTO sessions (number, creds, creds_at, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '{}', ?3, ?3)
                 ON CONFLICT(number) DO UPDATE SET
                     creds = excluded.creds,
                     creds_at = excluded.creds_at,
                     updated_at = MAX(sessions.updated_at, excluded.updated_at)
                 WHERE sessions.creds_at IS NULL OR excluded.creds_at >= sessions.creds_at",
                params![number, text, at],
            )?)
        })?;
        Ok(changed > 0)
    }

    /// Remove the Account Session record. Returns whether a row existed.
    pub fn delete(&self, number: &str) -> anyhow::Result<bool> {
        let removed = self.db.write(|conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE number = ?1", [number])?)
        })?;
        Ok(removed > 0)
    }

    pub fn load(&self, number: &str) -> anyhow::Result<Option<AccountSession>> {
        let row = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT number, creds, config, created_at, updated_at, last_active
                     FROM sessions WHERE number = ?1",
                    [number],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some((number, creds, config, created_at, updated_at, last_active)) = row else {
            return Ok(None);
        };
        let creds = match creds {
            Some(text) => Some(
                serde_json::from_str(&text)
                    .with_context(|| format!("corrupt credential blob for {number}"))?,
            ),
            None => None,
        };
        Ok(Some(AccountSession {
            number,
            creds,
            config: parse_overrides(&config),
            created_at: from_millis(created_at),
            updated_at: from_millis(updated_at),
            last_active: last_active.map(from_millis),
        }))
    }

    /// Numbers of every stored Account Session, most recently updated first.
    pub fn numbers(&self) -> anyhow::Result<Vec<String>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT number FROM sessions ORDER BY updated_at DESC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Numbers whose record has not been updated since `cutoff`.
    pub fn stale_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT number FROM sessions WHERE updated_at < ?1 ORDER BY updated_at ASC",
            )?;
            let rows = stmt
                .query_map([millis(cutoff)], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The override mapping, or `None` when no record exists.
    pub fn overrides(&self, number: &str) -> anyhow::Result<Option<Overrides>> {
        let raw: Option<String> = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT config FROM sessions WHERE number = ?1",
                    [number],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(raw.map(|text| parse_overrides(&text)))
    }

    /// Upsert the override mapping, refreshing `updated_at`.
    pub fn put_overrides(&self, number: &str, overrides: &Overrides) -> anyhow::Result<()> {
        let text = serde_json::to_string(overrides)?;
        let now = millis(Utc::now());
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO sessions (number, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(number) DO UPDATE SET
                     config = excluded.config,
                     updated_at = MAX(sessions.updated_at, excluded.updated_at)",
                params![number, text, now],
            )?;
            Ok(())
        })
    }

    /// Make sure a record exists without touching an existing one's data.
    pub fn ensure_record(&self, number: &str) -> anyhow::Result<()> {
        let now = millis(Utc::now());
        self.db.write(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (number, config, created_at, updated_at)
                 VALUES (?1, '{}', ?2, ?2)",
                params![number, now],
            )?;
            Ok(())
        })
    }

    pub fn touch_active(&self, number: &str) -> anyhow::Result<()> {
        let now = millis(Utc::now());
        self.db.write(|conn| {
            conn.execute(
                "UPDATE sessions SET last_active = ?2 WHERE number = ?1",
                params![number, now],
            )?;
            Ok(())
        })
    }

    // ── Known numbers ──────────────────────────────────────────────────────

    pub fn add_known(&self, number: &str) -> anyhow::Result<()> {
        let now = millis(Utc::now());
        self.db.write(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO known_numbers (number, added_at) VALUES (?1, ?2)",
                params![number, now],
            )?;
            Ok(())
        })
    }

    pub fn remove_known(&self, number: &str) -> anyhow::Result<()> {
        self.db.write(|conn| {
            conn.execute("DELETE FROM known_numbers WHERE number = ?1", [number])?;
            Ok(())
        })
    }

    pub fn known_numbers(&self) -> anyhow::Result<Vec<String>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT number FROM known_numbers ORDER BY added_at ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete the record and forget the number.
    pub fn purge(&self, number: &str) -> anyhow::Result<bool> {
        let existed = self.delete(number)?;
        self.remove_known(number)?;
        Ok(existed)
    }
}
