use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use std::path::Path;
use tracing::debug;

/// SQLite-backed persistent store for memory entries, tasks, and the code
/// execution audit log.
///
/// One connection behind a `std::sync::Mutex`; all operations are short
/// transactions, so contention stays negligible. `put` is atomic via
/// `INSERT ... ON CONFLICT`, and list operations are range scans over the
/// primary key.
pub struct SqliteStore {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_entries (
                scope_kind TEXT NOT NULL,
                owner      TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                entry_type TEXT NOT NULL DEFAULT 'text',
                metadata   TEXT NOT NULL DEFAULT '{}',
                expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope_kind, owner, key)
            );
            CREATE TABLE IF NOT EXISTS tasks (
                task_id      TEXT PRIMARY KEY,
                channel_id   TEXT NOT NULL,
                payload      TEXT NOT NULL,
                status       TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_channel ON tasks (channel_id, status);
            CREATE TABLE IF NOT EXISTS code_executions (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id       TEXT NOT NULL,
                channel_id     TEXT NOT NULL,
                code_hash      TEXT NOT NULL,
                language       TEXT NOT NULL,
                success        INTEGER NOT NULL,
                execution_ms   INTEGER NOT NULL,
                memory_limit_mb INTEGER NOT NULL,
                timed_out      INTEGER NOT NULL,
                error          TEXT,
                executed_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_code_exec_agent ON code_executions (agent_id, executed_at);",
        )
        .context("failed to initialize store schema")?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn put_entry(
        &self,
        scope_kind: &str,
        owner: &str,
        key: &str,
        value: &str,
        entry_type: &str,
        metadata: &str,
        expires_at: Option<&str>,
        now: &str,
    ) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        conn.execute(
            "INSERT INTO memory_entries
                 (scope_kind, owner, key, value, entry_type, metadata, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (scope_kind, owner, key) DO UPDATE SET
                 value = excluded.value,
                 entry_type = excluded.entry_type,
                 metadata = excluded.metadata,
                 expires_at = excluded.expires_at,
                 updated_at = excluded.updated_at",
            params![scope_kind, owner, key, value, entry_type, metadata, expires_at, now],
        )
        .context("failed to put memory entry")?;
        Ok(())
    }

    /// Returns `(value, entry_type, metadata, expires_at)`.
    pub fn get_entry(
        &self,
        scope_kind: &str,
        owner: &str,
        key: &str,
    ) -> Result<Option<(String, String, String, Option<String>)>> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT value, entry_type, metadata, expires_at FROM memory_entries
             WHERE scope_kind = ?1 AND owner = ?2 AND key = ?3",
        )?;
        let mut rows = stmt.query(params![scope_kind, owner, key])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))),
            None => Ok(None),
        }
    }

    /// Idempotent: deleting a missing key is a no-op. Returns whether a row
    /// was removed.
    pub fn delete_entry(&self, scope_kind: &str, owner: &str, key: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let affected = conn.execute(
            "DELETE FROM memory_entries WHERE scope_kind = ?1 AND owner = ?2 AND key = ?3",
            params![scope_kind, owner, key],
        )?;
        Ok(affected > 0)
    }

    /// Range scan over one `(scope_kind, owner)` prefix; keys only.
    pub fn list_keys(&self, scope_kind: &str, owner: &str) -> Result<Vec<String>> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT key FROM memory_entries
             WHERE scope_kind = ?1 AND owner = ?2 ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![scope_kind, owner], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Drop entries whose `expires_at` is in the past. Returns the count.
    pub fn sweep_expired(&self, now: &str) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let affected = conn.execute(
            "DELETE FROM memory_entries WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        if affected > 0 {
            debug!("store: swept {} expired memory entries", affected);
        }
        Ok(affected)
    }

    pub fn put_task(
        &self,
        task_id: &str,
        channel_id: &str,
        payload: &str,
        status: &str,
        now: &str,
    ) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        conn.execute(
            "INSERT INTO tasks (task_id, channel_id, payload, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (task_id) DO UPDATE SET
                 payload = excluded.payload,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
            params![task_id, channel_id, payload, status, now],
        )
        .context("failed to put task")?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT payload FROM tasks WHERE task_id = ?1")?;
        let mut rows = stmt.query(params![task_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn list_tasks(&self, channel_id: &str) -> Result<Vec<String>> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT payload FROM tasks WHERE channel_id = ?1 ORDER BY updated_at",
        )?;
        let payloads = stmt
            .query_map(params![channel_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(payloads)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_execution(
        &self,
        agent_id: &str,
        channel_id: &str,
        code_hash: &str,
        language: &str,
        success: bool,
        execution_ms: u64,
        memory_limit_mb: u64,
        timed_out: bool,
        error: Option<&str>,
        executed_at: &str,
    ) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        conn.execute(
            "INSERT INTO code_executions
                 (agent_id, channel_id, code_hash, language, success, execution_ms,
                  memory_limit_mb, timed_out, error, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                agent_id,
                channel_id,
                code_hash,
                language,
                success,
                execution_ms as i64,
                memory_limit_mb as i64,
                timed_out,
                error,
                executed_at
            ],
        )
        .context("failed to record code execution")?;
        Ok(())
    }

    pub fn execution_count(&self, agent_id: &str) -> Result<u64> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM code_executions WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
