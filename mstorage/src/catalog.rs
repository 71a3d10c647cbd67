use crate::config::StorageConfig;
use crate::errors::Result;
use crate::models::{ApiBudget, RecordProgress, RecordState};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.catalog_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS record_state (
                source_id INTEGER PRIMARY KEY,
                destination_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS api_budget (
                api_endpoint TEXT PRIMARY KEY,
                requests_left INTEGER NOT NULL,
                reset_time INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_logs (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                status TEXT,
                details TEXT
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn get_record(&self, source_id: u64) -> Result<Option<RecordProgress>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source_id, destination_id, state, updated_at FROM record_state WHERE source_id = ?1",
        )?;
        let mut rows = stmt.query(params![source_id as i64])?;

        if let Some(row) = rows.next()? {
            let state: String = row.get(2)?;
            Ok(Some(RecordProgress {
                source_id: row.get::<_, i64>(0)? as u64,
                destination_id: row.get::<_, i64>(1)? as u64,
                state: state.parse()?,
                updated_at: row.get(3)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Moves a record forward to `state`. A request to move backwards leaves
    /// the stored state untouched; the effective state is returned.
    pub fn advance_record(
        &self,
        source_id: u64,
        destination_id: u64,
        state: RecordState,
    ) -> Result<RecordState> {
        let current = self.get_record(source_id)?;
        let effective = match current {
            Some(ref progress) if progress.state > state => progress.state,
            _ => state,
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO record_state (source_id, destination_id, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_id) DO UPDATE SET
                destination_id = excluded.destination_id,
                state = excluded.state,
                updated_at = excluded.updated_at",
            params![
                source_id as i64,
                destination_id as i64,
                effective.as_str(),
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(effective)
    }

    pub fn records_in_state(&self, state: RecordState) -> Result<Vec<RecordProgress>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source_id, destination_id, updated_at FROM record_state
             WHERE state = ?1 ORDER BY source_id",
        )?;
        let rows = stmt.query_map(params![state.as_str()], |row| {
            Ok(RecordProgress {
                source_id: row.get::<_, i64>(0)? as u64,
                destination_id: row.get::<_, i64>(1)? as u64,
                state,
                updated_at: row.get(2)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_api_budget(&self, endpoint: &str) -> Result<Option<ApiBudget>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT api_endpoint, requests_left, reset_time FROM api_budget WHERE api_endpoint = ?1",
        )?;
        let mut rows = stmt.query(params![endpoint])?;

        if let Some(row) = rows.next()? {
            Ok(Some(ApiBudget {
                api_endpoint: row.get(0)?,
                requests_left: row.get(1)?,
                reset_time: row.get(2)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn upsert_api_budget(&self, budget: &ApiBudget) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO api_budget (api_endpoint, requests_left, reset_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(api_endpoint) DO UPDATE SET
                requests_left = excluded.requests_left,
                reset_time = excluded.reset_time",
            params![budget.api_endpoint, budget.requests_left, budget.reset_time],
        )?;
        Ok(())
    }

    pub fn create_task_log(&self, task_name: &str) -> Result<i64> {
        let conn = self.conn();
        let start_time = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO task_logs (task_name, start_time, status) VALUES (?1, ?2, 'RUNNING')",
            params![task_name, start_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_task_log_status(&self, task_id: i64, status: &str, details: &str) -> Result<()> {
        let conn = self.conn();
        let end_time = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE task_logs SET status = ?1, details = ?2, end_time = ?3 WHERE task_id = ?4",
            params![status, details, end_time, task_id],
        )?;
        Ok(())
    }
}
