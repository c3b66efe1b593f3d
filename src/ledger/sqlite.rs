use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, PoisonError};

use crate::error::{PipelineError, PipelineResult};

use super::{AlertLedger, AlertRecord, AlertStatus};

/// SQLite-backed ledger. Survives restarts so Failed/Exhausted alerts can be re-sent
/// by an operator later.
pub struct SqliteAlertLedger {
    conn: Mutex<Connection>,
}

impl SqliteAlertLedger {
    pub fn open(db_path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(db_path)?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> PipelineResult<Self> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_schema(&self) -> PipelineResult<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS alert_records (
              alert_id TEXT PRIMARY KEY,
              event_id TEXT NOT NULL,
              status TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_status ON alert_records(status);
            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alert_records(created_at);
            "#,
        )?;
        Ok(())
    }

    fn query_records(
        &self,
        sql: &str,
        arg: rusqlite::types::Value,
    ) -> PipelineResult<Vec<AlertRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([arg], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for payload in rows {
            out.push(decode(&payload?)?);
        }
        Ok(out)
    }
}

fn to_i64(value: u64, what: &str) -> PipelineResult<i64> {
    i64::try_from(value).map_err(|_| PipelineError::Ledger(format!("{} exceeds i64 range", what)))
}

fn decode(payload: &str) -> PipelineResult<AlertRecord> {
    Ok(serde_json::from_str(payload)?)
}

impl AlertLedger for SqliteAlertLedger {
    fn upsert(&self, record: &AlertRecord) -> PipelineResult<()> {
        let payload_json = serde_json::to_string(record)?;
        let created_at = to_i64(record.created_at_ms, "created_at_ms")?;
        let updated_at = to_i64(record.updated_at_ms, "updated_at_ms")?;
        self.conn().execute(
            r#"
            INSERT INTO alert_records(alert_id, event_id, status, created_at, updated_at, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(alert_id) DO UPDATE SET
              status = excluded.status,
              updated_at = excluded.updated_at,
              payload_json = excluded.payload_json
            "#,
            params![
                record.alert_id,
                record.event_id.as_str(),
                record.status.as_str(),
                created_at,
                updated_at,
                payload_json
            ],
        )?;
        Ok(())
    }

    fn get(&self, alert_id: &str) -> PipelineResult<Option<AlertRecord>> {
        let payload: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload_json FROM alert_records WHERE alert_id = ?1",
                [alert_id],
                |row| row.get(0),
            )
            .optional()?;
        payload.as_deref().map(decode).transpose()
    }

    fn list_by_status(&self, status: AlertStatus) -> PipelineResult<Vec<AlertRecord>> {
        self.query_records(
            "SELECT payload_json FROM alert_records WHERE status = ?1 ORDER BY created_at, alert_id",
            rusqlite::types::Value::Text(status.as_str().to_string()),
        )
    }

    fn list_since(&self, since_ms: u64) -> PipelineResult<Vec<AlertRecord>> {
        self.query_records(
            "SELECT payload_json FROM alert_records WHERE created_at >= ?1 ORDER BY created_at, alert_id",
            rusqlite::types::Value::Integer(to_i64(since_ms, "since_ms")?),
        )
    }
}
