use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection};

use super::{DestinationStore, DESTINATIONS_TABLE};
use crate::error::StoreError;
use crate::models::{Destination, Protocol};

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqlStore {
    conn: Mutex<Option<Connection>>,
}

impl SqlStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // In-memory databases answer "memory" here.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {DESTINATIONS_TABLE} (
                source_ip      TEXT NOT NULL,
                destination_ip TEXT,
                server_name    TEXT NOT NULL,
                protocol       TEXT NOT NULL,
                timestamp      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{DESTINATIONS_TABLE}_timestamp
                ON {DESTINATIONS_TABLE} (timestamp);"
        ))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {DESTINATIONS_TABLE}"), [], |row| {
            row.get(0)
        })?;
        Ok(n as u64)
    }
}

impl DestinationStore for SqlStore {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn record_destination(&self, destination: &Destination) -> Result<(), StoreError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            &format!(
                "INSERT INTO {DESTINATIONS_TABLE} (source_ip, destination_ip, server_name, protocol, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                destination.source_ip.to_string(),
                destination.destination_ip.map(|ip| ip.to_string()),
                destination.server_name,
                destination.protocol.as_str(),
                destination.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Destination>, StoreError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT source_ip, destination_ip, server_name, protocol, timestamp
             FROM {DESTINATIONS_TABLE} ORDER BY timestamp DESC, rowid DESC LIMIT ?1"
        ))?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let source: String = row.get(0)?;
            let destination: Option<String> = row.get(1)?;
            let protocol: String = row.get(3)?;
            let timestamp: String = row.get(4)?;

            Ok(Destination {
                protocol: convert(3, protocol.parse::<Protocol>())?,
                source_ip: convert(0, source.parse::<IpAddr>())?,
                destination_ip: destination
                    .map(|d| convert(1, d.parse::<IpAddr>()))
                    .transpose()?,
                server_name: row.get(2)?,
                timestamp: convert(4, DateTime::parse_from_rfc3339(&timestamp))?.with_timezone(&Utc),
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }
}

fn convert<T, E>(column: usize, value: Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    value.map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
