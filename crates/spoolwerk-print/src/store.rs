// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent printer state backed by SQLite.
//
// Each printer's `PrinterConfig` is stored as a JSON document keyed by its
// printer id.  The config carries everything that must survive a restart:
// identity, limits, supplies, listener settings and the next job id, so job
// ids are never reused across restarts.

use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{debug, info, instrument};

use spoolwerk_core::config::PrinterConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};

/// SQLite schema for the printers table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS printers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        config TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// All methods are synchronous because `rusqlite` does not support async;
/// in an async context wrap calls in `tokio::task::spawn_blocking`.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) the state database at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SpoolwerkError::Database(format!("open: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SpoolwerkError::Database(format!("WAL pragma: {e}")))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| SpoolwerkError::Database(format!("create table: {e}")))?;

        info!("state database opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SpoolwerkError::Database(format!("open in-memory: {e}")))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| SpoolwerkError::Database(format!("create table: {e}")))?;

        debug!("in-memory state database opened");
        Ok(Self { conn })
    }

    /// Insert or replace a printer's configuration.
    #[instrument(skip(self, config), fields(printer = config.printer_id))]
    pub fn save_printer(&self, config: &PrinterConfig) -> Result<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| SpoolwerkError::Database(format!("serialize printer: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO printers (id, name, config, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    config = excluded.config,
                    updated_at = excluded.updated_at",
                params![
                    config.printer_id,
                    config.name,
                    json,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| SpoolwerkError::Database(format!("save printer: {e}")))?;
        debug!("printer state saved");
        Ok(())
    }

    /// All stored printers, ordered by id.
    #[instrument(skip(self))]
    pub fn load_printers(&self) -> Result<Vec<PrinterConfig>> {
        let mut stmt = self
            .conn
            .prepare("SELECT config FROM printers ORDER BY id")
            .map_err(|e| SpoolwerkError::Database(format!("prepare load: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| SpoolwerkError::Database(format!("query printers: {e}")))?;

        let mut printers = Vec::new();
        for row in rows {
            let json = row.map_err(|e| SpoolwerkError::Database(format!("read row: {e}")))?;
            let config: PrinterConfig = serde_json::from_str(&json)
                .map_err(|e| SpoolwerkError::Database(format!("deserialize printer: {e}")))?;
            printers.push(config);
        }
        debug!(count = printers.len(), "printers loaded");
        Ok(printers)
    }

    /// Remove a printer.  Returns whether it existed.
    #[instrument(skip(self))]
    pub fn delete_printer(&self, printer_id: u32) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM printers WHERE id = ?1", params![printer_id])
            .map_err(|e| SpoolwerkError::Database(format!("delete printer: {e}")))?;
        Ok(removed > 0)
    }

    /// One past the highest stored printer id.
    pub fn next_printer_id(&self) -> Result<u32> {
        self.conn
            .query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM printers", [], |row| {
                row.get::<_, u32>(0)
            })
            .map_err(|e| SpoolwerkError::Database(format!("next printer id: {e}")))
    }
}
