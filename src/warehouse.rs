//! Relational load of staged enrichment records.
//!
//! Schema creation is idempotent. Row loading is one transaction per call:
//! either every staged row commits or none do. In [`LoadMode::Append`] a
//! repeated load of the same artifact appends duplicate rows.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};

use crate::classify::ContentCategory;
use crate::config::WarehouseSettings;
use crate::detect::DetectionSet;
use crate::enrich::EnrichmentRecord;
use crate::error::PipelineError;
use crate::staging::{validate_record, StagedRowError, StagedRows};

/// How staged rows meet rows already in the table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Insert every row; reruns duplicate rows.
    #[default]
    Append,
    /// Replace rows with the same `(message_id, image_path)` before insert.
    Upsert,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Append => f.write_str("append"),
            LoadMode::Upsert => f.write_str("upsert"),
        }
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(LoadMode::Append),
            "upsert" => Ok(LoadMode::Upsert),
            other => Err(format!("unknown load mode '{}' (expected append|upsert)", other)),
        }
    }
}

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static table name regex")
    })
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> anyhow::Result<()> {
    if table_name_pattern().is_match(table) {
        Ok(())
    } else {
        Err(anyhow!(
            "warehouse table '{}' must be a plain SQL identifier",
            table
        ))
    }
}

pub(crate) fn open_db_connection(db_path: &str) -> rusqlite::Result<Connection> {
    if db_path.starts_with("file:") {
        return Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        );
    }
    Connection::open(db_path)
}

/// A row as stored in the warehouse.
#[derive(Clone, Debug, PartialEq)]
pub struct WarehouseRow {
    pub id: i64,
    pub record: EnrichmentRecord,
    pub load_ts: String,
}

pub struct WarehouseLoader {
    conn: Connection,
    table: String,
    mode: LoadMode,
}

impl WarehouseLoader {
    /// Open the configured database and make sure the target table exists.
    pub fn open(settings: &WarehouseSettings) -> Result<Self, PipelineError> {
        let schema_err = |source| PipelineError::Schema {
            table: settings.table.clone(),
            source,
        };
        if settings.db_path != ":memory:" && !settings.db_path.starts_with("file:") {
            if let Some(parent) = Path::new(&settings.db_path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
            {
                std::fs::create_dir_all(parent).map_err(|source| {
                    PipelineError::WarehouseSetup {
                        path: parent.to_path_buf(),
                        source,
                    }
                })?;
            }
        }
        let conn = open_db_connection(&settings.db_path).map_err(schema_err)?;
        Self::from_connection(conn, &settings.table, settings.mode)
    }

    pub fn from_connection(
        conn: Connection,
        table: &str,
        mode: LoadMode,
    ) -> Result<Self, PipelineError> {
        validate_table_name(table).map_err(|e| PipelineError::Config(e.to_string()))?;
        let loader = Self {
            conn,
            table: table.to_string(),
            mode,
        };
        loader.ensure_schema()?;
        Ok(loader)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    fn ensure_schema(&self) -> Result<(), PipelineError> {
        let table = &self.table;
        self.conn
            .execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  message_id INTEGER NOT NULL,
                  image_path TEXT,
                  detected_class TEXT,
                  confidence_score REAL,
                  image_category TEXT NOT NULL,
                  all_detections TEXT NOT NULL,
                  processed_at TEXT NOT NULL,
                  load_ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE INDEX IF NOT EXISTS idx_{table}_confidence ON {table}(confidence_score);
                CREATE INDEX IF NOT EXISTS idx_{table}_category ON {table}(image_category);
                CREATE INDEX IF NOT EXISTS idx_{table}_message ON {table}(message_id);
                "#
            ))
            .map_err(|source| PipelineError::Schema {
                table: table.clone(),
                source,
            })
    }

    /// Load a staging artifact in a single transaction. Returns rows inserted.
    pub fn load(&mut self, artifact: &Path) -> Result<usize, PipelineError> {
        let rows = StagedRows::open(artifact)?;
        let count = self.load_rows(rows)?;
        log::info!(
            "loaded {} record(s) from {} into {} ({} mode)",
            count,
            artifact.display(),
            self.table,
            self.mode
        );
        Ok(count)
    }

    /// Load an in-memory batch through the same transactional path.
    pub fn load_records(&mut self, records: &[EnrichmentRecord]) -> Result<usize, PipelineError> {
        let rows = records.iter().enumerate().map(|(idx, record)| {
            validate_record(record)
                .map(|()| record.clone())
                .map_err(|message| StagedRowError {
                    line: idx + 1,
                    message,
                })
        });
        self.load_rows(rows)
    }

    fn load_rows<I>(&mut self, rows: I) -> Result<usize, PipelineError>
    where
        I: Iterator<Item = Result<EnrichmentRecord, StagedRowError>>,
    {
        let table = self.table.clone();
        let mode = self.mode;
        let tx = self
            .conn
            .transaction()
            .map_err(|e| PipelineError::load(&table, e))?;

        let mut count = 0usize;
        {
            let mut insert = tx
                .prepare(&format!(
                    r#"
                    INSERT INTO {table}(message_id, image_path, detected_class, confidence_score,
                                        image_category, all_detections, processed_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#
                ))
                .map_err(|e| PipelineError::load(&table, e))?;
            let mut delete = tx
                .prepare(&format!(
                    "DELETE FROM {table} WHERE message_id = ?1 AND image_path = ?2"
                ))
                .map_err(|e| PipelineError::load(&table, e))?;

            for row in rows {
                // Any early return drops `tx`, which rolls back.
                let record = row.map_err(|e| {
                    PipelineError::load(&table, format!("row {}: {}", e.line, e.message))
                })?;
                let all_detections = record
                    .all_detections
                    .to_json()
                    .map_err(|e| PipelineError::load(&table, e))?;
                if mode == LoadMode::Upsert {
                    delete
                        .execute(params![record.message_id, record.image_path])
                        .map_err(|e| PipelineError::load(&table, e))?;
                }
                insert
                    .execute(params![
                        record.message_id,
                        record.image_path,
                        record.detected_class,
                        record.confidence_score,
                        record.image_category.as_str(),
                        all_detections,
                        record
                            .processed_at
                            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    ])
                    .map_err(|e| PipelineError::load(&table, e))?;
                count += 1;
            }
        }

        tx.commit().map_err(|e| PipelineError::load(&table, e))?;
        Ok(count)
    }

    pub fn row_count(&self) -> Result<usize, PipelineError> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })
            .map_err(|source| self.query_err(source))?;
        Ok(count as usize)
    }

    /// Rows ordered by confidence, highest first, null confidences last.
    pub fn top_by_confidence(&self, limit: usize) -> Result<Vec<WarehouseRow>, PipelineError> {
        self.select(
            "ORDER BY confidence_score IS NULL, confidence_score DESC, id ASC LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn by_category(
        &self,
        category: ContentCategory,
    ) -> Result<Vec<WarehouseRow>, PipelineError> {
        self.select(
            "WHERE image_category = ?1 ORDER BY id ASC",
            params![category.as_str()],
        )
    }

    fn select(
        &self,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<WarehouseRow>, PipelineError> {
        let sql = format!(
            r#"
            SELECT id, message_id, image_path, detected_class, confidence_score,
                   image_category, all_detections, processed_at, load_ts
            FROM {} {}
            "#,
            self.table, clause
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|source| self.query_err(source))?;
        let rows = stmt
            .query_map(params, read_row)
            .map_err(|source| self.query_err(source))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|source| self.query_err(source))
    }

    fn query_err(&self, source: rusqlite::Error) -> PipelineError {
        PipelineError::Query {
            table: self.table.clone(),
            source,
        }
    }
}

fn conversion_err(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<WarehouseRow> {
    let category: String = row.get(5)?;
    let detections: String = row.get(6)?;
    let processed_at: String = row.get(7)?;

    let image_category = category
        .parse::<ContentCategory>()
        .map_err(|e| conversion_err(5, e))?;
    let all_detections = DetectionSet::from_json(&detections).map_err(|e| conversion_err(6, e))?;
    let processed_at = DateTime::parse_from_rfc3339(&processed_at)
        .map_err(|e| conversion_err(7, e))?
        .with_timezone(&Utc);

    Ok(WarehouseRow {
        id: row.get(0)?,
        record: EnrichmentRecord {
            message_id: row.get(1)?,
            image_path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            detected_class: row.get(3)?,
            confidence_score: row.get(4)?,
            image_category,
            all_detections,
            processed_at,
        },
        load_ts: row.get(8)?,
    })
}
