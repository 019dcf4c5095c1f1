//! SQL fixture
//!
//! One long-lived connection per logical database. The connection is opened
//! without the create flag, so connecting waits for the service under test to
//! have created the file.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::{Map, Number, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{AccordError, AccordResult};
use crate::table::DataTable;

/// Handle to a logical database, cheap to clone
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    id: String,
    conn: Mutex<Connection>,
    key_tables: Vec<String>,
    /// Built on first use, the table list does not change during a run
    truncate_sql: Mutex<Option<String>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        info!("Closing database {}", self.id);
    }
}

impl Database {
    /// Opens the database, retrying with a fixed pause
    pub async fn connect(config: &DatabaseConfig) -> AccordResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let attempts = config.retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Connection::open_with_flags(&config.path, flags) {
                Ok(conn) => {
                    info!("Connected to database {} at {:?}", config.id, config.path);
                    return Ok(Self::from_connection(&config.id, conn, config.key_tables.clone()));
                }
                Err(e) => {
                    warn!(
                        "Connecting to database {} failed (attempt {}/{}): {}",
                        config.id, attempt, attempts, e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                sleep(config.retry_pause()).await;
            }
        }

        Err(AccordError::ConnectFailed {
            target: format!("database {}", config.id),
            attempts,
            reason: last_error,
        })
    }

    /// In-memory database
    pub fn open_memory(id: &str, key_tables: Vec<String>) -> AccordResult<Self> {
        Ok(Self::from_connection(id, Connection::open_in_memory()?, key_tables))
    }

    fn from_connection(id: &str, conn: Connection, key_tables: Vec<String>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                id: id.to_string(),
                conn: Mutex::new(conn),
                key_tables,
                truncate_sql: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Runs one or more statements
    pub fn execute(&self, sql: &str) -> AccordResult<()> {
        debug!("[{}] {}", self.inner.id, sql);
        self.inner.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Inserts one row per table row; empty cells become NULL
    pub fn insert_rows(&self, table: &str, rows: &DataTable) -> AccordResult<usize> {
        let conn = self.inner.conn.lock();
        let mut inserted = 0;
        for row in rows.rows() {
            let data = row.to_json(false);
            let Value::Object(columns) = data else {
                continue;
            };
            if columns.is_empty() {
                continue;
            }
            let names: Vec<String> = columns.keys().map(|c| quote_identifier(c)).collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_identifier(table),
                names.join(", "),
                placeholders.join(", ")
            );
            inserted += conn.execute(&sql, params_from_iter(columns.values().map(to_sql)))?;
        }
        debug!("[{}] Inserted {} row(s) into {}", self.inner.id, inserted, table);
        Ok(inserted)
    }

    /// Deletes every row of every table, key tables first
    pub fn truncate_all_tables(&self) -> AccordResult<()> {
        let conn = self.inner.conn.lock();
        let mut cached = self.inner.truncate_sql.lock();
        let sql = match cached.as_ref() {
            Some(sql) => sql.clone(),
            None => {
                let sql = build_truncate_sql(&conn, &self.inner.key_tables)?;
                *cached = Some(sql.clone());
                sql
            }
        };
        conn.execute_batch(&sql)?;
        debug!("[{}] Truncated all tables", self.inner.id);
        Ok(())
    }

    /// Query result as a JSON array of row objects
    pub fn query_json(&self, sql: &str) -> AccordResult<Value> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (i, name) in names.iter().enumerate() {
                object.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }
        Ok(Value::Array(out))
    }
}

fn build_truncate_sql(conn: &Connection, key_tables: &[String]) -> AccordResult<String> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let ordered = key_tables
        .iter()
        .filter(|t| tables.contains(t))
        .chain(tables.iter().filter(|t| !key_tables.contains(t)));
    Ok(ordered
        .map(|t| format!("DELETE FROM {};", quote_identifier(t)))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{:02x}", byte)).collect()),
    }
}
