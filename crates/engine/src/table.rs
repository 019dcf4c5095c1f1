//! Data tables and the parallel row processor

use std::future::Future;

use futures::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{AccordError, AccordResult};

pub type RowData = Map<String, Value>;

/// Tabular step input, one map per row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataTable {
    rows: Vec<RowData>,
}

impl DataTable {
    pub fn new(rows: Vec<RowData>) -> Self {
        Self { rows }
    }

    /// Builds a table from a header line and string cells
    pub fn from_cells(headers: &[String], cells: Vec<Vec<String>>) -> AccordResult<Self> {
        let mut rows = Vec::with_capacity(cells.len());
        for (i, line) in cells.into_iter().enumerate() {
            if line.len() != headers.len() {
                return Err(AccordError::InvalidConfig(format!(
                    "Table row {} has {} cells but the header has {}",
                    i + 1,
                    line.len(),
                    headers.len()
                )));
            }
            rows.push(
                headers
                    .iter()
                    .cloned()
                    .zip(line.into_iter().map(Value::String))
                    .collect(),
            );
        }
        Ok(Self { rows })
    }

    /// Parses a pipe-delimited table, the first line being the header
    pub fn parse_pipe(text: &str) -> AccordResult<Self> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|line| {
                line.trim_matches('|')
                    .split('|')
                    .map(|cell| cell.trim().to_string())
                    .collect::<Vec<_>>()
            });
        let Some(headers) = lines.next() else {
            return Ok(Self::default());
        };
        Self::from_cells(&headers, lines.collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn raw_rows(&self) -> &[RowData] {
        &self.rows
    }

    /// Rows paired with their 0-based ordinal
    pub fn rows(&self) -> Vec<TableRow> {
        self.rows
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, data)| TableRow { index, data })
            .collect()
    }
}

/// One table row and its position in the table
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub index: usize,
    pub data: RowData,
}

impl TableRow {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    pub fn get_str(&self, column: &str) -> AccordResult<String> {
        match self.data.get(column) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => Err(AccordError::InvalidConfig(format!(
                "Table row {} has no value for column '{}'",
                self.index + 1,
                column
            ))),
            Some(other) => Ok(other.to_string()),
        }
    }

    /// Context variable name for this row, `prefix` followed by its 1-based position
    pub fn ordinal_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.index + 1)
    }

    /// Row as a JSON object with empty string cells set to null.
    ///
    /// With `nested`, string cells holding a JSON object or array are parsed.
    pub fn to_json(&self, nested: bool) -> Value {
        let object = self
            .data
            .iter()
            .map(|(column, value)| {
                let value = match value {
                    Value::String(s) if s.is_empty() => Value::Null,
                    Value::String(s) if nested && looks_like_json(s) => {
                        serde_json::from_str(s).unwrap_or_else(|_| value.clone())
                    }
                    other => other.clone(),
                };
                (column.clone(), value)
            })
            .collect();
        Value::Object(object)
    }
}

fn looks_like_json(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with('{') || s.starts_with('[')
}

/// Runs `action` for every row with at most `concurrency` rows in flight.
///
/// Rows complete in any order. A failing row does not cancel its siblings:
/// every row runs to completion, then all failures are reported together in
/// row order.
pub async fn process_rows<F, Fut>(table: &DataTable, concurrency: usize, action: F) -> AccordResult<()>
where
    F: Fn(TableRow) -> Fut,
    Fut: Future<Output = AccordResult<()>>,
{
    let total = table.len();
    debug!("Processing {} table rows, {} at a time", total, concurrency);

    let outcomes: Vec<(usize, AccordResult<()>)> = stream::iter(table.rows())
        .map(|row| {
            let index = row.index;
            action(row).map(move |result| (index, result))
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut failures: Vec<(usize, AccordError)> = outcomes
        .into_iter()
        .filter_map(|(index, result)| result.err().map(|e| (index, e)))
        .collect();
    if failures.is_empty() {
        return Ok(());
    }

    failures.sort_by_key(|(index, _)| *index);
    for (index, e) in &failures {
        warn!("Table row {} failed: {}", index + 1, e);
    }
    Err(AccordError::RowsFailed { total, failures })
}
