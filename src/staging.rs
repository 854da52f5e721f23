// Tables are exclusive to one task by convention. Concurrent tasks must
// stage into distinct table names; nothing here locks a table for a task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::domain::{ColumnMapping, LogicalField, RawRecord};
use crate::error::HarvestError;

pub const TABLE_PLACEHOLDER: &str = "{table}";
pub const WRITE_BATCH_SIZE: usize = 1000;
pub const READ_BATCH_SIZE: usize = 5000;

pub const STAGED_FIELD_COUNT: usize = LogicalField::ALL.len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    table: String,
    columns: Vec<String>,
    statement: String,
}

impl InsertPlan {
    pub fn new(table: &str) -> Result<Self, HarvestError> {
        let columns = LogicalField::ALL
            .iter()
            .map(|field| field.column_name().to_string())
            .collect::<Vec<_>>();
        Self::with_columns(table, columns)
    }

    pub fn with_columns(table: &str, columns: Vec<String>) -> Result<Self, HarvestError> {
        validate_identifier(table)?;
        for column in &columns {
            validate_identifier(column)?;
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let statement = format!(
            "INSERT INTO {TABLE_PLACEHOLDER} ({}) VALUES ({placeholders}) ON CONFLICT DO NOTHING",
            columns.join(", ")
        );
        Ok(Self {
            table: table.to_string(),
            columns,
            statement,
        })
    }

    pub fn with_statement(mut self, statement: &str) -> Self {
        self.statement = statement.to_string();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn statement(&self) -> String {
        self.statement.replace(TABLE_PLACEHOLDER, &self.table)
    }

    pub fn parameter_count(&self) -> usize {
        self.statement.matches('?').count()
    }

    /// Bound parameters, declared columns and the expected bound must all
    /// agree. Checked before any row is read or written.
    pub fn validate(&self, expected: usize) -> Result<(), HarvestError> {
        let parameters = self.parameter_count();
        let columns = self.columns.len();
        if parameters != expected || parameters != columns {
            return Err(HarvestError::ParameterMismatch {
                table: self.table.clone(),
                parameters,
                columns,
                expected,
            });
        }
        Ok(())
    }

    pub fn read_mapping(&self) -> ColumnMapping {
        ColumnMapping::fixed(&LogicalField::ALL[..self.columns.len().min(STAGED_FIELD_COUNT)])
    }
}

fn validate_identifier(name: &str) -> Result<(), HarvestError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|ch| ch.is_ascii_alphabetic() || ch == '_')
            .unwrap_or(false)
        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if !valid {
        return Err(HarvestError::Config(format!("invalid SQL identifier: {name}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertStats {
    pub inserted: usize,
    pub ignored: usize,
    pub batches: usize,
}

/// Insertion sequence and values in column order. `None` is a field the
/// row's source never carried, kept apart from an empty value.
pub type StagedRow = (i64, Vec<Option<String>>);

pub trait StagingStore: Send + Sync {
    fn ensure_table(&self, plan: &InsertPlan) -> Result<(), HarvestError>;

    fn reset(&self, table: &str) -> Result<(), HarvestError>;

    fn insert_batch(
        &self,
        plan: &InsertPlan,
        rows: &[Vec<Option<String>>],
    ) -> Result<InsertStats, HarvestError>;

    fn read_batch(
        &self,
        plan: &InsertPlan,
        after: i64,
        limit: usize,
    ) -> Result<Vec<StagedRow>, HarvestError>;
}

/// Inserts `records` in batches of `batch_size`, flushing every full batch
/// and once more at the end of the stream.
pub fn bulk_insert<S, I>(
    store: &S,
    plan: &InsertPlan,
    records: I,
    batch_size: usize,
) -> Result<InsertStats, HarvestError>
where
    S: StagingStore + ?Sized,
    I: IntoIterator<Item = Result<RawRecord, HarvestError>>,
{
    plan.validate(STAGED_FIELD_COUNT)?;
    let batch_size = batch_size.max(1);

    let mut totals = InsertStats::default();
    let mut batch = Vec::with_capacity(batch_size);
    for record in records {
        let record = record?;
        batch.push(
            LogicalField::ALL
                .iter()
                .map(|field| record.field(*field).map(str::to_string))
                .collect::<Vec<_>>(),
        );
        if batch.len() == batch_size {
            accumulate(&mut totals, store.insert_batch(plan, &batch)?);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        accumulate(&mut totals, store.insert_batch(plan, &batch)?);
    }

    debug!(
        table = plan.table(),
        inserted = totals.inserted,
        ignored = totals.ignored,
        batches = totals.batches,
        "staging finished"
    );
    Ok(totals)
}

fn accumulate(totals: &mut InsertStats, batch: InsertStats) {
    totals.inserted += batch.inserted;
    totals.ignored += batch.ignored;
    totals.batches += batch.batches;
}

/// Streams staged rows back as [`RawRecord`]s, `READ_BATCH_SIZE` at a time.
/// A row's mapping leaves out the fields stored as NULL, so the result does
/// not depend on which run filled the table.
pub struct StagedRecords<'s, S: StagingStore + ?Sized> {
    store: &'s S,
    plan: InsertPlan,
    mapping: ColumnMapping,
    mappings: HashMap<Vec<usize>, Arc<ColumnMapping>>,
    buffer: std::vec::IntoIter<StagedRow>,
    last: i64,
    exhausted: bool,
}

impl<'s, S: StagingStore + ?Sized> StagedRecords<'s, S> {
    pub fn new(store: &'s S, plan: InsertPlan) -> Self {
        let mapping = plan.read_mapping();
        Self {
            store,
            plan,
            mapping,
            mappings: HashMap::new(),
            buffer: Vec::new().into_iter(),
            last: 0,
            exhausted: false,
        }
    }

    fn mapping_for(&mut self, values: &[Option<String>]) -> Arc<ColumnMapping> {
        let absent = values
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_none())
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let base = &self.mapping;
        let mapping = self.mappings.entry(absent).or_insert_with_key(|absent| {
            let omitted = absent
                .iter()
                .filter_map(|index| LogicalField::ALL.get(*index).copied())
                .collect::<Vec<_>>();
            Arc::new(base.clone().without(&omitted))
        });
        Arc::clone(mapping)
    }
}

impl<S: StagingStore + ?Sized> Iterator for StagedRecords<'_, S> {
    type Item = Result<RawRecord, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((sequence, values)) = self.buffer.next() {
                self.last = sequence;
                let mapping = self.mapping_for(&values);
                let values = values.into_iter().map(Option::unwrap_or_default).collect();
                return Some(Ok(RawRecord::new(sequence as usize, values, mapping)));
            }
            if self.exhausted {
                return None;
            }
            match self.store.read_batch(&self.plan, self.last, READ_BATCH_SIZE) {
                Ok(rows) => {
                    if rows.len() < READ_BATCH_SIZE {
                        self.exhausted = true;
                    }
                    self.buffer = rows.into_iter();
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

enum ConnectionSource {
    Shared(Arc<Mutex<Connection>>),
    File(PathBuf),
}

// File databases open a connection per operation so tasks on different
// tables do not serialise on one handle.
pub struct SqliteStagingStore {
    source: ConnectionSource,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

impl SqliteStagingStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            }
        }
        // Fail on an unopenable database now, not on first use.
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            source: ConnectionSource::File(path),
        })
    }

    pub fn in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            source: ConnectionSource::Shared(Arc::new(Mutex::new(conn))),
        })
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, HarvestError>,
    ) -> Result<T, HarvestError> {
        match &self.source {
            ConnectionSource::Shared(conn) => {
                let mut guard = conn.lock().map_err(|err| {
                    HarvestError::Staging(format!("failed to acquire database lock: {err}"))
                })?;
                f(&mut guard)
            }
            ConnectionSource::File(path) => {
                let mut conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                f(&mut conn)
            }
        }
    }
}

impl StagingStore for SqliteStagingStore {
    fn ensure_table(&self, plan: &InsertPlan) -> Result<(), HarvestError> {
        let columns = plan
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| {
                if index == 0 {
                    format!("{column} TEXT NOT NULL PRIMARY KEY")
                } else {
                    format!("{column} TEXT")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({columns})", plan.table());
        self.with_connection(|conn| {
            conn.execute(&sql, [])?;
            Ok(())
        })
    }

    fn reset(&self, table: &str) -> Result<(), HarvestError> {
        validate_identifier(table)?;
        self.with_connection(|conn| {
            let removed = conn.execute(&format!("DELETE FROM {table}"), [])?;
            debug!(table, removed, "staging table cleaned");
            Ok(())
        })
    }

    fn insert_batch(
        &self,
        plan: &InsertPlan,
        rows: &[Vec<Option<String>>],
    ) -> Result<InsertStats, HarvestError> {
        let sql = plan.statement();
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let mut stats = InsertStats {
                batches: 1,
                ..InsertStats::default()
            };
            {
                let mut statement = tx.prepare_cached(&sql)?;
                for row in rows {
                    let changed = statement.execute(params_from_iter(row.iter()))?;
                    if changed == 0 {
                        stats.ignored += 1;
                    } else {
                        stats.inserted += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(stats)
        })
    }

    fn read_batch(
        &self,
        plan: &InsertPlan,
        after: i64,
        limit: usize,
    ) -> Result<Vec<StagedRow>, HarvestError> {
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
            plan.columns().join(", "),
            plan.table()
        );
        let width = plan.columns().len();
        self.with_connection(|conn| {
            let mut statement = conn.prepare_cached(&sql)?;
            let rows = statement.query_map(rusqlite::params![after, limit as i64], |row| {
                let sequence = row.get::<_, i64>(0)?;
                let mut values = Vec::with_capacity(width);
                for index in 0..width {
                    values.push(row.get::<_, Option<String>>(index + 1)?);
                }
                Ok((sequence, values))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(HarvestError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn record(values: &[(LogicalField, &str)]) -> Result<RawRecord, HarvestError> {
        let layout = values.iter().map(|(field, _)| *field).collect::<Vec<_>>();
        Ok(RawRecord::new(
            2,
            values.iter().map(|(_, value)| value.to_string()).collect(),
            Arc::new(ColumnMapping::fixed(&layout)),
        ))
    }

    #[test]
    fn parameter_mismatch_is_fatal_before_any_row() {
        let columns = LogicalField::ALL[..14]
            .iter()
            .map(|field| field.column_name().to_string())
            .collect::<Vec<_>>();
        let plan = InsertPlan::with_columns("embl_data", columns)
            .unwrap()
            .with_statement(&format!(
                "INSERT INTO {{table}} VALUES ({})",
                vec!["?"; 15].join(", ")
            ));
        let err = plan.validate(STAGED_FIELD_COUNT).unwrap_err();
        assert_matches!(
            err,
            HarvestError::ParameterMismatch {
                parameters: 15,
                columns: 14,
                expected: 15,
                ..
            }
        );

        let store = SqliteStagingStore::in_memory().unwrap();
        let mut pulled = 0;
        let records = std::iter::from_fn(|| {
            pulled += 1;
            Some(record(&[(LogicalField::Accession, "AB1")]))
        });
        let result = bulk_insert(&store, &plan, records.take(3), 2);
        assert_matches!(result, Err(HarvestError::ParameterMismatch { .. }));
        assert_eq!(pulled, 0);
    }

    #[test]
    fn invalid_table_name_is_rejected() {
        assert_matches!(
            InsertPlan::new("embl; DROP TABLE x"),
            Err(HarvestError::Config(_))
        );
    }

    #[test]
    fn insert_skips_conflicts_and_reads_back_in_order() {
        let store = SqliteStagingStore::in_memory().unwrap();
        let plan = InsertPlan::new("embl_data").unwrap();
        store.ensure_table(&plan).unwrap();

        let rows = vec![
            record(&[(LogicalField::Accession, "AB2"), (LogicalField::Country, "KE")]),
            record(&[(LogicalField::Accession, "AB1"), (LogicalField::Country, "UG")]),
            record(&[(LogicalField::Accession, "AB2"), (LogicalField::Country, "TZ")]),
        ];
        let stats = bulk_insert(&store, &plan, rows, 2).unwrap();
        assert_eq!(
            stats,
            InsertStats {
                inserted: 2,
                ignored: 1,
                batches: 2
            }
        );

        let back = StagedRecords::new(&store, plan.clone())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].field(LogicalField::Accession), Some("AB2"));
        assert_eq!(back[0].field(LogicalField::Country), Some("KE"));
        assert_eq!(back[1].field(LogicalField::Accession), Some("AB1"));
        assert_eq!(back[1].field(LogicalField::Country), Some("UG"));
        assert_eq!(back[1].field(LogicalField::Sex), None);

        store.reset("embl_data").unwrap();
        let back = StagedRecords::new(&store, plan).count();
        assert_eq!(back, 0);
    }

    #[test]
    fn file_store_persists_between_connections() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("staging").join("embl.sqlite");
        let plan = InsertPlan::new("task_a").unwrap();
        {
            let store = SqliteStagingStore::open(&path).unwrap();
            store.ensure_table(&plan).unwrap();
            bulk_insert(
                &store,
                &plan,
                vec![record(&[(LogicalField::Accession, "AB1")])],
                WRITE_BATCH_SIZE,
            )
            .unwrap();
        }
        let store = SqliteStagingStore::open(&path).unwrap();
        let rows = store.read_batch(&plan, 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[0].as_deref(), Some("AB1"));
        assert_eq!(rows[0].1[1], None);
    }
}
