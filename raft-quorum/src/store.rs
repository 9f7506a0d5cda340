//! Storage collaborators: the append-only command log and the query
//! executor, plus an in-memory implementation of both.
//!
//! The consensus core only talks to [`Storage`], which pairs one
//! [`CommandLog`] with one [`QueryExecutor`]. A real deployment backs both
//! with the same relational database; [`MemoryDatabase`] is the reference
//! implementation used by the `node` binary and the tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::command::{Command, LogEntry};
use crate::error::StorageError;
use crate::statement::{Filter, Projection, Statement};

/// Append-only, ordered log of serialized commands.
#[async_trait]
pub trait CommandLog: Send + Sync {
    /// Stores `command` and returns the id assigned to it. Ids are strictly
    /// increasing and always one past the current latest id.
    async fn append(&self, command: &str, command_time: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Id of the newest entry, `0` when the log is empty.
    async fn latest_id(&self) -> Result<u64, StorageError>;

    /// Entries with an id strictly greater than `id`, ascending.
    async fn entries_after(&self, id: u64) -> Result<Vec<LogEntry>, StorageError>;

    async fn entry_by_id(&self, id: u64) -> Result<LogEntry, StorageError>;

    /// Removes entry `id` if it is the newest one. Returns whether anything
    /// was removed.
    async fn truncate(&self, id: u64) -> Result<bool, StorageError>;
}

/// Executes raw queries against the live database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, values: Option<&[Value]>) -> Result<Value, StorageError>;
}

/// The storage handle owned by a consensus node.
#[derive(Clone)]
pub struct Storage {
    log: Arc<dyn CommandLog>,
    db: Arc<dyn QueryExecutor>,
}

impl Storage {
    pub fn new(log: Arc<dyn CommandLog>, db: Arc<dyn QueryExecutor>) -> Self {
        Self { log, db }
    }

    /// Uses one [`MemoryDatabase`] as both log and executor.
    pub fn in_memory(db: Arc<MemoryDatabase>) -> Self {
        Self {
            log: db.clone(),
            db,
        }
    }

    /// Appends a fresh client command stamped with the current time.
    pub async fn append(&self, command: &Command) -> Result<u64, StorageError> {
        let encoded = command
            .encode()
            .map_err(|err| StorageError::Other(format!("failed to encode command: {err}")))?;
        self.log.append(&encoded, Utc::now()).await
    }

    /// Appends an entry copied from the leader, keeping its command text and
    /// timestamp. Nothing is written unless the entry's id is the next one
    /// this log would assign.
    pub async fn append_entry(&self, entry: &LogEntry) -> Result<u64, StorageError> {
        let next = self.log.latest_id().await? + 1;
        if entry.id != next {
            return Err(StorageError::Diverged {
                expected: entry.id,
                assigned: next,
            });
        }

        let assigned = self.log.append(&entry.command, entry.command_time).await?;
        if assigned != entry.id {
            // Someone else appended in between; take ours back out.
            self.log.truncate(assigned).await?;
            return Err(StorageError::Diverged {
                expected: entry.id,
                assigned,
            });
        }
        Ok(assigned)
    }

    pub async fn latest_id(&self) -> Result<u64, StorageError> {
        self.log.latest_id().await
    }

    pub async fn entries_after(&self, id: u64) -> Result<Vec<LogEntry>, StorageError> {
        self.log.entries_after(id).await
    }

    pub async fn entry_by_id(&self, id: u64) -> Result<LogEntry, StorageError> {
        self.log.entry_by_id(id).await
    }

    pub async fn truncate(&self, id: u64) -> Result<bool, StorageError> {
        self.log.truncate(id).await
    }

    pub async fn execute(&self, query: &str, values: Option<&[Value]>) -> Result<Value, StorageError> {
        self.db.execute(query, values).await
    }

    /// Replays the stored command `id` against the live database.
    pub async fn apply_by_id(&self, id: u64) -> Result<Value, StorageError> {
        let command = self.entry_by_id(id).await?.decode_command()?;
        self.db.execute(&command.query, command.values.as_deref()).await
    }
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

impl Table {
    fn check_column(&self, table: &str, column: &str) -> Result<(), StorageError> {
        if self.columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(StorageError::Other(format!("unknown column '{column}' in table '{table}'")))
        }
    }

    fn matches(row: &Map<String, Value>, filter: Option<&(String, Value)>) -> bool {
        match filter {
            Some((column, value)) => row.get(column) == Some(value),
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Table>,
    log: BTreeMap<u64, LogEntry>,
}

/// In-memory table store and command log.
///
/// Rows are JSON objects; a query result is either an array of rows
/// (`SELECT`) or `{"affectedRows": n}`. [`MemoryDatabase::set_available`]
/// switches the whole database offline so every call fails with
/// [`StorageError::Unavailable`].
#[derive(Debug)]
pub struct MemoryDatabase {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current rows of `table`, for inspection outside of consensus.
    pub fn rows(&self, table: &str) -> Option<Vec<Map<String, Value>>> {
        self.lock().tables.get(table).map(|t| t.rows.clone())
    }

    /// Ids currently held by the command log, ascending.
    pub fn log_ids(&self) -> Vec<u64> {
        self.lock().log.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(self.lock())
        } else {
            Err(StorageError::Unavailable)
        }
    }

    fn run(&self, statement: Statement, bound: &[Value]) -> Result<Value, StorageError> {
        let mut inner = self.online()?;

        match statement {
            Statement::CreateTable {
                table,
                columns,
                if_not_exists,
            } => {
                if inner.tables.contains_key(&table) {
                    if if_not_exists {
                        return Ok(json!({ "affectedRows": 0 }));
                    }
                    return Err(StorageError::Other(format!("table '{table}' already exists")));
                }
                inner.tables.insert(
                    table,
                    Table {
                        columns,
                        rows: Vec::new(),
                    },
                );
                Ok(json!({ "affectedRows": 0 }))
            }
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                let target = inner
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| StorageError::NoSuchTable(table.clone()))?;
                for column in &columns {
                    target.check_column(&table, column)?;
                }

                let mut row: Map<String, Value> = target
                    .columns
                    .iter()
                    .map(|c| (c.clone(), Value::Null))
                    .collect();
                for (column, operand) in columns.into_iter().zip(values) {
                    row.insert(column, operand.resolve(bound));
                }
                target.rows.push(row);
                Ok(json!({ "affectedRows": 1 }))
            }
            Statement::Select {
                table,
                projection,
                filter,
            } => {
                let source = inner
                    .tables
                    .get(&table)
                    .ok_or_else(|| StorageError::NoSuchTable(table.clone()))?;
                let filter = resolve_filter(source, &table, filter, bound)?;

                let selected: Vec<Value> = match projection {
                    Projection::All => source
                        .rows
                        .iter()
                        .filter(|row| Table::matches(row, filter.as_ref()))
                        .map(|row| Value::Object(row.clone()))
                        .collect(),
                    Projection::Columns(columns) => {
                        for column in &columns {
                            source.check_column(&table, column)?;
                        }
                        source
                            .rows
                            .iter()
                            .filter(|row| Table::matches(row, filter.as_ref()))
                            .map(|row| {
                                let picked = columns
                                    .iter()
                                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                                    .collect();
                                Value::Object(picked)
                            })
                            .collect()
                    }
                };
                Ok(Value::Array(selected))
            }
            Statement::Delete { table, filter } => {
                let target = inner
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| StorageError::NoSuchTable(table.clone()))?;
                let filter = resolve_filter(target, &table, filter, bound)?;

                let before = target.rows.len();
                target.rows.retain(|row| !Table::matches(row, filter.as_ref()));
                Ok(json!({ "affectedRows": before - target.rows.len() }))
            }
        }
    }
}

fn resolve_filter(
    table: &Table,
    name: &str,
    filter: Option<Filter>,
    bound: &[Value],
) -> Result<Option<(String, Value)>, StorageError> {
    match filter {
        Some(filter) => {
            table.check_column(name, &filter.column)?;
            let value = filter.value.resolve(bound);
            Ok(Some((filter.column, value)))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl QueryExecutor for MemoryDatabase {
    async fn execute(&self, query: &str, values: Option<&[Value]>) -> Result<Value, StorageError> {
        let bound = values.unwrap_or_default();
        let statement = Statement::prepare(query, bound)?;
        self.run(statement, bound)
    }
}

#[async_trait]
impl CommandLog for MemoryDatabase {
    async fn append(&self, command: &str, command_time: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut inner = self.online()?;
        let id = inner.log.keys().next_back().copied().unwrap_or(0) + 1;
        inner.log.insert(
            id,
            LogEntry {
                id,
                command: command.to_string(),
                command_time,
            },
        );
        Ok(id)
    }

    async fn latest_id(&self) -> Result<u64, StorageError> {
        let inner = self.online()?;
        Ok(inner.log.keys().next_back().copied().unwrap_or(0))
    }

    async fn entries_after(&self, id: u64) -> Result<Vec<LogEntry>, StorageError> {
        let inner = self.online()?;
        Ok(inner
            .log
            .range(id.saturating_add(1)..)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn entry_by_id(&self, id: u64) -> Result<LogEntry, StorageError> {
        let inner = self.online()?;
        inner
            .log
            .get(&id)
            .cloned()
            .ok_or(StorageError::EntryNotFound(id))
    }

    async fn truncate(&self, id: u64) -> Result<bool, StorageError> {
        let mut inner = self.online()?;
        if inner.log.keys().next_back() == Some(&id) {
            inner.log.remove(&id);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
