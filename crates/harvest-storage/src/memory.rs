//! In-process [`ItemStore`] used by the test suites.
//!
//! It understands the two DDL shapes the schema initializer issues, keeps committed rows in
//! a map keyed by id, and exposes switches to make individual operations fail.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use harvest_core::ItemRow;

use crate::schema::BASE_COLUMNS;
use crate::{BatchTransaction, ItemStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    table_exists: bool,
    columns: BTreeSet<String>,
    rows: BTreeMap<i64, ItemRow>,
    statements: Vec<String>,
    failing_fragments: Vec<String>,
    fail_existence_query: bool,
    fail_begin: bool,
    fail_commit: bool,
    insert_failures: HashMap<i64, u32>,
    insert_attempts: HashMap<i64, u32>,
    existence_queries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        lock_state(&self.state)
    }

    fn update(&self, apply: impl FnOnce(&mut MemoryState)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }

    fn read<T: Default>(&self, view: impl FnOnce(&MemoryState) -> T) -> T {
        self.state.lock().map(|s| view(&s)).unwrap_or_default()
    }

    /// Stores rows as if an earlier run had committed them.
    pub fn seed(&self, rows: impl IntoIterator<Item = ItemRow>) {
        self.update(|state| {
            state.table_exists = true;
            for row in rows {
                state.rows.insert(row.id, row);
            }
        });
    }

    pub fn fail_statements_containing(&self, fragment: &str) {
        let fragment = fragment.to_string();
        self.update(|state| state.failing_fragments.push(fragment));
    }

    pub fn fail_existence_query(&self) {
        self.update(|state| state.fail_existence_query = true);
    }

    pub fn fail_begin(&self) {
        self.update(|state| state.fail_begin = true);
    }

    pub fn fail_commit(&self) {
        self.update(|state| state.fail_commit = true);
    }

    /// The next `times` inserts of `id` fail.
    pub fn fail_inserts(&self, id: i64, times: u32) {
        self.update(|state| {
            state.insert_failures.insert(id, times);
        });
    }

    pub fn row_count(&self) -> usize {
        self.read(|s| s.rows.len())
    }

    pub fn ids(&self) -> Vec<i64> {
        self.read(|s| s.rows.keys().copied().collect())
    }

    pub fn row(&self, id: i64) -> Option<ItemRow> {
        self.read(|s| s.rows.get(&id).cloned())
    }

    pub fn columns(&self) -> Vec<String> {
        self.read(|s| s.columns.iter().cloned().collect())
    }

    pub fn statements(&self) -> Vec<String> {
        self.read(|s| s.statements.clone())
    }

    pub fn insert_attempts(&self, id: i64) -> u32 {
        self.read(|s| s.insert_attempts.get(&id).copied().unwrap_or_default())
    }

    pub fn existence_queries(&self) -> usize {
        self.read(|s| s.existence_queries)
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
}

fn apply_ddl(state: &mut MemoryState, statement: &str) -> Result<(), StoreError> {
    let words: Vec<String> = statement
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["CREATE", "TABLE", "IF", "NOT", "EXISTS", ..] => {
            if !state.table_exists {
                state.table_exists = true;
                state.columns.extend(BASE_COLUMNS.iter().map(|c| c.to_string()));
            }
            Ok(())
        }
        ["ALTER", "TABLE", _, "ADD", "COLUMN", "IF", "NOT", "EXISTS", column, ..] => {
            if !state.table_exists {
                return Err(StoreError::Backend("relation \"items\" does not exist".into()));
            }
            state.columns.insert(column.to_ascii_lowercase());
            Ok(())
        }
        _ => Err(StoreError::Backend(format!(
            "unsupported statement: {}",
            statement.trim()
        ))),
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn execute(&self, statement: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.statements.push(statement.trim().to_string());
        if let Some(fragment) = state
            .failing_fragments
            .iter()
            .find(|f| statement.contains(f.as_str()))
        {
            return Err(StoreError::Backend(format!(
                "injected failure for statement containing {fragment:?}"
            )));
        }
        apply_ddl(&mut state, statement)
    }

    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        let mut state = self.lock()?;
        state.existence_queries += 1;
        if state.fail_existence_query {
            return Err(StoreError::Backend("existence query failed".into()));
        }
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.rows.contains_key(id))
            .collect())
    }

    async fn begin_batch(&self) -> Result<Box<dyn BatchTransaction>, StoreError> {
        if self.lock()?.fail_begin {
            return Err(StoreError::Backend("could not open transaction".into()));
        }
        Ok(Box::new(MemoryBatch {
            state: self.state.clone(),
            pending: BTreeMap::new(),
        }))
    }
}

/// Rows become visible to the store only on commit.
struct MemoryBatch {
    state: Arc<Mutex<MemoryState>>,
    pending: BTreeMap<i64, ItemRow>,
}

#[async_trait]
impl BatchTransaction for MemoryBatch {
    async fn insert(&mut self, row: &ItemRow) -> Result<(), StoreError> {
        let mut state = lock_state(&self.state)?;
        *state.insert_attempts.entry(row.id).or_default() += 1;

        if let Some(remaining) = state.insert_failures.get_mut(&row.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Backend(format!("insert of {} failed", row.id)));
            }
        }
        if state.rows.contains_key(&row.id) || self.pending.contains_key(&row.id) {
            return Err(StoreError::Backend(format!(
                "duplicate key value violates primary key: id={}",
                row.id
            )));
        }

        self.pending.insert(row.id, row.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryBatch { state, pending } = *self;
        let mut guard = lock_state(&state)?;
        if guard.fail_commit {
            return Err(StoreError::Backend("commit failed".into()));
        }
        guard.rows.extend(pending);
        Ok(())
    }
}
