use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use whodb_core::{
    Column, Credential, DatabaseKind, EngineError, GetRowsResult, GraphUnit, Plugin, PluginConfig,
    Record, RowSink, SortCondition, StorageUnit, WhereCondition,
};

/// Scripted result for a fake plugin call.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Rows(GetRowsResult),
    Error(String),
    Unavailable(String),
}

impl FakeOutcome {
    fn into_result(&self) -> Result<GetRowsResult, EngineError> {
        match self {
            Self::Rows(result) => Ok(result.clone()),
            Self::Error(message) => Err(EngineError::internal(message.clone())),
            Self::Unavailable(message) => Err(EngineError::unavailable(message.clone())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakePluginStats {
    pub executed_queries: Vec<String>,
    pub row_calls: usize,
    pub write_calls: usize,
}

#[derive(Default)]
struct FakePluginState {
    storage_units: RwLock<Vec<StorageUnit>>,
    columns: RwLock<Vec<Column>>,
    query_outcomes: RwLock<HashMap<String, FakeOutcome>>,
    default_outcome: RwLock<Option<FakeOutcome>>,
    executed_queries: Mutex<Vec<String>>,
    last_credential: Mutex<Option<Credential>>,
    row_calls: AtomicUsize,
    write_calls: AtomicUsize,
    available: RwLock<bool>,
}

/// In-memory plugin with scripted outcomes, used by gate/surface tests so
/// they never need a real database.
#[derive(Clone)]
pub struct FakePlugin {
    kind: DatabaseKind,
    state: Arc<FakePluginState>,
}

impl FakePlugin {
    pub fn new(kind: DatabaseKind) -> Self {
        let state = FakePluginState {
            available: RwLock::new(true),
            ..FakePluginState::default()
        };
        Self {
            kind,
            state: Arc::new(state),
        }
    }

    pub fn with_storage_units(self, units: Vec<StorageUnit>) -> Self {
        *write(&self.state.storage_units) = units;
        self
    }

    pub fn with_columns(self, columns: Vec<Column>) -> Self {
        *write(&self.state.columns) = columns;
        self
    }

    pub fn with_query_result(self, query: impl Into<String>, result: GetRowsResult) -> Self {
        write(&self.state.query_outcomes).insert(query.into(), FakeOutcome::Rows(result));
        self
    }

    pub fn with_query_error(self, query: impl Into<String>, message: impl Into<String>) -> Self {
        write(&self.state.query_outcomes).insert(query.into(), FakeOutcome::Error(message.into()));
        self
    }

    pub fn with_default_result(self, result: GetRowsResult) -> Self {
        *write(&self.state.default_outcome) = Some(FakeOutcome::Rows(result));
        self
    }

    pub fn with_availability(self, available: bool) -> Self {
        *write(&self.state.available) = available;
        self
    }

    pub fn set_query_outcome(&self, query: impl Into<String>, outcome: FakeOutcome) {
        write(&self.state.query_outcomes).insert(query.into(), outcome);
    }

    pub fn stats(&self) -> FakePluginStats {
        FakePluginStats {
            executed_queries: self
                .state
                .executed_queries
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            row_calls: self.state.row_calls.load(Ordering::Relaxed),
            write_calls: self.state.write_calls.load(Ordering::Relaxed),
        }
    }

    pub fn as_plugin_arc(self) -> Arc<dyn Plugin> {
        Arc::new(self)
    }

    /// The credential the plugin last saw; used by resolver tests.
    pub fn last_credential(&self) -> Option<Credential> {
        self.state
            .last_credential
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn note_credential(&self, config: &PluginConfig) {
        *self
            .state
            .last_credential
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(config.credential.clone());
    }

    fn outcome_for(&self, query: &str) -> Result<GetRowsResult, EngineError> {
        self.state
            .executed_queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.to_string());

        if let Some(outcome) = read(&self.state.query_outcomes).get(query) {
            return outcome.into_result();
        }
        if let Some(outcome) = read(&self.state.default_outcome).as_ref() {
            return outcome.into_result();
        }
        Ok(GetRowsResult::default())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Plugin for FakePlugin {
    fn kind(&self) -> DatabaseKind {
        self.kind
    }

    fn is_available(&self, _config: &PluginConfig) -> bool {
        *read(&self.state.available)
    }

    fn get_databases(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.note_credential(config);
        Ok(vec!["app".to_string()])
    }

    fn get_all_schemas(&self, _config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        Ok(vec!["public".to_string()])
    }

    fn get_storage_units(
        &self,
        _config: &PluginConfig,
        _schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        Ok(read(&self.state.storage_units).clone())
    }

    fn get_columns_for_table(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        _name: &str,
    ) -> Result<Vec<Column>, EngineError> {
        Ok(read(&self.state.columns).clone())
    }

    fn get_rows(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        _filter: Option<&WhereCondition>,
        _sort: &[SortCondition],
        _page_size: u32,
        _page_offset: u64,
    ) -> Result<GetRowsResult, EngineError> {
        self.note_credential(config);
        self.state.row_calls.fetch_add(1, Ordering::Relaxed);
        self.outcome_for(storage_unit)
    }

    fn get_row_count(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        _filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError> {
        Ok(self.outcome_for(storage_unit)?.rows.len() as i64)
    }

    fn add_storage_unit(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        name: &str,
        _fields: &[Record],
    ) -> Result<bool, EngineError> {
        self.state.write_calls.fetch_add(1, Ordering::Relaxed);
        write(&self.state.storage_units).push(StorageUnit::new(name));
        Ok(true)
    }

    fn add_row(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        _storage_unit: &str,
        _values: &[Record],
    ) -> Result<bool, EngineError> {
        self.state.write_calls.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn update_storage_unit(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        _storage_unit: &str,
        values: &[Record],
        updated_columns: &[String],
    ) -> Result<bool, EngineError> {
        let has_key = values
            .iter()
            .any(|r| !updated_columns.iter().any(|c| c == &r.key));
        if !has_key {
            return Err(EngineError::conflict("missing key columns"));
        }
        self.state.write_calls.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn delete_row(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        _storage_unit: &str,
        _key_values: &[Record],
    ) -> Result<bool, EngineError> {
        self.state.write_calls.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn clear_table_data(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        _storage_unit: &str,
    ) -> Result<bool, EngineError> {
        self.state.write_calls.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn get_graph(
        &self,
        _config: &PluginConfig,
        _schema: &str,
    ) -> Result<Vec<GraphUnit>, EngineError> {
        Ok(read(&self.state.storage_units)
            .iter()
            .map(|unit| GraphUnit {
                unit: unit.clone(),
                relations: Vec::new(),
            })
            .collect())
    }

    fn raw_execute(
        &self,
        config: &PluginConfig,
        query: &str,
    ) -> Result<GetRowsResult, EngineError> {
        self.note_credential(config);
        self.outcome_for(query)
    }

    fn export_data(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        sink: &mut dyn RowSink,
        selected_rows: Option<&[Vec<String>]>,
    ) -> Result<(), EngineError> {
        let result = self.get_rows(config, schema, storage_unit, None, &[], u32::MAX, 0)?;
        sink.write_header(&result.columns)?;
        for row in &result.rows {
            if let Some(selected) = selected_rows
                && !selected.contains(row)
            {
                continue;
            }
            if let Err(e) = sink.write_row(row) {
                return if matches!(e, EngineError::Canceled) {
                    Ok(())
                } else {
                    Err(e)
                };
            }
        }
        Ok(())
    }
}
