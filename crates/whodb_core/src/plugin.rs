use crate::{Credential, DatabaseKind, DatabaseMetadata, EngineError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Engine-neutral name for a table, collection, index, or keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUnit {
    pub name: String,
    /// Ordered descriptive attributes ("Type", "Total Size", "Count", ...).
    pub attributes: Vec<crate::Record>,
}

impl StorageUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|r| r.key.eq_ignore_ascii_case(key))
            .map(|r| r.value.as_str())
    }
}

/// Column descriptor. `extras` carries driver-specific facts such as
/// nullability (`"nullable" => "true"`) or primary-key membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "Type")]
    pub column_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<BTreeMap<String, String>>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            extras: None,
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extras
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn is_nullable(&self) -> bool {
        self.extras
            .as_ref()
            .and_then(|e| e.get("nullable"))
            .is_some_and(|v| v == "true")
    }
}

/// Row page returned by `get_rows` and `raw_execute`. Values are canonical
/// strings; see `Value::to_wire_string` for the encoding rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetRowsResult {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<String>>,
    /// True when the result set cannot be mapped back to updatable rows
    /// (joins, aggregates, raw queries without a key).
    pub disable_update: bool,
}

/// Relationship kind between two storage units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphRelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelation {
    pub name: String,
    pub relation: GraphRelationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphUnit {
    pub unit: StorageUnit,
    pub relations: Vec<GraphRelation>,
}

/// Foreign-key edge reported per referencing column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SslStatus {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// External chat model reference passed through to the chat helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalModel {
    pub kind: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "message", "sql", or "error".
    pub kind: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GetRowsResult>,
}

/// Runtime bundle passed to every plugin call.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub credential: Credential,
    pub external_model: Option<ExternalModel>,
}

impl PluginConfig {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            external_model: None,
        }
    }
}

/// Filter tree translated by each driver into its native predicate form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WhereCondition {
    Atomic {
        key: String,
        operator: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column_type: Option<String>,
    },
    And(Vec<WhereCondition>),
    Or(Vec<WhereCondition>),
}

impl WhereCondition {
    pub fn atomic(
        key: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Atomic {
            key: key.into(),
            operator: operator.into(),
            value: value.into(),
            column_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Sort key; ties between equal columns keep insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortCondition {
    pub column: String,
    pub direction: SortDirection,
}

impl SortCondition {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Pull-based row consumer used by `export_data`. Returning an error from
/// either method tells the plugin to stop iterating and release its
/// cursor; `Canceled` is a graceful stop, anything else propagates.
pub trait RowSink {
    fn write_header(&mut self, columns: &[Column]) -> Result<(), EngineError>;
    fn write_row(&mut self, row: &[String]) -> Result<(), EngineError>;
}

/// Open transaction handed to `with_transaction` callbacks on engines that
/// support one. Statements run inside it; the plugin commits on `Ok` and
/// rolls back on `Err`.
pub trait TransactionScope {
    fn execute(&mut self, query: &str) -> Result<u64, EngineError>;
}

pub type TransactionOp<'a> =
    dyn FnMut(Option<&mut dyn TransactionScope>) -> Result<(), EngineError> + 'a;

/// The capability set every database driver implements.
///
/// Inputs are validated by the request gate before they reach the plugin.
/// Optional capabilities default to `Unsupported` so engines only override
/// what they can actually do; drivers never panic and convert native errors
/// into `EngineError` kinds at this boundary.
pub trait Plugin: Send + Sync {
    fn kind(&self) -> DatabaseKind;

    /// Cheap liveness probe; used by login and `connections test`.
    fn is_available(&self, config: &PluginConfig) -> bool;

    fn get_databases(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        let _ = config;
        Err(EngineError::unsupported(format!(
            "{} does not enumerate databases",
            self.kind()
        )))
    }

    fn get_all_schemas(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        let _ = config;
        Err(EngineError::unsupported(format!(
            "{} has no schemas",
            self.kind()
        )))
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError>;

    fn storage_unit_exists(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<bool, EngineError> {
        Ok(self
            .get_storage_units(config, schema)?
            .iter()
            .any(|u| u.name == name))
    }

    fn get_columns_for_table(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<Vec<Column>, EngineError>;

    /// Constraint facts per column ("primary", "unique", "check", ...).
    fn get_column_constraints(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<HashMap<String, BTreeMap<String, serde_json::Value>>, EngineError> {
        let _ = (config, schema, name);
        Ok(HashMap::new())
    }

    fn get_foreign_key_relationships(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<HashMap<String, ForeignKey>, EngineError> {
        let _ = (config, schema, name);
        Ok(HashMap::new())
    }

    fn get_rows(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
        sort: &[SortCondition],
        page_size: u32,
        page_offset: u64,
    ) -> Result<GetRowsResult, EngineError>;

    fn get_row_count(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError>;

    /// DDL: create a table/collection with the given field definitions.
    fn add_storage_unit(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
        fields: &[crate::Record],
    ) -> Result<bool, EngineError>;

    fn add_row(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        values: &[crate::Record],
    ) -> Result<bool, EngineError>;

    /// Update a row identified by its key columns. Fails with `Conflict`
    /// when the key columns are not supplied in `values`.
    fn update_storage_unit(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        values: &[crate::Record],
        updated_columns: &[String],
    ) -> Result<bool, EngineError>;

    fn delete_row(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        key_values: &[crate::Record],
    ) -> Result<bool, EngineError>;

    fn clear_table_data(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
    ) -> Result<bool, EngineError>;

    fn get_graph(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<GraphUnit>, EngineError>;

    fn raw_execute(
        &self,
        config: &PluginConfig,
        query: &str,
    ) -> Result<GetRowsResult, EngineError>;

    /// Stream rows to the sink. When `selected_rows` is given, only rows
    /// whose canonical encoding matches one of the entries are emitted.
    /// A sink error stops iteration promptly.
    fn export_data(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        sink: &mut dyn RowSink,
        selected_rows: Option<&[Vec<String>]>,
    ) -> Result<(), EngineError>;

    fn format_value(&self, value: &Value) -> String {
        value.to_wire_string()
    }

    /// Run `op` inside a transaction when the engine supports one,
    /// otherwise call it with `None`.
    fn with_transaction(
        &self,
        config: &PluginConfig,
        op: &mut TransactionOp<'_>,
    ) -> Result<(), EngineError> {
        let _ = config;
        op(None)
    }

    fn get_database_metadata(&self) -> Option<&'static DatabaseMetadata> {
        None
    }

    fn get_ssl_status(&self, config: &PluginConfig) -> Result<Option<SslStatus>, EngineError> {
        let _ = config;
        Ok(None)
    }

    /// Schema-aware chat over the engine. Only SQL engines implement it.
    fn chat(
        &self,
        config: &PluginConfig,
        schema: &str,
        model: Option<&ExternalModel>,
        history: &[ChatMessage],
        query: &str,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        let _ = (config, schema, model, history, query);
        Err(EngineError::unsupported(format!(
            "chat is not supported for {}",
            self.kind()
        )))
    }
}

/// Call a read-only plugin operation, retrying exactly once with a fresh
/// handle when the first attempt reports `Unavailable`. Mutating operations
/// must not go through here.
pub fn retry_read<T>(
    config: &PluginConfig,
    mut op: impl FnMut() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    match op() {
        Err(e) if e.is_retriable() => {
            log::warn!(
                "retrying {} call after transport failure: {e}",
                config.credential.kind
            );
            crate::connection_cache::global().remove(&config.credential);
            op()
        }
        other => other,
    }
}
