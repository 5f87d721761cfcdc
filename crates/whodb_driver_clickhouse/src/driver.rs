use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use whodb_core::{
    ChatMessage, Column, Credential, DatabaseKind, DatabaseMetadata, EngineError, ExternalModel,
    ForeignKey, GetRowsResult, GraphUnit, Lease, ManagedConnection, Plugin, PluginConfig, Record,
    RowSink, SelectBuilder, SortCondition, SqlDialect, StorageUnit, TypeCategory, TypeDefinition,
    WhereCondition, connection_cache, is_safe_read_query, validate_column_type,
};
use std::collections::{BTreeMap, HashMap};

static TYPE_DEFINITIONS: &[TypeDefinition] = &[
    TypeDefinition::simple("INT8", TypeCategory::Numeric),
    TypeDefinition::simple("INT16", TypeCategory::Numeric),
    TypeDefinition::simple("INT32", TypeCategory::Numeric),
    TypeDefinition::simple("INT64", TypeCategory::Numeric),
    TypeDefinition::simple("UINT8", TypeCategory::Numeric),
    TypeDefinition::simple("UINT16", TypeCategory::Numeric),
    TypeDefinition::simple("UINT32", TypeCategory::Numeric),
    TypeDefinition::simple("UINT64", TypeCategory::Numeric),
    TypeDefinition::simple("FLOAT32", TypeCategory::Numeric),
    TypeDefinition::simple("FLOAT64", TypeCategory::Numeric),
    TypeDefinition::with_precision("DECIMAL", TypeCategory::Numeric, 10, 2),
    TypeDefinition::simple("STRING", TypeCategory::Text),
    TypeDefinition::with_length("FIXEDSTRING", TypeCategory::Text, 16),
    TypeDefinition::simple("UUID", TypeCategory::Text),
    TypeDefinition::simple("DATE", TypeCategory::DateTime),
    TypeDefinition::simple("DATE32", TypeCategory::DateTime),
    TypeDefinition::simple("DATETIME", TypeCategory::DateTime),
    TypeDefinition::simple("DATETIME64", TypeCategory::DateTime),
    TypeDefinition::simple("BOOL", TypeCategory::Boolean),
    TypeDefinition::simple("JSON", TypeCategory::Json),
];

static ALIAS_MAP: &[(&str, &str)] = &[
    ("TINYINT", "INT8"),
    ("SMALLINT", "INT16"),
    ("INT", "INT32"),
    ("INTEGER", "INT32"),
    ("BIGINT", "INT64"),
    ("FLOAT", "FLOAT32"),
    ("DOUBLE", "FLOAT64"),
    ("VARCHAR", "STRING"),
    ("TEXT", "STRING"),
    ("BOOLEAN", "BOOL"),
    ("TIMESTAMP", "DATETIME"),
];

pub static METADATA: DatabaseMetadata = DatabaseMetadata {
    kind: DatabaseKind::ClickHouse,
    type_definitions: TYPE_DEFINITIONS,
    operators: &[
        "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "ILIKE", "IN", "NOT IN",
        "IS NULL", "IS NOT NULL",
    ],
    alias_map: ALIAS_MAP,
};

/// ClickHouse dialect: backtick identifiers, schema means database.
struct ClickHouseDialect;

impl SqlDialect for ClickHouseDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "\\`"))
    }
}

static DIALECT: ClickHouseDialect = ClickHouseDialect;

/// ClickHouse is driven over its native HTTP interface; results come back
/// as `JSONCompact` (`meta` + `data`).
struct ClickHouseHandle {
    http: reqwest::blocking::Client,
    base_url: String,
    username: String,
    password: String,
    database: String,
}

impl ManagedConnection for ClickHouseHandle {
    fn close(&self) {
        log::debug!("released clickhouse client for {}", self.base_url);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ClickHouseHandle {
    fn execute(&self, query: &str) -> Result<Value, EngineError> {
        let mut request = self
            .http
            .post(&self.base_url)
            .query(&[("default_format", "JSONCompact")])
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
            .body(query.to_string());
        if !self.database.is_empty() {
            request = request.query(&[("database", self.database.as_str())]);
        }

        let response = request
            .send()
            .map_err(|e| EngineError::unavailable(format!("clickhouse request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| EngineError::unavailable(format!("clickhouse response lost: {e}")))?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                400 => EngineError::invalid_argument(text),
                401 | 403 => EngineError::unauthorized(text),
                404 => EngineError::not_found(text),
                502 | 503 | 504 => EngineError::unavailable(text),
                _ => EngineError::internal(text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| EngineError::internal(format!("unexpected clickhouse reply: {e}")))
    }

    fn query_result(&self, query: &str) -> Result<GetRowsResult, EngineError> {
        let reply = self.execute(query)?;
        Ok(compact_to_result(&reply))
    }

    fn query_strings(&self, query: &str) -> Result<Vec<String>, EngineError> {
        let result = self.query_result(query)?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }
}

fn compact_to_result(reply: &Value) -> GetRowsResult {
    let columns: Vec<Column> = reply["meta"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|meta| {
            let name = meta["name"].as_str().unwrap_or("").to_string();
            let column_type = meta["type"].as_str().unwrap_or("String").to_string();
            let nullable = column_type.starts_with("Nullable(");
            Column::new(name, column_type)
                .with_extra("nullable", if nullable { "true" } else { "false" })
        })
        .collect();

    let rows: Vec<Vec<String>> = reply["data"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|row| {
            row.as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .map(json_cell_to_string)
                .collect()
        })
        .collect();

    GetRowsResult {
        columns,
        rows,
        disable_update: false,
    }
}

fn json_cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub struct ClickHousePlugin;

impl ClickHousePlugin {
    pub fn new() -> Self {
        Self
    }

    fn acquire(&self, config: &PluginConfig) -> Result<Lease, EngineError> {
        connection_cache::global().get_or_create(&config.credential, |credential| {
            let handle = connect(credential)?;
            Ok(Arc::new(handle) as Arc<dyn ManagedConnection>)
        })
    }

    fn with_handle<T>(
        &self,
        config: &PluginConfig,
        op: impl FnOnce(&ClickHouseHandle) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let lease = self.acquire(config)?;
        op(lease.downcast::<ClickHouseHandle>()?)
    }
}

impl Default for ClickHousePlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn connect(credential: &Credential) -> Result<ClickHouseHandle, EngineError> {
    let scheme = if credential
        .advanced_value("ssl")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    {
        "https"
    } else {
        "http"
    };
    let base_url = format!(
        "{scheme}://{}:{}/",
        credential.hostname,
        credential.port_or(8123)
    );

    let http = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| EngineError::unavailable(format!("http client setup failed: {e}")))?;

    let handle = ClickHouseHandle {
        http,
        base_url,
        username: if credential.username.is_empty() {
            "default".to_string()
        } else {
            credential.username.clone()
        },
        password: credential.password.clone(),
        database: credential.database.clone(),
    };
    handle.execute("SELECT 1")?;
    Ok(handle)
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

impl Plugin for ClickHousePlugin {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::ClickHouse
    }

    fn is_available(&self, config: &PluginConfig) -> bool {
        self.with_handle(config, |handle| handle.execute("SELECT 1"))
            .is_ok()
    }

    fn get_databases(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.with_handle(config, |handle| {
            handle.query_strings("SHOW DATABASES")
        })
    }

    /// ClickHouse schemas and databases are the same namespace.
    fn get_all_schemas(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.get_databases(config)
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        let sql = format!(
            "SELECT name, engine, toString(total_rows), formatReadableSize(total_bytes) \
             FROM system.tables WHERE database = '{}' ORDER BY name",
            escape_literal(schema)
        );
        self.with_handle(config, |handle| {
            let result = handle.query_result(&sql)?;
            Ok(result
                .rows
                .into_iter()
                .filter(|row| row.len() >= 4)
                .map(|row| StorageUnit {
                    name: row[0].clone(),
                    attributes: vec![
                        Record::new("Type", row[1].clone()),
                        Record::new("Count", row[2].clone()),
                        Record::new("Total Size", row[3].clone()),
                    ],
                })
                .collect())
        })
    }

    fn get_columns_for_table(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<Vec<Column>, EngineError> {
        let sql = format!(
            "SELECT name, type FROM system.columns \
             WHERE database = '{}' AND table = '{}' ORDER BY position",
            escape_literal(schema),
            escape_literal(name)
        );
        self.with_handle(config, |handle| {
            let result = handle.query_result(&sql)?;
            if result.rows.is_empty() {
                return Err(EngineError::not_found(format!(
                    "no such table: {schema}.{name}"
                )));
            }
            Ok(result
                .rows
                .into_iter()
                .filter(|row| row.len() >= 2)
                .map(|row| {
                    let nullable = row[1].starts_with("Nullable(");
                    Column::new(row[0].clone(), row[1].clone())
                        .with_extra("nullable", if nullable { "true" } else { "false" })
                })
                .collect())
        })
    }

    fn get_column_constraints(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<HashMap<String, BTreeMap<String, serde_json::Value>>, EngineError> {
        let sql = format!(
            "SELECT name, type, is_in_primary_key, is_in_sorting_key FROM system.columns \
             WHERE database = '{}' AND table = '{}'",
            escape_literal(schema),
            escape_literal(name)
        );
        self.with_handle(config, |handle| {
            let result = handle.query_result(&sql)?;
            let mut constraints = HashMap::new();
            for row in result.rows {
                if row.len() < 4 {
                    continue;
                }
                let mut facts = BTreeMap::new();
                facts.insert(
                    "nullable".to_string(),
                    serde_json::Value::Bool(row[1].starts_with("Nullable(")),
                );
                if row[2] == "1" {
                    facts.insert("primary".to_string(), serde_json::Value::Bool(true));
                }
                if row[3] == "1" {
                    facts.insert("sorting_key".to_string(), serde_json::Value::Bool(true));
                }
                constraints.insert(row[0].clone(), facts);
            }
            Ok(constraints)
        })
    }

    fn get_foreign_key_relationships(
        &self,
        _config: &PluginConfig,
        _schema: &str,
        _name: &str,
    ) -> Result<HashMap<String, ForeignKey>, EngineError> {
        // ClickHouse has no foreign keys.
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
    ) -> Result<GetRowsResult, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_select(
            Some(schema),
            storage_unit,
            filter,
            sort,
            page_size,
            page_offset,
        )?;
        self.with_handle(config, |handle| handle.query_result(&sql))
    }

    fn get_row_count(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_count(Some(schema), storage_unit, filter)?;
        self.with_handle(config, |handle| {
            let values = handle.query_strings(&sql)?;
            values
                .first()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| EngineError::internal("count query returned no rows"))
        })
    }

    fn add_storage_unit(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
        fields: &[Record],
    ) -> Result<bool, EngineError> {
        if fields.is_empty() {
            return Err(EngineError::invalid_argument(
                "a table needs at least one column",
            ));
        }
        for field in fields {
            validate_column_type(&field.value, Some(&METADATA))?;
        }

        let columns: Vec<String> = fields
            .iter()
            .map(|f| format!("{} {}", DIALECT.quote_identifier(&f.key), f.value))
            .collect();
        let sql = format!(
            "CREATE TABLE {} ({}) ENGINE = MergeTree ORDER BY tuple()",
            DIALECT.qualified_table(Some(schema), name),
            columns.join(", ")
        );
        self.with_handle(config, |handle| {
            handle.execute(&sql)?;
            Ok(true)
        })
    }

    fn add_row(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        values: &[Record],
    ) -> Result<bool, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_insert(Some(schema), storage_unit, values)?;
        self.with_handle(config, |handle| {
            handle.execute(&sql)?;
            Ok(true)
        })
    }

    /// Updates are asynchronous mutations in ClickHouse.
    fn update_storage_unit(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        values: &[Record],
        updated_columns: &[String],
    ) -> Result<bool, EngineError> {
        let (changes, keys): (Vec<&Record>, Vec<&Record>) = values
            .iter()
            .partition(|r| updated_columns.iter().any(|c| c == &r.key));
        if changes.is_empty() {
            return Err(EngineError::invalid_argument("no columns to update"));
        }
        if keys.is_empty() {
            return Err(EngineError::conflict(
                "update requires the key columns alongside the changed values",
            ));
        }

        let set_clause: Vec<String> = changes
            .iter()
            .map(|r| {
                format!(
                    "{} = '{}'",
                    DIALECT.quote_identifier(&r.key),
                    escape_literal(&r.value)
                )
            })
            .collect();
        let where_clause: Vec<String> = keys
            .iter()
            .map(|r| {
                format!(
                    "{} = '{}'",
                    DIALECT.quote_identifier(&r.key),
                    escape_literal(&r.value)
                )
            })
            .collect();

        let sql = format!(
            "ALTER TABLE {} UPDATE {} WHERE {}",
            DIALECT.qualified_table(Some(schema), storage_unit),
            set_clause.join(", "),
            where_clause.join(" AND ")
        );
        self.with_handle(config, |handle| {
            handle.execute(&sql)?;
            Ok(true)
        })
    }

    fn delete_row(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        key_values: &[Record],
    ) -> Result<bool, EngineError> {
        if key_values.is_empty() {
            return Err(EngineError::conflict("delete requires key values"));
        }
        let where_clause: Vec<String> = key_values
            .iter()
            .map(|r| {
                format!(
                    "{} = '{}'",
                    DIALECT.quote_identifier(&r.key),
                    escape_literal(&r.value)
                )
            })
            .collect();

        let sql = format!(
            "ALTER TABLE {} DELETE WHERE {}",
            DIALECT.qualified_table(Some(schema), storage_unit),
            where_clause.join(" AND ")
        );
        self.with_handle(config, |handle| {
            handle.execute(&sql)?;
            Ok(true)
        })
    }

    fn clear_table_data(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
    ) -> Result<bool, EngineError> {
        let sql = format!(
            "TRUNCATE TABLE {}",
            DIALECT.qualified_table(Some(schema), storage_unit)
        );
        self.with_handle(config, |handle| {
            handle.execute(&sql)?;
            Ok(true)
        })
    }

    fn get_graph(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<GraphUnit>, EngineError> {
        Ok(self
            .get_storage_units(config, schema)?
            .into_iter()
            .map(|unit| GraphUnit {
                unit,
                relations: Vec::new(),
            })
            .collect())
    }

    fn raw_execute(
        &self,
        config: &PluginConfig,
        query: &str,
    ) -> Result<GetRowsResult, EngineError> {
        self.with_handle(config, |handle| {
            let mut result = handle.query_result(query)?;
            result.disable_update = true;
            if result.columns.is_empty() {
                result.columns = vec![Column::new("result", "String")];
                result.rows = vec![vec!["OK".to_string()]];
            }
            Ok(result)
        })
    }

    fn export_data(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        sink: &mut dyn RowSink,
        selected_rows: Option<&[Vec<String>]>,
    ) -> Result<(), EngineError> {
        let sql = format!(
            "SELECT * FROM {}",
            DIALECT.qualified_table(Some(schema), storage_unit)
        );
        self.with_handle(config, |handle| {
            let result = handle.query_result(&sql)?;
            sink.write_header(&result.columns)?;
            for row in &result.rows {
                if let Some(selected) = selected_rows
                    && !selected.contains(row)
                {
                    continue;
                }
                match sink.write_row(row) {
                    Ok(()) => {}
                    Err(EngineError::Canceled) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    fn get_database_metadata(&self) -> Option<&'static DatabaseMetadata> {
        Some(&METADATA)
    }

    fn chat(
        &self,
        config: &PluginConfig,
        _schema: &str,
        _model: Option<&ExternalModel>,
        _history: &[ChatMessage],
        query: &str,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        if is_safe_read_query(query) {
            let result = self.raw_execute(config, query)?;
            return Ok(vec![ChatMessage {
                kind: "sql".to_string(),
                text: query.to_string(),
                result: Some(result),
            }]);
        }
        Err(EngineError::unsupported(
            "natural-language chat is handled by the external assistant",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compact_replies_become_results() {
        let reply = json!({
            "meta": [
                { "name": "id", "type": "UInt64" },
                { "name": "name", "type": "Nullable(String)" }
            ],
            "data": [[1, "alice"], [2, null]],
            "rows": 2
        });
        let result = compact_to_result(&reply);
        assert_eq!(result.columns.len(), 2);
        assert!(result.columns[1].is_nullable());
        assert_eq!(result.rows[0], vec!["1", "alice"]);
        assert_eq!(result.rows[1], vec!["2", ""]);
    }

    #[test]
    fn metadata_accepts_aliases() {
        assert!(validate_column_type("varchar", Some(&METADATA)).is_ok());
        assert!(validate_column_type("UInt64", Some(&METADATA)).is_ok());
        assert!(validate_column_type("Point", Some(&METADATA)).is_err());
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(escape_literal("o'brien"), "o\\'brien");
    }
}
