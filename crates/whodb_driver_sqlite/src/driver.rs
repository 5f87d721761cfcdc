use rusqlite::Connection as RusqliteConnection;
use rusqlite::types::ValueRef;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use whodb_core::{
    ChatMessage, Column, Credential, DatabaseKind, DatabaseMetadata, EngineError, ExternalModel,
    ForeignKey, GetRowsResult, GraphRelation, GraphRelationKind, GraphUnit, Lease,
    ManagedConnection, Plugin, PluginConfig, Record, RowSink, SelectBuilder, SortCondition,
    SqlDialect, StorageUnit, TransactionOp, TransactionScope, TypeCategory, TypeDefinition,
    WhereCondition, app_config, connection_cache, is_safe_read_query, render_where,
    validate_column_type,
};

static TYPE_DEFINITIONS: &[TypeDefinition] = &[
    TypeDefinition::simple("INTEGER", TypeCategory::Numeric),
    TypeDefinition::simple("REAL", TypeCategory::Numeric),
    TypeDefinition::simple("NUMERIC", TypeCategory::Numeric),
    TypeDefinition::simple("TEXT", TypeCategory::Text),
    TypeDefinition::simple("BLOB", TypeCategory::Binary),
    TypeDefinition::simple("BOOLEAN", TypeCategory::Boolean),
    TypeDefinition::simple("DATETIME", TypeCategory::DateTime),
];

static ALIAS_MAP: &[(&str, &str)] = &[
    ("INT", "INTEGER"),
    ("BIGINT", "INTEGER"),
    ("SMALLINT", "INTEGER"),
    ("TINYINT", "INTEGER"),
    ("DOUBLE", "REAL"),
    ("FLOAT", "REAL"),
    ("DECIMAL", "NUMERIC"),
    ("VARCHAR", "TEXT"),
    ("CHAR", "TEXT"),
    ("CLOB", "TEXT"),
    ("BOOL", "BOOLEAN"),
    ("TIMESTAMP", "DATETIME"),
    ("DATE", "DATETIME"),
];

pub static METADATA: DatabaseMetadata = DatabaseMetadata {
    kind: DatabaseKind::Sqlite3,
    type_definitions: TYPE_DEFINITIONS,
    operators: &[
        "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "IN", "NOT IN", "IS NULL",
        "IS NOT NULL",
    ],
    alias_map: ALIAS_MAP,
};

/// SQLite SQL dialect: double-quoted identifiers, no schema prefixes.
struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn qualified_table(&self, _schema: Option<&str>, table: &str) -> String {
        self.quote_identifier(table)
    }
}

static DIALECT: SqliteDialect = SqliteDialect;

struct SqliteHandle {
    conn: Mutex<Option<RusqliteConnection>>,
    path: PathBuf,
}

impl ManagedConnection for SqliteHandle {
    fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            drop(conn);
            log::debug!("closed sqlite database {}", self.path.display());
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SqliteHandle {
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&RusqliteConnection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) => op(conn),
            None => Err(EngineError::unavailable("sqlite handle is closed")),
        }
    }
}

pub struct SqlitePlugin;

impl SqlitePlugin {
    pub fn new() -> Self {
        Self
    }

    fn acquire(&self, config: &PluginConfig) -> Result<Lease, EngineError> {
        connection_cache::global().get_or_create(&config.credential, |credential| {
            let path = resolve_database_path(credential)?;
            let conn = RusqliteConnection::open(&path)
                .map_err(|e| EngineError::unavailable(format!("could not open {path:?}: {e}")))?;
            Ok(Arc::new(SqliteHandle {
                conn: Mutex::new(Some(conn)),
                path,
            }) as Arc<dyn ManagedConnection>)
        })
    }

    fn with_conn<T>(
        &self,
        config: &PluginConfig,
        op: impl FnOnce(&RusqliteConnection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let lease = self.acquire(config)?;
        let handle = lease.downcast::<SqliteHandle>()?;
        handle.with_conn(op)
    }
}

impl Default for SqlitePlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Server mode keeps database files inside the data-dir sandbox; the CLI
/// and desktop modes take the path as given.
fn resolve_database_path(credential: &Credential) -> Result<PathBuf, EngineError> {
    let database = credential.database.trim();
    if database.is_empty() {
        return Err(EngineError::invalid_argument(
            "sqlite requires a database file name",
        ));
    }

    let config = app_config();
    if config.cli_mode || config.desktop_mode {
        return Ok(PathBuf::from(database));
    }

    if database.contains('/') || database.contains('\\') || database.contains("..") {
        return Err(EngineError::invalid_argument(
            "sqlite database names must not contain path separators",
        ));
    }
    Ok(sandbox_dir()?.join(database))
}

fn sandbox_dir() -> Result<PathBuf, EngineError> {
    let dir = whodb_core::data_dir()?.join("databases");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn map_sqlite_error(e: rusqlite::Error) -> EngineError {
    use rusqlite::ffi::ErrorCode;

    match &e {
        rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
            ErrorCode::ConstraintViolation => EngineError::conflict(e.to_string()),
            ErrorCode::CannotOpen | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                EngineError::unavailable(e.to_string())
            }
            ErrorCode::NotADatabase => EngineError::invalid_argument(e.to_string()),
            _ => EngineError::internal(e.to_string()),
        },
        rusqlite::Error::InvalidParameterName(_) => EngineError::invalid_argument(e.to_string()),
        _ => {
            let text = e.to_string();
            if text.contains("syntax error") || text.contains("no such") {
                EngineError::invalid_argument(text)
            } else {
                EngineError::internal(text)
            }
        }
    }
}

fn value_ref_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).to_string(),
        ValueRef::Blob(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
    }
}

fn read_result(
    conn: &RusqliteConnection,
    sql: &str,
    columns: Option<Vec<Column>>,
) -> Result<GetRowsResult, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;

    let column_meta: Vec<Column> = match columns {
        Some(meta) => meta,
        None => stmt
            .column_names()
            .into_iter()
            .map(|name| Column::new(name, "TEXT"))
            .collect(),
    };
    let column_count = stmt.column_count();

    let mut rows_out = Vec::new();
    let mut rows = stmt.query([]).map_err(map_sqlite_error)?;
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = row
                .get_ref(i)
                .map(value_ref_to_string)
                .unwrap_or_default();
            values.push(value);
        }
        rows_out.push(values);
    }

    Ok(GetRowsResult {
        columns: column_meta,
        rows: rows_out,
        disable_update: false,
    })
}

struct SqliteTransaction<'a> {
    conn: &'a RusqliteConnection,
}

impl TransactionScope for SqliteTransaction<'_> {
    fn execute(&mut self, query: &str) -> Result<u64, EngineError> {
        self.conn
            .execute(query, [])
            .map(|n| n as u64)
            .map_err(map_sqlite_error)
    }
}

impl Plugin for SqlitePlugin {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite3
    }

    fn is_available(&self, config: &PluginConfig) -> bool {
        self.with_conn(config, |conn| {
            conn.execute_batch("SELECT 1").map_err(map_sqlite_error)
        })
        .is_ok()
    }

    /// Lists database files in the sandbox. With `WHODB_CLI` the path is
    /// user-controlled and there is nothing to enumerate.
    fn get_databases(&self, _config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        let config = app_config();
        if config.cli_mode {
            return Err(EngineError::unsupported(
                "sqlite databases are file paths in CLI mode",
            ));
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(sandbox_dir()?)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".db") || name.ends_with(".sqlite") || name.ends_with(".sqlite3") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn get_all_schemas(&self, _config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        Ok(vec!["main".to_string()])
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        _schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        self.with_conn(config, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, type FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .map_err(map_sqlite_error)?;

            let names: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(map_sqlite_error)?
                .collect::<Result<_, _>>()
                .map_err(map_sqlite_error)?;

            let mut units = Vec::with_capacity(names.len());
            for (name, unit_type) in names {
                let count: i64 = conn
                    .query_row(
                        &format!("SELECT COUNT(*) FROM {}", DIALECT.quote_identifier(&name)),
                        [],
                        |row| row.get(0),
                    )
                    .unwrap_or(0);
                units.push(StorageUnit {
                    name,
                    attributes: vec![
                        Record::new("Type", unit_type.to_uppercase()),
                        Record::new("Count", count.to_string()),
                    ],
                });
            }
            Ok(units)
        })
    }

    fn get_columns_for_table(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
    ) -> Result<Vec<Column>, EngineError> {
        self.with_conn(config, |conn| table_columns(conn, name))
    }

    fn get_column_constraints(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
    ) -> Result<HashMap<String, BTreeMap<String, serde_json::Value>>, EngineError> {
        self.with_conn(config, |conn| {
            let sql = format!("PRAGMA table_info({})", DIALECT.quote_identifier(name));
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let mut constraints = HashMap::new();

            let rows: Vec<(String, i64, Option<String>, i64)> = stmt
                .query_map([], |row| {
                    Ok((row.get(1)?, row.get(3)?, row.get(4)?, row.get(5)?))
                })
                .map_err(map_sqlite_error)?
                .collect::<Result<_, _>>()
                .map_err(map_sqlite_error)?;

            for (column, not_null, default_value, pk) in rows {
                let mut facts = BTreeMap::new();
                facts.insert("nullable".to_string(), serde_json::Value::Bool(not_null == 0));
                if pk > 0 {
                    facts.insert("primary".to_string(), serde_json::Value::Bool(true));
                }
                if let Some(default) = default_value {
                    facts.insert("default".to_string(), serde_json::Value::String(default));
                }
                constraints.insert(column, facts);
            }
            Ok(constraints)
        })
    }

    fn get_foreign_key_relationships(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
    ) -> Result<HashMap<String, ForeignKey>, EngineError> {
        self.with_conn(config, |conn| table_foreign_keys(conn, name))
    }

    fn get_rows(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
        sort: &[SortCondition],
        page_size: u32,
        page_offset: u64,
    ) -> Result<GetRowsResult, EngineError> {
        let builder = SelectBuilder::new(&DIALECT);
        let sql = builder.build_select(None, storage_unit, filter, sort, page_size, page_offset)?;
        self.with_conn(config, |conn| {
            let columns = table_columns(conn, storage_unit).ok();
            read_result(conn, &sql, columns)
        })
    }

    fn get_row_count(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError> {
        let mut sql = format!(
            "SELECT COUNT(*) FROM {}",
            DIALECT.quote_identifier(storage_unit)
        );
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&render_where(filter, &DIALECT)?);
        }
        self.with_conn(config, |conn| {
            conn.query_row(&sql, [], |row| row.get(0))
                .map_err(map_sqlite_error)
        })
    }

    fn add_storage_unit(
        &self,
        config: &PluginConfig,
        _schema: &str,
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
            "CREATE TABLE {} ({})",
            DIALECT.quote_identifier(name),
            columns.join(", ")
        );
        self.with_conn(config, |conn| {
            conn.execute(&sql, []).map_err(map_sqlite_error)?;
            Ok(true)
        })
    }

    fn add_row(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        values: &[Record],
    ) -> Result<bool, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_insert(None, storage_unit, values)?;
        self.with_conn(config, |conn| {
            conn.execute(&sql, []).map_err(map_sqlite_error)?;
            Ok(true)
        })
    }

    fn update_storage_unit(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        values: &[Record],
        updated_columns: &[String],
    ) -> Result<bool, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_update(
            None,
            storage_unit,
            values,
            updated_columns,
        )?;
        self.with_conn(config, |conn| {
            let affected = conn.execute(&sql, []).map_err(map_sqlite_error)?;
            Ok(affected > 0)
        })
    }

    fn delete_row(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        key_values: &[Record],
    ) -> Result<bool, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_delete(None, storage_unit, key_values)?;
        self.with_conn(config, |conn| {
            let affected = conn.execute(&sql, []).map_err(map_sqlite_error)?;
            Ok(affected > 0)
        })
    }

    fn clear_table_data(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
    ) -> Result<bool, EngineError> {
        let sql = format!("DELETE FROM {}", DIALECT.quote_identifier(storage_unit));
        self.with_conn(config, |conn| {
            conn.execute(&sql, []).map_err(map_sqlite_error)?;
            Ok(true)
        })
    }

    fn get_graph(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<GraphUnit>, EngineError> {
        let units = self.get_storage_units(config, schema)?;
        self.with_conn(config, |conn| {
            let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
            let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
            for unit in &units {
                for fk in table_foreign_keys(conn, &unit.name)?.values() {
                    outgoing
                        .entry(unit.name.clone())
                        .or_default()
                        .push(fk.referenced_table.clone());
                    incoming
                        .entry(fk.referenced_table.clone())
                        .or_default()
                        .push(unit.name.clone());
                }
            }

            Ok(units
                .into_iter()
                .map(|unit| {
                    let mut relations = Vec::new();
                    for target in outgoing.get(&unit.name).into_iter().flatten() {
                        relations.push(GraphRelation {
                            name: target.clone(),
                            relation: GraphRelationKind::ManyToOne,
                        });
                    }
                    for source in incoming.get(&unit.name).into_iter().flatten() {
                        relations.push(GraphRelation {
                            name: source.clone(),
                            relation: GraphRelationKind::OneToMany,
                        });
                    }
                    GraphUnit { unit, relations }
                })
                .collect())
        })
    }

    fn raw_execute(
        &self,
        config: &PluginConfig,
        query: &str,
    ) -> Result<GetRowsResult, EngineError> {
        self.with_conn(config, |conn| {
            let column_count = conn
                .prepare(query)
                .map_err(map_sqlite_error)?
                .column_count();

            if column_count == 0 {
                let affected = conn.execute(query, []).map_err(map_sqlite_error)?;
                return Ok(GetRowsResult {
                    columns: vec![Column::new("affected", "INTEGER")],
                    rows: vec![vec![affected.to_string()]],
                    disable_update: true,
                });
            }

            let mut result = read_result(conn, query, None)?;
            result.disable_update = true;
            Ok(result)
        })
    }

    fn export_data(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        sink: &mut dyn RowSink,
        selected_rows: Option<&[Vec<String>]>,
    ) -> Result<(), EngineError> {
        self.with_conn(config, |conn| {
            let columns = table_columns(conn, storage_unit)?;
            sink.write_header(&columns)?;

            let sql = format!("SELECT * FROM {}", DIALECT.quote_identifier(storage_unit));
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query([]).map_err(map_sqlite_error)?;

            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    values.push(row.get_ref(i).map(value_ref_to_string).unwrap_or_default());
                }
                if let Some(selected) = selected_rows
                    && !selected.contains(&values)
                {
                    continue;
                }
                match sink.write_row(&values) {
                    Ok(()) => {}
                    Err(EngineError::Canceled) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    fn with_transaction(
        &self,
        config: &PluginConfig,
        op: &mut TransactionOp<'_>,
    ) -> Result<(), EngineError> {
        self.with_conn(config, |conn| {
            conn.execute_batch("BEGIN").map_err(map_sqlite_error)?;
            let mut scope = SqliteTransaction { conn };
            match op(Some(&mut scope)) {
                Ok(()) => conn.execute_batch("COMMIT").map_err(map_sqlite_error),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
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

fn table_columns(conn: &RusqliteConnection, name: &str) -> Result<Vec<Column>, EngineError> {
    let sql = format!("PRAGMA table_info({})", DIALECT.quote_identifier(name));
    let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;

    let columns: Vec<Column> = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let column_type: String = row.get(2)?;
            let not_null: i64 = row.get(3)?;
            let pk: i64 = row.get(5)?;
            Ok((name, column_type, not_null, pk))
        })
        .map_err(map_sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_sqlite_error)?
        .into_iter()
        .map(|(name, column_type, not_null, pk)| {
            let column_type = if column_type.is_empty() {
                "TEXT".to_string()
            } else {
                column_type.to_uppercase()
            };
            let mut column = Column::new(name, column_type)
                .with_extra("nullable", if not_null == 0 { "true" } else { "false" });
            if pk > 0 {
                column = column.with_extra("primary", "true");
            }
            column
        })
        .collect();

    if columns.is_empty() {
        return Err(EngineError::not_found(format!("no such table: {name}")));
    }
    Ok(columns)
}

fn table_foreign_keys(
    conn: &RusqliteConnection,
    name: &str,
) -> Result<HashMap<String, ForeignKey>, EngineError> {
    let sql = format!(
        "PRAGMA foreign_key_list({})",
        DIALECT.quote_identifier(name)
    );
    let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;

    let rows: Vec<(String, String, String)> = stmt
        .query_map([], |row| {
            let table: String = row.get(2)?;
            let from: String = row.get(3)?;
            let to: Option<String> = row.get(4)?;
            Ok((from, table, to.unwrap_or_else(|| "rowid".to_string())))
        })
        .map_err(map_sqlite_error)?
        .collect::<Result<_, _>>()
        .map_err(map_sqlite_error)?;

    Ok(rows
        .into_iter()
        .map(|(from, table, to)| {
            (
                from.clone(),
                ForeignKey {
                    column: from,
                    referenced_table: table,
                    referenced_column: to,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_resolves_common_aliases() {
        assert!(validate_column_type("varchar(80)", Some(&METADATA)).is_ok());
        assert!(validate_column_type("bool", Some(&METADATA)).is_ok());
        assert!(validate_column_type("geometry", Some(&METADATA)).is_err());
    }

    #[test]
    fn value_refs_use_canonical_encoding() {
        assert_eq!(value_ref_to_string(ValueRef::Null), "");
        assert_eq!(value_ref_to_string(ValueRef::Integer(42)), "42");
        assert_eq!(value_ref_to_string(ValueRef::Blob(&[0xab, 0x01])), "ab01");
    }
}
