use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder, Row, TxOpts};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use whodb_core::{
    ChatMessage, Column, Credential, DatabaseKind, DatabaseMetadata, EngineError, ExternalModel,
    ForeignKey, GetRowsResult, GraphRelation, GraphRelationKind, GraphUnit, Lease,
    ManagedConnection, Plugin, PluginConfig, Record, RowSink, SelectBuilder, SortCondition,
    SqlDialect, SslStatus, StorageUnit, TransactionOp, TransactionScope, TypeCategory,
    TypeDefinition, WhereCondition, connection_cache, is_safe_read_query, validate_column_type,
};

static TYPE_DEFINITIONS: &[TypeDefinition] = &[
    TypeDefinition::simple("TINYINT", TypeCategory::Numeric),
    TypeDefinition::simple("SMALLINT", TypeCategory::Numeric),
    TypeDefinition::simple("MEDIUMINT", TypeCategory::Numeric),
    TypeDefinition::simple("INT", TypeCategory::Numeric),
    TypeDefinition::simple("BIGINT", TypeCategory::Numeric),
    TypeDefinition::with_precision("DECIMAL", TypeCategory::Numeric, 10, 2),
    TypeDefinition::simple("FLOAT", TypeCategory::Numeric),
    TypeDefinition::simple("DOUBLE", TypeCategory::Numeric),
    TypeDefinition::with_length("VARCHAR", TypeCategory::Text, 255),
    TypeDefinition::with_length("CHAR", TypeCategory::Text, 1),
    TypeDefinition::simple("TEXT", TypeCategory::Text),
    TypeDefinition::simple("MEDIUMTEXT", TypeCategory::Text),
    TypeDefinition::simple("LONGTEXT", TypeCategory::Text),
    TypeDefinition::simple("ENUM", TypeCategory::Text),
    TypeDefinition::with_length("BINARY", TypeCategory::Binary, 1),
    TypeDefinition::with_length("VARBINARY", TypeCategory::Binary, 255),
    TypeDefinition::simple("BLOB", TypeCategory::Binary),
    TypeDefinition::simple("LONGBLOB", TypeCategory::Binary),
    TypeDefinition::simple("DATE", TypeCategory::DateTime),
    TypeDefinition::simple("TIME", TypeCategory::DateTime),
    TypeDefinition::simple("DATETIME", TypeCategory::DateTime),
    TypeDefinition::simple("TIMESTAMP", TypeCategory::DateTime),
    TypeDefinition::simple("YEAR", TypeCategory::DateTime),
    TypeDefinition::simple("BOOLEAN", TypeCategory::Boolean),
    TypeDefinition::simple("JSON", TypeCategory::Json),
];

static ALIAS_MAP: &[(&str, &str)] = &[
    ("INTEGER", "INT"),
    ("NUMERIC", "DECIMAL"),
    ("REAL", "DOUBLE"),
    ("BOOL", "BOOLEAN"),
    ("CHARACTER VARYING", "VARCHAR"),
];

static OPERATORS: &[&str] = &[
    "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "IN", "NOT IN", "IS NULL",
    "IS NOT NULL",
];

pub static METADATA: DatabaseMetadata = DatabaseMetadata {
    kind: DatabaseKind::MySQL,
    type_definitions: TYPE_DEFINITIONS,
    operators: OPERATORS,
    alias_map: ALIAS_MAP,
};

static MARIADB_METADATA: DatabaseMetadata = DatabaseMetadata {
    kind: DatabaseKind::MariaDB,
    type_definitions: TYPE_DEFINITIONS,
    operators: OPERATORS,
    alias_map: ALIAS_MAP,
};

/// MySQL dialect: backtick identifiers, schema means database.
struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }
}

static DIALECT: MySqlDialect = MySqlDialect;

struct MySqlHandle {
    conn: Mutex<Option<Conn>>,
}

impl ManagedConnection for MySqlHandle {
    fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            drop(conn);
            log::debug!("closed mysql connection");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MySqlHandle {
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Conn) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(conn) => op(conn),
            None => Err(EngineError::unavailable("mysql handle is closed")),
        }
    }
}

/// Serves both MySQL and MariaDB; the dialect and catalogs are shared.
pub struct MySqlPlugin {
    kind: DatabaseKind,
}

impl MySqlPlugin {
    pub fn new() -> Self {
        Self {
            kind: DatabaseKind::MySQL,
        }
    }

    pub fn mariadb() -> Self {
        Self {
            kind: DatabaseKind::MariaDB,
        }
    }

    fn acquire(&self, config: &PluginConfig) -> Result<Lease, EngineError> {
        connection_cache::global().get_or_create(&config.credential, |credential| {
            let conn = connect(credential)?;
            Ok(Arc::new(MySqlHandle {
                conn: Mutex::new(Some(conn)),
            }) as Arc<dyn ManagedConnection>)
        })
    }

    fn with_conn<T>(
        &self,
        config: &PluginConfig,
        op: impl FnOnce(&mut Conn) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let lease = self.acquire(config)?;
        let handle = lease.downcast::<MySqlHandle>()?;
        handle.with_conn(op)
    }
}

impl Default for MySqlPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn connect(credential: &Credential) -> Result<Conn, EngineError> {
    let mut builder = OptsBuilder::new()
        .ip_or_hostname(Some(credential.hostname.clone()))
        .tcp_port(credential.port_or(3306))
        .user(Some(credential.username.clone()))
        .pass(Some(credential.password.clone()));
    if !credential.database.is_empty() {
        builder = builder.db_name(Some(credential.database.clone()));
    }

    Conn::new(Opts::from(builder)).map_err(map_mysql_error)
}

fn map_mysql_error(e: mysql::Error) -> EngineError {
    match &e {
        mysql::Error::MySqlError(server) => match server.code {
            1062 | 1451 | 1452 | 1048 => EngineError::conflict(server.message.clone()),
            1064 | 1054 => EngineError::invalid_argument(server.message.clone()),
            1044 | 1142 => EngineError::forbidden(server.message.clone()),
            1045 => EngineError::unauthorized(server.message.clone()),
            1049 | 1146 => EngineError::not_found(server.message.clone()),
            _ => EngineError::internal(server.message.clone()),
        },
        mysql::Error::IoError(_) | mysql::Error::DriverError(_) => {
            EngineError::unavailable(e.to_string())
        }
        _ => EngineError::internal(e.to_string()),
    }
}

fn mysql_value_to_string(value: &mysql::Value, binary: bool) -> String {
    match value {
        mysql::Value::NULL => String::new(),
        mysql::Value::Bytes(bytes) => {
            if binary {
                hex::encode(bytes)
            } else {
                match std::str::from_utf8(bytes) {
                    Ok(text) => text.to_string(),
                    Err(_) => hex::encode(bytes),
                }
            }
        }
        mysql::Value::Int(i) => i.to_string(),
        mysql::Value::UInt(u) => u.to_string(),
        mysql::Value::Float(f) => f.to_string(),
        mysql::Value::Double(d) => d.to_string(),
        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            if *hour == 0 && *minute == 0 && *second == 0 && *micros == 0 {
                format!("{year:04}-{month:02}-{day:02}")
            } else if *micros == 0 {
                format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}")
            } else {
                format!(
                    "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micros:06}"
                )
            }
        }
        mysql::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = u32::from(*hours) + days * 24;
            if *micros == 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
            }
        }
    }
}

fn row_to_strings(row: &Row) -> Vec<String> {
    let columns = row.columns_ref();
    (0..columns.len())
        .map(|i| {
            let binary = columns[i]
                .flags()
                .contains(mysql::consts::ColumnFlags::BINARY_FLAG)
                && matches!(
                    columns[i].column_type(),
                    mysql::consts::ColumnType::MYSQL_TYPE_BLOB
                        | mysql::consts::ColumnType::MYSQL_TYPE_LONG_BLOB
                        | mysql::consts::ColumnType::MYSQL_TYPE_MEDIUM_BLOB
                        | mysql::consts::ColumnType::MYSQL_TYPE_TINY_BLOB
                        | mysql::consts::ColumnType::MYSQL_TYPE_STRING
                        | mysql::consts::ColumnType::MYSQL_TYPE_VAR_STRING
                );
            row.as_ref(i)
                .map(|v| mysql_value_to_string(v, binary))
                .unwrap_or_default()
        })
        .collect()
}

fn columns_from_row(row: &Row) -> Vec<Column> {
    row.columns_ref()
        .iter()
        .map(|c| Column::new(c.name_str().to_string(), format!("{:?}", c.column_type())))
        .collect()
}

struct MySqlTransaction<'a> {
    tx: mysql::Transaction<'a>,
}

impl TransactionScope for MySqlTransaction<'_> {
    fn execute(&mut self, query: &str) -> Result<u64, EngineError> {
        self.tx.query_drop(query).map_err(map_mysql_error)?;
        Ok(self.tx.affected_rows())
    }
}

impl Plugin for MySqlPlugin {
    fn kind(&self) -> DatabaseKind {
        self.kind
    }

    fn is_available(&self, config: &PluginConfig) -> bool {
        self.with_conn(config, |conn| {
            conn.query_drop("SELECT 1").map_err(map_mysql_error)
        })
        .is_ok()
    }

    fn get_databases(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.with_conn(config, |conn| {
            conn.query(
                "SELECT schema_name FROM information_schema.schemata ORDER BY schema_name",
            )
            .map_err(map_mysql_error)
        })
    }

    /// MySQL schemas and databases are the same namespace.
    fn get_all_schemas(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.get_databases(config)
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        self.with_conn(config, |conn| {
            let rows: Vec<(String, String, Option<u64>, Option<u64>)> = conn
                .exec(
                    "SELECT table_name, table_type, \
                            data_length + index_length AS total_size, table_rows \
                     FROM information_schema.tables \
                     WHERE table_schema = ? ORDER BY table_name",
                    (schema,),
                )
                .map_err(map_mysql_error)?;

            Ok(rows
                .into_iter()
                .map(|(name, table_type, total_size, count)| StorageUnit {
                    name,
                    attributes: vec![
                        Record::new("Type", table_type),
                        Record::new(
                            "Total Size",
                            total_size.map(|s| s.to_string()).unwrap_or_default(),
                        ),
                        Record::new("Count", count.map(|c| c.to_string()).unwrap_or_default()),
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
        self.with_conn(config, |conn| table_columns(conn, schema, name))
    }

    fn get_column_constraints(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<HashMap<String, BTreeMap<String, serde_json::Value>>, EngineError> {
        self.with_conn(config, |conn| {
            let rows: Vec<(String, String, String, Option<String>)> = conn
                .exec(
                    "SELECT column_name, is_nullable, column_key, column_default \
                     FROM information_schema.columns \
                     WHERE table_schema = ? AND table_name = ?",
                    (schema, name),
                )
                .map_err(map_mysql_error)?;

            let mut constraints = HashMap::new();
            for (column, nullable, key, default) in rows {
                let mut facts = BTreeMap::new();
                facts.insert(
                    "nullable".to_string(),
                    serde_json::Value::Bool(nullable == "YES"),
                );
                if key == "PRI" {
                    facts.insert("primary".to_string(), serde_json::Value::Bool(true));
                }
                if key == "UNI" {
                    facts.insert("unique".to_string(), serde_json::Value::Bool(true));
                }
                if let Some(default) = default {
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
        schema: &str,
        name: &str,
    ) -> Result<HashMap<String, ForeignKey>, EngineError> {
        self.with_conn(config, |conn| {
            let rows: Vec<(String, String, String)> = conn
                .exec(
                    "SELECT column_name, referenced_table_name, referenced_column_name \
                     FROM information_schema.key_column_usage \
                     WHERE table_schema = ? AND table_name = ? \
                       AND referenced_table_name IS NOT NULL",
                    (schema, name),
                )
                .map_err(map_mysql_error)?;

            Ok(rows
                .into_iter()
                .map(|(column, referenced_table, referenced_column)| {
                    (
                        column.clone(),
                        ForeignKey {
                            column,
                            referenced_table,
                            referenced_column,
                        },
                    )
                })
                .collect())
        })
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
        self.with_conn(config, |conn| {
            let rows: Vec<Row> = conn.query(&sql).map_err(map_mysql_error)?;
            let columns = match table_columns(conn, schema, storage_unit) {
                Ok(columns) => columns,
                Err(_) => rows.first().map(columns_from_row).unwrap_or_default(),
            };
            Ok(GetRowsResult {
                columns,
                rows: rows.iter().map(row_to_strings).collect(),
                disable_update: false,
            })
        })
    }

    fn get_row_count(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_count(Some(schema), storage_unit, filter)?;
        self.with_conn(config, |conn| {
            conn.query_first::<i64, _>(&sql)
                .map_err(map_mysql_error)?
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
            "CREATE TABLE {} ({})",
            DIALECT.qualified_table(Some(schema), name),
            columns.join(", ")
        );
        self.with_conn(config, |conn| {
            conn.query_drop(&sql).map_err(map_mysql_error)?;
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
        self.with_conn(config, |conn| {
            conn.query_drop(&sql).map_err(map_mysql_error)?;
            Ok(true)
        })
    }

    fn update_storage_unit(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        values: &[Record],
        updated_columns: &[String],
    ) -> Result<bool, EngineError> {
        let sql = SelectBuilder::new(&DIALECT).build_update(
            Some(schema),
            storage_unit,
            values,
            updated_columns,
        )?;
        self.with_conn(config, |conn| {
            conn.query_drop(&sql).map_err(map_mysql_error)?;
            Ok(conn.affected_rows() > 0)
        })
    }

    fn delete_row(
        &self,
        config: &PluginConfig,
        schema: &str,
        storage_unit: &str,
        key_values: &[Record],
    ) -> Result<bool, EngineError> {
        let sql =
            SelectBuilder::new(&DIALECT).build_delete(Some(schema), storage_unit, key_values)?;
        self.with_conn(config, |conn| {
            conn.query_drop(&sql).map_err(map_mysql_error)?;
            Ok(conn.affected_rows() > 0)
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
        self.with_conn(config, |conn| {
            conn.query_drop(&sql).map_err(map_mysql_error)?;
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
            let rows: Vec<(String, String)> = conn
                .exec(
                    "SELECT table_name, referenced_table_name \
                     FROM information_schema.key_column_usage \
                     WHERE table_schema = ? AND referenced_table_name IS NOT NULL",
                    (schema,),
                )
                .map_err(map_mysql_error)?;

            let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
            let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
            for (table, referenced) in rows {
                outgoing.entry(table.clone()).or_default().push(referenced.clone());
                incoming.entry(referenced).or_default().push(table);
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
            let rows: Vec<Row> = conn.query(query).map_err(map_mysql_error)?;

            if rows.is_empty() {
                return Ok(GetRowsResult {
                    columns: vec![Column::new("affected", "BIGINT")],
                    rows: vec![vec![conn.affected_rows().to_string()]],
                    disable_update: true,
                });
            }

            Ok(GetRowsResult {
                columns: rows.first().map(columns_from_row).unwrap_or_default(),
                rows: rows.iter().map(row_to_strings).collect(),
                disable_update: true,
            })
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
        self.with_conn(config, |conn| {
            let columns = table_columns(conn, schema, storage_unit)?;
            sink.write_header(&columns)?;

            let sql = format!(
                "SELECT * FROM {}",
                DIALECT.qualified_table(Some(schema), storage_unit)
            );
            let rows: Vec<Row> = conn.query(&sql).map_err(map_mysql_error)?;
            for row in &rows {
                let values = row_to_strings(row);
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
            let tx = conn
                .start_transaction(TxOpts::default())
                .map_err(map_mysql_error)?;
            let mut scope = MySqlTransaction { tx };
            match op(Some(&mut scope)) {
                Ok(()) => scope.tx.commit().map_err(map_mysql_error),
                Err(e) => {
                    let _ = scope.tx.rollback();
                    Err(e)
                }
            }
        })
    }

    fn get_database_metadata(&self) -> Option<&'static DatabaseMetadata> {
        match self.kind {
            DatabaseKind::MariaDB => Some(&MARIADB_METADATA),
            _ => Some(&METADATA),
        }
    }

    fn get_ssl_status(&self, config: &PluginConfig) -> Result<Option<SslStatus>, EngineError> {
        self.with_conn(config, |conn| {
            let row: Option<(String, String)> = conn
                .query_first("SHOW STATUS LIKE 'Ssl_cipher'")
                .map_err(map_mysql_error)?;
            Ok(row.map(|(_, cipher)| SslStatus {
                enabled: !cipher.is_empty(),
                detail: if cipher.is_empty() { None } else { Some(cipher) },
            }))
        })
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

fn table_columns(conn: &mut Conn, schema: &str, name: &str) -> Result<Vec<Column>, EngineError> {
    let rows: Vec<(String, String, String)> = conn
        .exec(
            "SELECT column_name, column_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? \
             ORDER BY ordinal_position",
            (schema, name),
        )
        .map_err(map_mysql_error)?;

    if rows.is_empty() {
        return Err(EngineError::not_found(format!(
            "no such table: {schema}.{name}"
        )));
    }

    Ok(rows
        .into_iter()
        .map(|(column_name, column_type, nullable)| {
            Column::new(column_name, column_type.to_uppercase()).with_extra(
                "nullable",
                if nullable == "YES" { "true" } else { "false" },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_accepts_common_mysql_types() {
        assert!(validate_column_type("varchar(191)", Some(&METADATA)).is_ok());
        assert!(validate_column_type("integer", Some(&METADATA)).is_ok());
        assert!(validate_column_type("geometry", Some(&METADATA)).is_err());
    }

    #[test]
    fn values_encode_canonically() {
        assert_eq!(mysql_value_to_string(&mysql::Value::NULL, false), "");
        assert_eq!(
            mysql_value_to_string(&mysql::Value::Bytes(b"hello".to_vec()), false),
            "hello"
        );
        assert_eq!(
            mysql_value_to_string(&mysql::Value::Bytes(vec![0xff, 0x00]), true),
            "ff00"
        );
        assert_eq!(
            mysql_value_to_string(&mysql::Value::Date(2024, 3, 1, 0, 0, 0, 0), false),
            "2024-03-01"
        );
        assert_eq!(
            mysql_value_to_string(&mysql::Value::Date(2024, 3, 1, 12, 30, 5, 0), false),
            "2024-03-01T12:30:05"
        );
    }

    #[test]
    fn dialect_uses_backticks() {
        assert_eq!(DIALECT.quote_identifier("use`rs"), "`use``rs`");
        assert_eq!(
            DIALECT.qualified_table(Some("app"), "users"),
            "`app`.`users`"
        );
    }
}
