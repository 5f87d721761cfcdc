use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use native_tls::TlsConnector;
use postgres::{Client, NoTls, SimpleQueryMessage};
use postgres_native_tls::MakeTlsConnector;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use whodb_core::{
    ChatMessage, Column, Credential, DatabaseKind, DatabaseMetadata, EngineError, ExternalModel,
    ForeignKey, GetRowsResult, GraphRelation, GraphRelationKind, GraphUnit, Lease,
    ManagedConnection, Plugin, PluginConfig, Record, RowSink, SelectBuilder, SortCondition,
    SqlDialect, SslStatus, StorageUnit, TransactionOp, TransactionScope, TypeCategory,
    TypeDefinition, Value, WhereCondition, connection_cache, is_safe_read_query, render_where,
    validate_column_type,
};

static TYPE_DEFINITIONS: &[TypeDefinition] = &[
    TypeDefinition::simple("SMALLINT", TypeCategory::Numeric),
    TypeDefinition::simple("INTEGER", TypeCategory::Numeric),
    TypeDefinition::simple("BIGINT", TypeCategory::Numeric),
    TypeDefinition::with_precision("NUMERIC", TypeCategory::Numeric, 10, 2),
    TypeDefinition::simple("REAL", TypeCategory::Numeric),
    TypeDefinition::simple("DOUBLE PRECISION", TypeCategory::Numeric),
    TypeDefinition::simple("SERIAL", TypeCategory::Numeric),
    TypeDefinition::simple("BIGSERIAL", TypeCategory::Numeric),
    TypeDefinition::with_length("VARCHAR", TypeCategory::Text, 255),
    TypeDefinition::with_length("CHAR", TypeCategory::Text, 1),
    TypeDefinition::simple("TEXT", TypeCategory::Text),
    TypeDefinition::simple("UUID", TypeCategory::Text),
    TypeDefinition::simple("BYTEA", TypeCategory::Binary),
    TypeDefinition::simple("DATE", TypeCategory::DateTime),
    TypeDefinition::simple("TIME", TypeCategory::DateTime),
    TypeDefinition::simple("TIMESTAMP", TypeCategory::DateTime),
    TypeDefinition::simple("TIMESTAMPTZ", TypeCategory::DateTime),
    TypeDefinition::simple("INTERVAL", TypeCategory::DateTime),
    TypeDefinition::simple("BOOLEAN", TypeCategory::Boolean),
    TypeDefinition::simple("JSON", TypeCategory::Json),
    TypeDefinition::simple("JSONB", TypeCategory::Json),
    TypeDefinition::simple("INET", TypeCategory::Other),
    TypeDefinition::simple("CIDR", TypeCategory::Other),
];

static ALIAS_MAP: &[(&str, &str)] = &[
    ("INT", "INTEGER"),
    ("INT2", "SMALLINT"),
    ("INT4", "INTEGER"),
    ("INT8", "BIGINT"),
    ("FLOAT4", "REAL"),
    ("FLOAT8", "DOUBLE PRECISION"),
    ("DECIMAL", "NUMERIC"),
    ("CHARACTER VARYING", "VARCHAR"),
    ("CHARACTER", "CHAR"),
    ("BOOL", "BOOLEAN"),
    ("TIMESTAMP WITH TIME ZONE", "TIMESTAMPTZ"),
    ("TIMESTAMP WITHOUT TIME ZONE", "TIMESTAMP"),
];

pub static METADATA: DatabaseMetadata = DatabaseMetadata {
    kind: DatabaseKind::Postgres,
    type_definitions: TYPE_DEFINITIONS,
    operators: &[
        "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "ILIKE", "IN", "NOT IN",
        "IS NULL", "IS NOT NULL",
    ],
    alias_map: ALIAS_MAP,
};

struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn supports_returning(&self) -> bool {
        true
    }
}

static DIALECT: PostgresDialect = PostgresDialect;

struct PostgresHandle {
    client: Mutex<Option<Client>>,
}

impl ManagedConnection for PostgresHandle {
    fn close(&self) {
        if let Some(client) = self.client.lock().unwrap_or_else(|e| e.into_inner()).take() {
            drop(client);
            log::debug!("closed postgres connection");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl PostgresHandle {
    fn with_client<T>(
        &self,
        op: impl FnOnce(&mut Client) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut guard = self.client.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(client) => op(client),
            None => Err(EngineError::unavailable("postgres handle is closed")),
        }
    }
}

pub struct PostgresPlugin;

impl PostgresPlugin {
    pub fn new() -> Self {
        Self
    }

    fn acquire(&self, config: &PluginConfig) -> Result<Lease, EngineError> {
        connection_cache::global().get_or_create(&config.credential, |credential| {
            let client = connect(credential)?;
            Ok(Arc::new(PostgresHandle {
                client: Mutex::new(Some(client)),
            }) as Arc<dyn ManagedConnection>)
        })
    }

    fn with_client<T>(
        &self,
        config: &PluginConfig,
        op: impl FnOnce(&mut Client) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let lease = self.acquire(config)?;
        let handle = lease.downcast::<PostgresHandle>()?;
        handle.with_client(op)
    }
}

impl Default for PostgresPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn connect(credential: &Credential) -> Result<Client, EngineError> {
    let mut pg_config = postgres::Config::new();
    pg_config
        .host(&credential.hostname)
        .port(credential.port_or(5432))
        .user(&credential.username)
        .password(&credential.password)
        .connect_timeout(Duration::from_secs(10));
    if !credential.database.is_empty() {
        pg_config.dbname(&credential.database);
    }

    let ssl_mode = credential
        .advanced_value("ssl mode")
        .or_else(|| credential.advanced_value("sslmode"))
        .unwrap_or("disable")
        .to_ascii_lowercase();

    let result = if ssl_mode == "disable" {
        pg_config.connect(NoTls)
    } else {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(ssl_mode != "verify-full")
            .build()
            .map_err(|e| EngineError::unavailable(format!("TLS setup failed: {e}")))?;
        pg_config.connect(MakeTlsConnector::new(connector))
    };

    result.map_err(|e| classify_connect_error(&e, &credential.hostname))
}

fn classify_connect_error(e: &postgres::Error, host: &str) -> EngineError {
    let text = e.to_string();
    if text.contains("password authentication failed") || text.contains("authentication") {
        EngineError::unauthorized(format!("postgres rejected the credentials: {text}"))
    } else if text.contains("does not exist") {
        EngineError::not_found(text)
    } else {
        EngineError::unavailable(format!("could not connect to {host}: {text}"))
    }
}

fn map_pg_error(e: postgres::Error) -> EngineError {
    let Some(db_error) = e.as_db_error() else {
        // No server error attached means the transport broke.
        return EngineError::unavailable(e.to_string());
    };

    let code = db_error.code().code();
    match code {
        c if c.starts_with("23") => EngineError::conflict(db_error.message().to_string()),
        c if c.starts_with("42") && c != "42501" => {
            EngineError::invalid_argument(db_error.message().to_string())
        }
        "42501" => EngineError::forbidden(db_error.message().to_string()),
        "28000" | "28P01" => EngineError::unauthorized(db_error.message().to_string()),
        "3D000" | "3F000" => EngineError::not_found(db_error.message().to_string()),
        "57014" => EngineError::Canceled,
        _ => EngineError::internal(db_error.message().to_string()),
    }
}

/// Encode one column of a row into the canonical wire string.
fn pg_value_to_string(row: &postgres::Row, idx: usize) -> String {
    let type_name = row.columns()[idx].type_().name();

    fn get<'a, T: postgres::types::FromSql<'a>>(
        row: &'a postgres::Row,
        idx: usize,
    ) -> Option<Option<T>> {
        row.try_get::<_, Option<T>>(idx).ok()
    }

    let value = match type_name {
        "bool" => get::<bool>(row, idx).map(|v| v.map(Value::Bool)),
        "int2" => get::<i16>(row, idx).map(|v| v.map(|n| Value::Int(n as i64))),
        "int4" => get::<i32>(row, idx).map(|v| v.map(|n| Value::Int(n as i64))),
        "int8" => get::<i64>(row, idx).map(|v| v.map(Value::Int)),
        "float4" => get::<f32>(row, idx).map(|v| v.map(|n| Value::Float(n as f64))),
        "float8" => get::<f64>(row, idx).map(|v| v.map(Value::Float)),
        "bytea" => get::<Vec<u8>>(row, idx).map(|v| v.map(Value::Bytes)),
        "json" | "jsonb" => get::<serde_json::Value>(row, idx)
            .map(|v| v.map(|j| Value::Json(j.to_string()))),
        "uuid" => get::<uuid::Uuid>(row, idx).map(|v| v.map(|u| Value::Text(u.to_string()))),
        "timestamptz" => {
            get::<DateTime<Utc>>(row, idx).map(|v| v.map(Value::DateTime))
        }
        "timestamp" => get::<NaiveDateTime>(row, idx)
            .map(|v| v.map(|dt| Value::Text(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))),
        "date" => get::<NaiveDate>(row, idx).map(|v| v.map(Value::Date)),
        "time" => get::<NaiveTime>(row, idx).map(|v| v.map(Value::Time)),
        "_text" | "_varchar" => get::<Vec<String>>(row, idx).map(|v| {
            v.map(|items| Value::Text(format!("{{{}}}", items.join(","))))
        }),
        "_int4" => get::<Vec<i32>>(row, idx).map(|v| {
            v.map(|items| {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                Value::Text(format!("{{{}}}", parts.join(",")))
            })
        }),
        _ => get::<String>(row, idx).map(|v| v.map(Value::Text)),
    };

    match value {
        Some(Some(v)) => v.to_wire_string(),
        Some(None) => String::new(),
        // The type has no direct mapping; fall back to text casts done by
        // the raw path, or the empty string when even that fails.
        None => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .unwrap_or_default(),
    }
}

fn typed_result(rows: &[postgres::Row], columns: Vec<Column>) -> GetRowsResult {
    let data = rows
        .iter()
        .map(|row| {
            (0..row.len())
                .map(|idx| pg_value_to_string(row, idx))
                .collect()
        })
        .collect();
    GetRowsResult {
        columns,
        rows: data,
        disable_update: false,
    }
}

fn columns_from_rows(rows: &[postgres::Row]) -> Vec<Column> {
    match rows.first() {
        Some(row) => row
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_().name().to_uppercase()))
            .collect(),
        None => Vec::new(),
    }
}

struct PostgresTransaction<'a> {
    tx: postgres::Transaction<'a>,
}

impl TransactionScope for PostgresTransaction<'_> {
    fn execute(&mut self, query: &str) -> Result<u64, EngineError> {
        self.tx.execute(query, &[]).map_err(map_pg_error)
    }
}

impl Plugin for PostgresPlugin {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn is_available(&self, config: &PluginConfig) -> bool {
        self.with_client(config, |client| {
            client.simple_query("SELECT 1").map_err(map_pg_error)
        })
        .is_ok()
    }

    fn get_databases(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.with_client(config, |client| {
            let rows = client
                .query(
                    "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
                    &[],
                )
                .map_err(map_pg_error)?;
            Ok(rows.iter().map(|r| r.get(0)).collect())
        })
    }

    fn get_all_schemas(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.with_client(config, |client| {
            let rows = client
                .query(
                    "SELECT schema_name FROM information_schema.schemata \
                     WHERE schema_name NOT IN ('pg_catalog', 'information_schema') \
                     ORDER BY schema_name",
                    &[],
                )
                .map_err(map_pg_error)?;
            Ok(rows.iter().map(|r| r.get(0)).collect())
        })
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        self.with_client(config, |client| {
            let rows = client
                .query(
                    r#"
                    SELECT
                        t.table_name,
                        t.table_type,
                        pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size,
                        GREATEST(c.reltuples::bigint, 0) AS estimated_count
                    FROM information_schema.tables t
                    JOIN pg_namespace n ON n.nspname = t.table_schema
                    JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = t.table_name
                    WHERE t.table_schema = $1
                    ORDER BY t.table_name
                    "#,
                    &[&schema],
                )
                .map_err(map_pg_error)?;

            Ok(rows
                .iter()
                .map(|row| {
                    let name: String = row.get(0);
                    let table_type: String = row.get(1);
                    let total_size: String = row.get(2);
                    let count: i64 = row.get(3);
                    StorageUnit {
                        name,
                        attributes: vec![
                            Record::new("Type", table_type),
                            Record::new("Total Size", total_size),
                            Record::new("Count", count.to_string()),
                        ],
                    }
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
        self.with_client(config, |client| table_columns(client, schema, name))
    }

    fn get_column_constraints(
        &self,
        config: &PluginConfig,
        schema: &str,
        name: &str,
    ) -> Result<HashMap<String, BTreeMap<String, serde_json::Value>>, EngineError> {
        self.with_client(config, |client| {
            let mut constraints: HashMap<String, BTreeMap<String, serde_json::Value>> =
                HashMap::new();

            let rows = client
                .query(
                    "SELECT column_name, is_nullable, column_default \
                     FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2",
                    &[&schema, &name],
                )
                .map_err(map_pg_error)?;
            for row in &rows {
                let column: String = row.get(0);
                let nullable: String = row.get(1);
                let default: Option<String> = row.get(2);
                let facts = constraints.entry(column).or_default();
                facts.insert(
                    "nullable".to_string(),
                    serde_json::Value::Bool(nullable == "YES"),
                );
                if let Some(default) = default {
                    facts.insert("default".to_string(), serde_json::Value::String(default));
                }
            }

            let rows = client
                .query(
                    "SELECT kcu.column_name, tc.constraint_type \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                      AND tc.table_schema = kcu.table_schema \
                     WHERE tc.table_schema = $1 AND tc.table_name = $2",
                    &[&schema, &name],
                )
                .map_err(map_pg_error)?;
            for row in &rows {
                let column: String = row.get(0);
                let kind: String = row.get(1);
                let facts = constraints.entry(column).or_default();
                match kind.as_str() {
                    "PRIMARY KEY" => {
                        facts.insert("primary".to_string(), serde_json::Value::Bool(true))
                    }
                    "UNIQUE" => facts.insert("unique".to_string(), serde_json::Value::Bool(true)),
                    other => facts.insert(
                        other.to_ascii_lowercase().replace(' ', "_"),
                        serde_json::Value::Bool(true),
                    ),
                };
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
        self.with_client(config, |client| {
            let rows = client
                .query(FOREIGN_KEY_QUERY, &[&schema, &Some(name)])
                .map_err(map_pg_error)?;
            Ok(rows
                .iter()
                .map(|row| {
                    let column: String = row.get(1);
                    (
                        column.clone(),
                        ForeignKey {
                            column,
                            referenced_table: row.get(2),
                            referenced_column: row.get(3),
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
        self.with_client(config, |client| {
            let rows = client.query(&sql, &[]).map_err(map_pg_error)?;
            let columns = match table_columns(client, schema, storage_unit) {
                Ok(columns) => columns,
                Err(_) => columns_from_rows(&rows),
            };
            Ok(typed_result(&rows, columns))
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
        self.with_client(config, |client| {
            let row = client.query_one(&sql, &[]).map_err(map_pg_error)?;
            Ok(row.get(0))
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
        self.with_client(config, |client| {
            client.batch_execute(&sql).map_err(map_pg_error)?;
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
        self.with_client(config, |client| {
            client.execute(&sql, &[]).map_err(map_pg_error)?;
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
        self.with_client(config, |client| {
            let affected = client.execute(&sql, &[]).map_err(map_pg_error)?;
            Ok(affected > 0)
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
        self.with_client(config, |client| {
            let affected = client.execute(&sql, &[]).map_err(map_pg_error)?;
            Ok(affected > 0)
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
        self.with_client(config, |client| {
            client.batch_execute(&sql).map_err(map_pg_error)?;
            Ok(true)
        })
    }

    fn get_graph(
        &self,
        config: &PluginConfig,
        schema: &str,
    ) -> Result<Vec<GraphUnit>, EngineError> {
        let units = self.get_storage_units(config, schema)?;
        self.with_client(config, |client| {
            let rows = client
                .query(FOREIGN_KEY_QUERY, &[&schema, &None::<&str>])
                .map_err(map_pg_error)?;

            let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
            let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
            for row in &rows {
                let table: String = row.get(0);
                let referenced: String = row.get(2);
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

    /// Raw queries go through the simple-query protocol so every value
    /// arrives as text without type mapping.
    fn raw_execute(
        &self,
        config: &PluginConfig,
        query: &str,
    ) -> Result<GetRowsResult, EngineError> {
        self.with_client(config, |client| {
            let messages = client.simple_query(query).map_err(map_pg_error)?;

            let mut columns: Vec<Column> = Vec::new();
            let mut rows: Vec<Vec<String>> = Vec::new();
            let mut affected: Option<u64> = None;

            for message in messages {
                match message {
                    SimpleQueryMessage::Row(row) => {
                        if columns.is_empty() {
                            columns = row
                                .columns()
                                .iter()
                                .map(|c| Column::new(c.name(), "TEXT"))
                                .collect();
                        }
                        rows.push(
                            (0..row.len())
                                .map(|i| row.get(i).unwrap_or_default().to_string())
                                .collect(),
                        );
                    }
                    SimpleQueryMessage::CommandComplete(n) => affected = Some(n),
                    _ => {}
                }
            }

            if columns.is_empty() {
                return Ok(GetRowsResult {
                    columns: vec![Column::new("affected", "BIGINT")],
                    rows: vec![vec![affected.unwrap_or(0).to_string()]],
                    disable_update: true,
                });
            }

            Ok(GetRowsResult {
                columns,
                rows,
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
        self.with_client(config, |client| {
            let columns = table_columns(client, schema, storage_unit)?;
            sink.write_header(&columns)?;

            let sql = format!(
                "SELECT * FROM {}",
                DIALECT.qualified_table(Some(schema), storage_unit)
            );
            let rows = client.query(&sql, &[]).map_err(map_pg_error)?;
            for row in &rows {
                let values: Vec<String> =
                    (0..row.len()).map(|i| pg_value_to_string(row, i)).collect();
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
        self.with_client(config, |client| {
            let tx = client.transaction().map_err(map_pg_error)?;
            let mut scope = PostgresTransaction { tx };
            match op(Some(&mut scope)) {
                Ok(()) => scope.tx.commit().map_err(map_pg_error),
                Err(e) => {
                    let _ = scope.tx.rollback();
                    Err(e)
                }
            }
        })
    }

    fn get_database_metadata(&self) -> Option<&'static DatabaseMetadata> {
        Some(&METADATA)
    }

    fn get_ssl_status(&self, config: &PluginConfig) -> Result<Option<SslStatus>, EngineError> {
        self.with_client(config, |client| {
            let row = client
                .query_opt(
                    "SELECT ssl FROM pg_stat_ssl WHERE pid = pg_backend_pid()",
                    &[],
                )
                .map_err(map_pg_error)?;
            Ok(row.map(|r| SslStatus {
                enabled: r.get(0),
                detail: None,
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

const FOREIGN_KEY_QUERY: &str = r#"
    SELECT
        tc.table_name,
        kcu.column_name,
        ccu.table_name AS referenced_table,
        ccu.column_name AS referenced_column
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name
     AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON ccu.constraint_name = tc.constraint_name
     AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
      AND tc.table_schema = $1
      AND ($2::text IS NULL OR tc.table_name = $2)
"#;

fn table_columns(client: &mut Client, schema: &str, name: &str) -> Result<Vec<Column>, EngineError> {
    let rows = client
        .query(
            "SELECT column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&schema, &name],
        )
        .map_err(map_pg_error)?;

    if rows.is_empty() {
        return Err(EngineError::not_found(format!(
            "no such table: {schema}.{name}"
        )));
    }

    Ok(rows
        .iter()
        .map(|row| {
            let column_name: String = row.get(0);
            let data_type: String = row.get(1);
            let nullable: String = row.get(2);
            Column::new(column_name, data_type.to_uppercase()).with_extra(
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
    fn metadata_accepts_common_postgres_types() {
        assert!(validate_column_type("character varying(64)", Some(&METADATA)).is_ok());
        assert!(validate_column_type("timestamp with time zone", Some(&METADATA)).is_ok());
        assert!(validate_column_type("int8", Some(&METADATA)).is_ok());
        assert!(validate_column_type("hstore", Some(&METADATA)).is_err());
    }

    #[test]
    fn dialect_quotes_and_supports_ilike() {
        assert_eq!(DIALECT.quote_identifier("users"), "\"users\"");
        assert!(METADATA.supports_operator("ILIKE"));
        let filter = WhereCondition::atomic("name", "ILIKE", "%a%");
        assert_eq!(
            render_where(&filter, &DIALECT).unwrap(),
            "\"name\" ILIKE '%a%'"
        );
    }
}
