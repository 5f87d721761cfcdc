use crate::command::{is_denied, split_command};
use redis::{Connection as RedisConnection, ConnectionLike};
use std::any::Any;
use std::sync::{Arc, Mutex};
use whodb_core::{
    Column, Credential, DatabaseKind, EngineError, GetRowsResult, GraphUnit, Lease,
    ManagedConnection, Plugin, PluginConfig, Record, RowSink, SortCondition, StorageUnit,
    WhereCondition, connection_cache,
};

struct RedisHandle {
    conn: Mutex<Option<RedisConnection>>,
}

impl ManagedConnection for RedisHandle {
    fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            drop(conn);
            log::debug!("closed redis connection");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RedisHandle {
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut RedisConnection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(conn) => op(conn),
            None => Err(EngineError::unavailable("redis handle is closed")),
        }
    }
}

pub struct RedisPlugin;

impl RedisPlugin {
    pub fn new() -> Self {
        Self
    }

    fn acquire(&self, config: &PluginConfig) -> Result<Lease, EngineError> {
        connection_cache::global().get_or_create(&config.credential, |credential| {
            let conn = connect(credential)?;
            Ok(Arc::new(RedisHandle {
                conn: Mutex::new(Some(conn)),
            }) as Arc<dyn ManagedConnection>)
        })
    }

    fn with_conn<T>(
        &self,
        config: &PluginConfig,
        op: impl FnOnce(&mut RedisConnection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let lease = self.acquire(config)?;
        let handle = lease.downcast::<RedisHandle>()?;
        handle.with_conn(op)
    }
}

impl Default for RedisPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn connect(credential: &Credential) -> Result<RedisConnection, EngineError> {
    let scheme = if credential
        .advanced_value("tls")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    {
        "rediss"
    } else {
        "redis"
    };

    let auth = if credential.password.is_empty() {
        String::new()
    } else if credential.username.is_empty() {
        format!(":{}@", credential.password)
    } else {
        format!("{}:{}@", credential.username, credential.password)
    };

    let database = if credential.database.is_empty() {
        "0"
    } else {
        credential.database.as_str()
    };

    let url = format!(
        "{scheme}://{auth}{}:{}/{database}",
        credential.hostname,
        credential.port_or(6379)
    );

    let client = redis::Client::open(url).map_err(map_redis_error)?;
    let mut conn = client.get_connection().map_err(map_redis_error)?;
    redis::cmd("PING")
        .query::<String>(&mut conn)
        .map_err(map_redis_error)?;
    Ok(conn)
}

fn map_redis_error(e: redis::RedisError) -> EngineError {
    use redis::ErrorKind;
    match e.kind() {
        ErrorKind::AuthenticationFailed => EngineError::unauthorized(e.to_string()),
        ErrorKind::IoError | ErrorKind::ClusterDown | ErrorKind::MasterDown => {
            EngineError::unavailable(e.to_string())
        }
        ErrorKind::TypeError => EngineError::invalid_argument(e.to_string()),
        _ => {
            let text = e.to_string();
            if text.contains("NOAUTH") || text.contains("WRONGPASS") {
                EngineError::unauthorized(text)
            } else if text.contains("WRONGTYPE") {
                EngineError::invalid_argument(text)
            } else {
                EngineError::internal(text)
            }
        }
    }
}

fn key_type(conn: &mut RedisConnection, key: &str) -> Result<String, EngineError> {
    redis::cmd("TYPE")
        .arg(key)
        .query::<String>(conn)
        .map_err(map_redis_error)
}

fn scan_keys(conn: &mut RedisConnection) -> Result<Vec<String>, EngineError> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("COUNT")
            .arg(500)
            .query(conn)
            .map_err(map_redis_error)?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    keys.sort();
    Ok(keys)
}

fn reject_filter_and_sort(
    filter: Option<&WhereCondition>,
    sort: &[SortCondition],
) -> Result<(), EngineError> {
    if filter.is_some() {
        return Err(EngineError::unsupported(
            "redis keys cannot be filtered server-side",
        ));
    }
    if !sort.is_empty() {
        return Err(EngineError::unsupported(
            "redis keys cannot be sorted server-side",
        ));
    }
    Ok(())
}

fn page<T>(items: Vec<T>, page_size: u32, page_offset: u64) -> Vec<T> {
    items
        .into_iter()
        .skip(page_offset as usize)
        .take(page_size as usize)
        .collect()
}

/// Fetch the members of one key as rows. The column shape depends on the
/// key's type.
fn key_rows(conn: &mut RedisConnection, key: &str) -> Result<GetRowsResult, EngineError> {
    let kind = key_type(conn, key)?;
    match kind.as_str() {
        "string" => {
            let value: String = redis::cmd("GET")
                .arg(key)
                .query(conn)
                .map_err(map_redis_error)?;
            Ok(GetRowsResult {
                columns: vec![Column::new("value", "string")],
                rows: vec![vec![value]],
                disable_update: false,
            })
        }
        "hash" => {
            let pairs: Vec<(String, String)> = redis::cmd("HGETALL")
                .arg(key)
                .query(conn)
                .map_err(map_redis_error)?;
            Ok(GetRowsResult {
                columns: vec![Column::new("field", "string"), Column::new("value", "string")],
                rows: pairs.into_iter().map(|(f, v)| vec![f, v]).collect(),
                disable_update: false,
            })
        }
        "list" => {
            let values: Vec<String> = redis::cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query(conn)
                .map_err(map_redis_error)?;
            Ok(GetRowsResult {
                columns: vec![Column::new("index", "integer"), Column::new("value", "string")],
                rows: values
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| vec![i.to_string(), v])
                    .collect(),
                disable_update: false,
            })
        }
        "set" => {
            let mut members: Vec<String> = redis::cmd("SMEMBERS")
                .arg(key)
                .query(conn)
                .map_err(map_redis_error)?;
            members.sort();
            Ok(GetRowsResult {
                columns: vec![Column::new("member", "string")],
                rows: members.into_iter().map(|m| vec![m]).collect(),
                disable_update: false,
            })
        }
        "zset" => {
            let pairs: Vec<(String, f64)> = redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query(conn)
                .map_err(map_redis_error)?;
            Ok(GetRowsResult {
                columns: vec![Column::new("member", "string"), Column::new("score", "double")],
                rows: pairs
                    .into_iter()
                    .map(|(m, s)| vec![m, s.to_string()])
                    .collect(),
                disable_update: false,
            })
        }
        "none" => Err(EngineError::not_found(format!("no such key: {key}"))),
        other => Err(EngineError::unsupported(format!(
            "redis key type {other} is not browsable"
        ))),
    }
}

fn format_redis_value(value: &redis::Value) -> String {
    match value {
        redis::Value::Nil => String::new(),
        redis::Value::Int(i) => i.to_string(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::Okay => "OK".to_string(),
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            let parts: Vec<String> = items.iter().map(format_redis_value).collect();
            parts.join("\n")
        }
        redis::Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| format!("{}: {}", format_redis_value(k), format_redis_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        redis::Value::Double(d) => d.to_string(),
        redis::Value::Boolean(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

impl Plugin for RedisPlugin {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Redis
    }

    fn is_available(&self, config: &PluginConfig) -> bool {
        self.with_conn(config, |conn| {
            redis::cmd("PING")
                .query::<String>(conn)
                .map_err(map_redis_error)
        })
        .is_ok()
    }

    /// Logical database indexes, `0..databases`.
    fn get_databases(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        self.with_conn(config, |conn| {
            let count = redis::cmd("CONFIG")
                .arg("GET")
                .arg("databases")
                .query::<Vec<String>>(conn)
                .ok()
                .and_then(|reply| reply.get(1).and_then(|v| v.parse::<u32>().ok()))
                .unwrap_or(16);
            Ok((0..count).map(|i| i.to_string()).collect())
        })
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        _schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        self.with_conn(config, |conn| {
            let keys = scan_keys(conn)?;
            let mut units = Vec::with_capacity(keys.len());
            for key in keys {
                let kind = key_type(conn, &key)?;
                let ttl: i64 = redis::cmd("TTL")
                    .arg(&key)
                    .query(conn)
                    .map_err(map_redis_error)?;
                let ttl_text = if ttl < 0 { "none".to_string() } else { format!("{ttl}s") };
                units.push(StorageUnit {
                    name: key,
                    attributes: vec![Record::new("Type", kind), Record::new("TTL", ttl_text)],
                });
            }
            Ok(units)
        })
    }

    fn storage_unit_exists(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
    ) -> Result<bool, EngineError> {
        self.with_conn(config, |conn| {
            redis::cmd("EXISTS")
                .arg(name)
                .query::<bool>(conn)
                .map_err(map_redis_error)
        })
    }

    fn get_columns_for_table(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
    ) -> Result<Vec<Column>, EngineError> {
        self.with_conn(config, |conn| Ok(key_rows(conn, name)?.columns))
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
        reject_filter_and_sort(filter, sort)?;
        self.with_conn(config, |conn| {
            let mut result = key_rows(conn, storage_unit)?;
            result.rows = page(result.rows, page_size, page_offset);
            Ok(result)
        })
    }

    fn get_row_count(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError> {
        reject_filter_and_sort(filter, &[])?;
        self.with_conn(config, |conn| {
            let kind = key_type(conn, storage_unit)?;
            let command = match kind.as_str() {
                "string" => return Ok(1),
                "hash" => "HLEN",
                "list" => "LLEN",
                "set" => "SCARD",
                "zset" => "ZCARD",
                "none" => {
                    return Err(EngineError::not_found(format!(
                        "no such key: {storage_unit}"
                    )));
                }
                other => {
                    return Err(EngineError::unsupported(format!(
                        "redis key type {other} is not countable"
                    )));
                }
            };
            redis::cmd(command)
                .arg(storage_unit)
                .query::<i64>(conn)
                .map_err(map_redis_error)
        })
    }

    /// Creates a key. A single `value` field makes a string key; several
    /// fields make a hash.
    fn add_storage_unit(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
        fields: &[Record],
    ) -> Result<bool, EngineError> {
        self.with_conn(config, |conn| {
            match fields {
                [] => {
                    redis::cmd("SET")
                        .arg(name)
                        .arg("")
                        .query::<()>(conn)
                        .map_err(map_redis_error)?;
                }
                [only] if only.key.eq_ignore_ascii_case("value") => {
                    redis::cmd("SET")
                        .arg(name)
                        .arg(&only.value)
                        .query::<()>(conn)
                        .map_err(map_redis_error)?;
                }
                many => {
                    let mut cmd = redis::cmd("HSET");
                    cmd.arg(name);
                    for record in many {
                        cmd.arg(&record.key).arg(&record.value);
                    }
                    cmd.query::<()>(conn).map_err(map_redis_error)?;
                }
            }
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
        self.with_conn(config, |conn| {
            let kind = key_type(conn, storage_unit)?;
            match kind.as_str() {
                "hash" => {
                    let mut cmd = redis::cmd("HSET");
                    cmd.arg(storage_unit);
                    for record in values {
                        cmd.arg(&record.key).arg(&record.value);
                    }
                    cmd.query::<()>(conn).map_err(map_redis_error)?;
                }
                "list" => {
                    let mut cmd = redis::cmd("RPUSH");
                    cmd.arg(storage_unit);
                    for record in values {
                        cmd.arg(&record.value);
                    }
                    cmd.query::<()>(conn).map_err(map_redis_error)?;
                }
                "set" => {
                    let mut cmd = redis::cmd("SADD");
                    cmd.arg(storage_unit);
                    for record in values {
                        cmd.arg(&record.value);
                    }
                    cmd.query::<()>(conn).map_err(map_redis_error)?;
                }
                "zset" => {
                    let mut cmd = redis::cmd("ZADD");
                    cmd.arg(storage_unit);
                    for record in values {
                        let score = record.extras.as_ref().and_then(|e| e.get("score"));
                        cmd.arg(score.map(String::as_str).unwrap_or("0"))
                            .arg(&record.value);
                    }
                    cmd.query::<()>(conn).map_err(map_redis_error)?;
                }
                "string" | "none" => {
                    let value = values
                        .iter()
                        .find(|r| r.key.eq_ignore_ascii_case("value"))
                        .map(|r| r.value.as_str())
                        .unwrap_or_default();
                    redis::cmd("SET")
                        .arg(storage_unit)
                        .arg(value)
                        .query::<()>(conn)
                        .map_err(map_redis_error)?;
                }
                other => {
                    return Err(EngineError::unsupported(format!(
                        "cannot add members to redis key type {other}"
                    )));
                }
            }
            Ok(true)
        })
    }

    fn update_storage_unit(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        values: &[Record],
        _updated_columns: &[String],
    ) -> Result<bool, EngineError> {
        self.with_conn(config, |conn| {
            let kind = key_type(conn, storage_unit)?;
            match kind.as_str() {
                "string" => {
                    let value = values
                        .iter()
                        .find(|r| r.key.eq_ignore_ascii_case("value"))
                        .ok_or_else(|| EngineError::conflict("string update requires a value"))?;
                    redis::cmd("SET")
                        .arg(storage_unit)
                        .arg(&value.value)
                        .query::<()>(conn)
                        .map_err(map_redis_error)?;
                }
                "hash" => {
                    let field = values
                        .iter()
                        .find(|r| r.key.eq_ignore_ascii_case("field"))
                        .ok_or_else(|| EngineError::conflict("hash update requires the field"))?;
                    let value = values
                        .iter()
                        .find(|r| r.key.eq_ignore_ascii_case("value"))
                        .ok_or_else(|| EngineError::conflict("hash update requires a value"))?;
                    redis::cmd("HSET")
                        .arg(storage_unit)
                        .arg(&field.value)
                        .arg(&value.value)
                        .query::<()>(conn)
                        .map_err(map_redis_error)?;
                }
                "list" => {
                    let index = values
                        .iter()
                        .find(|r| r.key.eq_ignore_ascii_case("index"))
                        .ok_or_else(|| EngineError::conflict("list update requires the index"))?;
                    let value = values
                        .iter()
                        .find(|r| r.key.eq_ignore_ascii_case("value"))
                        .ok_or_else(|| EngineError::conflict("list update requires a value"))?;
                    redis::cmd("LSET")
                        .arg(storage_unit)
                        .arg(&index.value)
                        .arg(&value.value)
                        .query::<()>(conn)
                        .map_err(map_redis_error)?;
                }
                other => {
                    return Err(EngineError::unsupported(format!(
                        "in-place update is not supported for redis key type {other}"
                    )));
                }
            }
            Ok(true)
        })
    }

    fn delete_row(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        key_values: &[Record],
    ) -> Result<bool, EngineError> {
        self.with_conn(config, |conn| {
            let kind = key_type(conn, storage_unit)?;
            let find = |name: &str| {
                key_values
                    .iter()
                    .find(|r| r.key.eq_ignore_ascii_case(name))
                    .map(|r| r.value.clone())
            };

            let removed: i64 = match kind.as_str() {
                "string" => redis::cmd("DEL")
                    .arg(storage_unit)
                    .query(conn)
                    .map_err(map_redis_error)?,
                "hash" => {
                    let field = find("field")
                        .ok_or_else(|| EngineError::conflict("hash delete requires the field"))?;
                    redis::cmd("HDEL")
                        .arg(storage_unit)
                        .arg(field)
                        .query(conn)
                        .map_err(map_redis_error)?
                }
                "set" => {
                    let member = find("member")
                        .ok_or_else(|| EngineError::conflict("set delete requires the member"))?;
                    redis::cmd("SREM")
                        .arg(storage_unit)
                        .arg(member)
                        .query(conn)
                        .map_err(map_redis_error)?
                }
                "zset" => {
                    let member = find("member").ok_or_else(|| {
                        EngineError::conflict("sorted-set delete requires the member")
                    })?;
                    redis::cmd("ZREM")
                        .arg(storage_unit)
                        .arg(member)
                        .query(conn)
                        .map_err(map_redis_error)?
                }
                "list" => {
                    // Lists have no delete-by-index; overwrite with a
                    // sentinel and remove it.
                    let index = find("index")
                        .ok_or_else(|| EngineError::conflict("list delete requires the index"))?;
                    let sentinel = "__whodb_deleted__";
                    redis::cmd("LSET")
                        .arg(storage_unit)
                        .arg(&index)
                        .arg(sentinel)
                        .query::<()>(conn)
                        .map_err(map_redis_error)?;
                    redis::cmd("LREM")
                        .arg(storage_unit)
                        .arg(1)
                        .arg(sentinel)
                        .query(conn)
                        .map_err(map_redis_error)?
                }
                "none" => {
                    return Err(EngineError::not_found(format!(
                        "no such key: {storage_unit}"
                    )));
                }
                other => {
                    return Err(EngineError::unsupported(format!(
                        "cannot delete members from redis key type {other}"
                    )));
                }
            };
            Ok(removed > 0)
        })
    }

    fn clear_table_data(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
    ) -> Result<bool, EngineError> {
        self.with_conn(config, |conn| {
            redis::cmd("DEL")
                .arg(storage_unit)
                .query::<i64>(conn)
                .map_err(map_redis_error)?;
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
        let args = split_command(query)?;
        if is_denied(&args[0]) {
            return Err(EngineError::forbidden(format!(
                "command {} is not allowed through the gateway",
                args[0].to_uppercase()
            )));
        }

        self.with_conn(config, |conn| {
            let mut cmd = redis::cmd(&args[0]);
            for arg in &args[1..] {
                cmd.arg(arg);
            }
            let reply = conn
                .req_command(&cmd)
                .map_err(map_redis_error)?;

            Ok(GetRowsResult {
                columns: vec![Column::new("reply", "string")],
                rows: vec![vec![format_redis_value(&reply)]],
                disable_update: true,
            })
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
            let result = key_rows(conn, storage_unit)?;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_and_sorts_are_unsupported() {
        let filter = WhereCondition::atomic("field", "=", "x");
        let err = reject_filter_and_sort(Some(&filter), &[]).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
        assert!(reject_filter_and_sort(None, &[]).is_ok());
    }

    #[test]
    fn paging_applies_offset_then_limit() {
        let items: Vec<i32> = (0..10).collect();
        assert_eq!(page(items.clone(), 3, 4), vec![4, 5, 6]);
        assert_eq!(page(items, 5, 8), vec![8, 9]);
    }

    #[test]
    fn redis_values_flatten_to_text() {
        assert_eq!(format_redis_value(&redis::Value::Nil), "");
        assert_eq!(format_redis_value(&redis::Value::Int(3)), "3");
        assert_eq!(
            format_redis_value(&redis::Value::BulkString(b"hi".to_vec())),
            "hi"
        );
    }
}
