use crate::query::{sort_to_clauses, where_to_query};
use serde_json::{Value, json};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use whodb_core::{
    Column, Credential, DatabaseKind, EngineError, GetRowsResult, GraphUnit, Lease,
    ManagedConnection, Plugin, PluginConfig, Record, RowSink, SortCondition, StorageUnit,
    WhereCondition, connection_cache,
};

const DOCUMENT_COLUMN: &str = "document";
const EXPORT_PAGE_SIZE: usize = 10_000;

/// Elasticsearch speaks HTTP+JSON natively; the handle is a pre-configured
/// blocking client plus the node's base URL.
struct ElasticHandle {
    http: reqwest::blocking::Client,
    base_url: String,
    username: String,
    password: String,
}

impl ManagedConnection for ElasticHandle {
    fn close(&self) {
        // HTTP connections are pooled inside the client; dropping the
        // entry releases them.
        log::debug!("released elasticsearch client for {}", self.base_url);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ElasticHandle {
    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.request(method, &url);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .map_err(|e| EngineError::unavailable(format!("elasticsearch request failed: {e}")))?;

        let status = response.status();
        let payload: Value = response.json().unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(payload);
        }

        let reason = payload["error"]["reason"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("elasticsearch returned {status}"));

        Err(match status.as_u16() {
            400 => EngineError::invalid_argument(reason),
            401 => EngineError::unauthorized(reason),
            403 => EngineError::forbidden(reason),
            404 => EngineError::not_found(reason),
            409 => EngineError::conflict(reason),
            502 | 503 | 504 => EngineError::unavailable(reason),
            _ => EngineError::internal(reason),
        })
    }

    fn get(&self, path: &str) -> Result<Value, EngineError> {
        self.request(reqwest::Method::GET, path, None)
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, EngineError> {
        self.request(reqwest::Method::POST, path, Some(body))
    }
}

pub struct ElasticSearchPlugin;

impl ElasticSearchPlugin {
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
        op: impl FnOnce(&ElasticHandle) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let lease = self.acquire(config)?;
        op(lease.downcast::<ElasticHandle>()?)
    }

    fn search(
        &self,
        config: &PluginConfig,
        index: &str,
        filter: Option<&WhereCondition>,
        sort: &[SortCondition],
        size: usize,
        from: u64,
    ) -> Result<Vec<Value>, EngineError> {
        let query = filter
            .map(where_to_query)
            .transpose()?
            .unwrap_or_else(|| json!({ "match_all": {} }));

        let mut body = json!({ "query": query, "from": from, "size": size });
        let sort_clauses = sort_to_clauses(sort);
        if !sort_clauses.is_empty() {
            body["sort"] = Value::Array(sort_clauses);
        }

        self.with_handle(config, |handle| {
            let reply = handle.post(&format!("/{}/_search", encode_path(index)), &body)?;
            let hits = reply["hits"]["hits"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            Ok(hits)
        })
    }
}

impl Default for ElasticSearchPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn connect(credential: &Credential) -> Result<ElasticHandle, EngineError> {
    let scheme = if credential
        .advanced_value("ssl")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    {
        "https"
    } else {
        "http"
    };
    let base_url = format!(
        "{scheme}://{}:{}",
        credential.hostname,
        credential.port_or(9200)
    );

    let http = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| EngineError::unavailable(format!("http client setup failed: {e}")))?;

    let handle = ElasticHandle {
        http,
        base_url,
        username: credential.username.clone(),
        password: credential.password.clone(),
    };
    // Fail fast if the node is unreachable or the credentials are bad.
    handle.get("/")?;
    Ok(handle)
}

fn encode_path(segment: &str) -> String {
    segment.replace('/', "%2F")
}

fn hit_to_row(hit: &Value) -> Vec<String> {
    let mut document = hit["_source"].clone();
    if let (Some(id), Some(object)) = (hit["_id"].as_str(), document.as_object_mut()) {
        object.insert("_id".to_string(), json!(id));
    }
    vec![document.to_string()]
}

fn document_columns() -> Vec<Column> {
    vec![Column::new(DOCUMENT_COLUMN, "Document")]
}

fn record_id(values: &[Record]) -> Result<String, EngineError> {
    values
        .iter()
        .find(|r| r.key == "_id")
        .map(|r| r.value.clone())
        .ok_or_else(|| EngineError::conflict("the _id field is required"))
}

fn records_to_source(values: &[Record]) -> Result<Value, EngineError> {
    if let [only] = values
        && only.key == DOCUMENT_COLUMN
    {
        return serde_json::from_str(&only.value)
            .map_err(|e| EngineError::invalid_argument(format!("malformed document: {e}")));
    }

    let mut object = serde_json::Map::new();
    for record in values {
        if record.key == "_id" {
            continue;
        }
        object.insert(record.key.clone(), crate::query::typed_json(&record.value));
    }
    Ok(Value::Object(object))
}

impl Plugin for ElasticSearchPlugin {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::ElasticSearch
    }

    fn is_available(&self, config: &PluginConfig) -> bool {
        self.with_handle(config, |handle| handle.get("/")).is_ok()
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        _schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        self.with_handle(config, |handle| {
            let reply = handle.get("/_cat/indices?format=json")?;
            let mut units: Vec<StorageUnit> = reply
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .filter_map(|entry| {
                    let name = entry["index"].as_str()?.to_string();
                    Some(StorageUnit {
                        name,
                        attributes: vec![
                            Record::new("Type", "Index"),
                            Record::new(
                                "Count",
                                entry["docs.count"].as_str().unwrap_or("0").to_string(),
                            ),
                            Record::new(
                                "Total Size",
                                entry["store.size"].as_str().unwrap_or("").to_string(),
                            ),
                            Record::new(
                                "Health",
                                entry["health"].as_str().unwrap_or("").to_string(),
                            ),
                        ],
                    })
                })
                .collect();
            units.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(units)
        })
    }

    fn get_columns_for_table(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
    ) -> Result<Vec<Column>, EngineError> {
        self.with_handle(config, |handle| {
            let reply = handle.get(&format!("/{}/_mapping", encode_path(name)))?;
            let properties = reply[name]["mappings"]["properties"]
                .as_object()
                .cloned()
                .unwrap_or_default();

            if properties.is_empty() {
                return Ok(document_columns());
            }

            let mut columns: Vec<Column> = properties
                .iter()
                .map(|(field, mapping)| {
                    let field_type = mapping["type"].as_str().unwrap_or("object");
                    Column::new(field, field_type).with_extra("nullable", "true")
                })
                .collect();
            columns.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(columns)
        })
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
        let hits = self.search(
            config,
            storage_unit,
            filter,
            sort,
            page_size as usize,
            page_offset,
        )?;
        Ok(GetRowsResult {
            columns: document_columns(),
            rows: hits.iter().map(hit_to_row).collect(),
            disable_update: false,
        })
    }

    fn get_row_count(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError> {
        let query = filter
            .map(where_to_query)
            .transpose()?
            .unwrap_or_else(|| json!({ "match_all": {} }));

        self.with_handle(config, |handle| {
            let reply = handle.post(
                &format!("/{}/_count", encode_path(storage_unit)),
                &json!({ "query": query }),
            )?;
            Ok(reply["count"].as_i64().unwrap_or(0))
        })
    }

    /// Creates an index; field records become the mapping properties.
    fn add_storage_unit(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
        fields: &[Record],
    ) -> Result<bool, EngineError> {
        let mut properties = serde_json::Map::new();
        for field in fields {
            properties.insert(field.key.clone(), json!({ "type": field.value }));
        }

        let body = if properties.is_empty() {
            json!({})
        } else {
            json!({ "mappings": { "properties": properties } })
        };

        self.with_handle(config, |handle| {
            handle.request(
                reqwest::Method::PUT,
                &format!("/{}", encode_path(name)),
                Some(&body),
            )?;
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
        let source = records_to_source(values)?;
        self.with_handle(config, |handle| {
            handle.post(&format!("/{}/_doc", encode_path(storage_unit)), &source)?;
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
        let id = record_id(values)?;
        let source = records_to_source(values)?;
        self.with_handle(config, |handle| {
            handle.post(
                &format!(
                    "/{}/_update/{}",
                    encode_path(storage_unit),
                    encode_path(&id)
                ),
                &json!({ "doc": source }),
            )?;
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
        let id = record_id(key_values)?;
        self.with_handle(config, |handle| {
            handle.request(
                reqwest::Method::DELETE,
                &format!("/{}/_doc/{}", encode_path(storage_unit), encode_path(&id)),
                None,
            )?;
            Ok(true)
        })
    }

    fn clear_table_data(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
    ) -> Result<bool, EngineError> {
        self.with_handle(config, |handle| {
            handle.post(
                &format!("/{}/_delete_by_query", encode_path(storage_unit)),
                &json!({ "query": { "match_all": {} } }),
            )?;
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

    /// Raw queries are `index\njson-body` search requests.
    fn raw_execute(
        &self,
        config: &PluginConfig,
        query: &str,
    ) -> Result<GetRowsResult, EngineError> {
        let (index, body) = query.split_once('\n').ok_or_else(|| {
            EngineError::invalid_argument(
                "expected an index name on the first line and a JSON search body after it",
            )
        })?;
        let body: Value = serde_json::from_str(body)
            .map_err(|e| EngineError::invalid_argument(format!("malformed search body: {e}")))?;

        self.with_handle(config, |handle| {
            let reply = handle.post(&format!("/{}/_search", encode_path(index.trim())), &body)?;
            let hits = reply["hits"]["hits"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            Ok(GetRowsResult {
                columns: document_columns(),
                rows: hits.iter().map(hit_to_row).collect(),
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
        sink.write_header(&document_columns())?;

        let mut from = 0u64;
        loop {
            let hits = self.search(config, storage_unit, None, &[], EXPORT_PAGE_SIZE, from)?;
            if hits.is_empty() {
                return Ok(());
            }
            from += hits.len() as u64;

            for hit in &hits {
                let row = hit_to_row(hit);
                if let Some(selected) = selected_rows
                    && !selected.contains(&row)
                {
                    continue;
                }
                match sink.write_row(&row) {
                    Ok(()) => {}
                    Err(EngineError::Canceled) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }

            if hits.len() < EXPORT_PAGE_SIZE {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_merge_the_id_into_the_document() {
        let hit = json!({ "_id": "abc", "_source": { "name": "alice" } });
        let row = hit_to_row(&hit);
        let parsed: Value = serde_json::from_str(&row[0]).unwrap();
        assert_eq!(parsed["_id"], "abc");
        assert_eq!(parsed["name"], "alice");
    }

    #[test]
    fn updates_require_an_id() {
        let values = vec![Record::new("name", "alice")];
        assert_eq!(record_id(&values).unwrap_err().code(), "CONFLICT");
    }
}
