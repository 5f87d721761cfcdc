use crate::filter::{sort_to_document, typed_value, where_to_document};
use bson::{Bson, Document, doc};
use mongodb::sync::{Client, Database};
use std::any::Any;
use std::sync::{Arc, Mutex};
use whodb_core::{
    Column, Credential, DatabaseKind, EngineError, GetRowsResult, GraphUnit, Lease,
    ManagedConnection, Plugin, PluginConfig, Record, RowSink, SortCondition, StorageUnit,
    WhereCondition, connection_cache,
};

const DOCUMENT_COLUMN: &str = "document";

struct MongoHandle {
    client: Mutex<Option<Client>>,
}

impl ManagedConnection for MongoHandle {
    fn close(&self) {
        if let Some(client) = self.client.lock().unwrap_or_else(|e| e.into_inner()).take() {
            drop(client);
            log::debug!("closed mongodb connection");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MongoHandle {
    fn with_client<T>(
        &self,
        op: impl FnOnce(&Client) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let guard = self.client.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(client) => op(client),
            None => Err(EngineError::unavailable("mongodb handle is closed")),
        }
    }
}

pub struct MongoPlugin;

impl MongoPlugin {
    pub fn new() -> Self {
        Self
    }

    fn acquire(&self, config: &PluginConfig) -> Result<Lease, EngineError> {
        connection_cache::global().get_or_create(&config.credential, |credential| {
            let client = connect(credential)?;
            Ok(Arc::new(MongoHandle {
                client: Mutex::new(Some(client)),
            }) as Arc<dyn ManagedConnection>)
        })
    }

    fn with_database<T>(
        &self,
        config: &PluginConfig,
        op: impl FnOnce(&Database) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let database = config.credential.database.clone();
        if database.is_empty() {
            return Err(EngineError::invalid_argument(
                "mongodb requires a database name",
            ));
        }
        let lease = self.acquire(config)?;
        let handle = lease.downcast::<MongoHandle>()?;
        handle.with_client(|client| op(&client.database(&database)))
    }
}

impl Default for MongoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn connect(credential: &Credential) -> Result<Client, EngineError> {
    let host = &credential.hostname;
    let port = credential.port_or(27017);
    let auth_source = credential
        .advanced_value("authSource")
        .or_else(|| credential.advanced_value("auth database"))
        .unwrap_or("admin");

    let uri = if credential.username.is_empty() {
        format!("mongodb://{host}:{port}/")
    } else {
        format!(
            "mongodb://{}:{}@{host}:{port}/?authSource={auth_source}",
            encode_userinfo(&credential.username),
            encode_userinfo(&credential.password),
        )
    };

    let client = Client::with_uri_str(&uri).map_err(map_mongo_error)?;
    // The driver connects lazily; force a round-trip so a bad target fails
    // here instead of on the first real call.
    client.list_database_names().run().map_err(map_mongo_error)?;
    Ok(client)
}

fn encode_userinfo(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

fn map_mongo_error(e: mongodb::error::Error) -> EngineError {
    let text = e.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("authentication") || lowered.contains("unauthorized") {
        EngineError::unauthorized(text)
    } else if lowered.contains("e11000") || lowered.contains("duplicate key") {
        EngineError::conflict(text)
    } else if lowered.contains("server selection")
        || lowered.contains("timed out")
        || lowered.contains("connection")
        || lowered.contains("dns")
    {
        EngineError::unavailable(text)
    } else {
        EngineError::internal(text)
    }
}

fn document_row(document: Document) -> Vec<String> {
    vec![Bson::Document(document).into_relaxed_extjson().to_string()]
}

fn document_columns() -> Vec<Column> {
    vec![Column::new(DOCUMENT_COLUMN, "Document")]
}

/// Build an insert/update document from wire records. A single record
/// keyed `document` carries a whole JSON object; otherwise each record is
/// one typed field.
fn records_to_document(values: &[Record]) -> Result<Document, EngineError> {
    if let [only] = values
        && only.key == DOCUMENT_COLUMN
    {
        let json: serde_json::Value = serde_json::from_str(&only.value)
            .map_err(|e| EngineError::invalid_argument(format!("malformed document: {e}")))?;
        return bson::to_document(&json)
            .map_err(|e| EngineError::invalid_argument(format!("malformed document: {e}")));
    }

    let mut document = Document::new();
    for record in values {
        document.insert(record.key.clone(), typed_value(&record.key, &record.value));
    }
    Ok(document)
}

impl Plugin for MongoPlugin {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::MongoDB
    }

    fn is_available(&self, config: &PluginConfig) -> bool {
        self.acquire(config)
            .and_then(|lease| {
                lease.downcast::<MongoHandle>()?.with_client(|client| {
                    client.list_database_names().run().map_err(map_mongo_error)
                })
            })
            .is_ok()
    }

    fn get_databases(&self, config: &PluginConfig) -> Result<Vec<String>, EngineError> {
        let lease = self.acquire(config)?;
        let handle = lease.downcast::<MongoHandle>()?;
        handle.with_client(|client| {
            client.list_database_names().run().map_err(map_mongo_error)
        })
    }

    fn get_storage_units(
        &self,
        config: &PluginConfig,
        _schema: &str,
    ) -> Result<Vec<StorageUnit>, EngineError> {
        self.with_database(config, |db| {
            let mut names = db.list_collection_names().run().map_err(map_mongo_error)?;
            names.sort();

            Ok(names
                .into_iter()
                .map(|name| {
                    let count = db
                        .collection::<Document>(&name)
                        .estimated_document_count()
                        .run()
                        .unwrap_or(0);
                    StorageUnit {
                        name,
                        attributes: vec![
                            Record::new("Type", "Collection"),
                            Record::new("Count", count.to_string()),
                        ],
                    }
                })
                .collect())
        })
    }

    /// Columns are sampled from one document; collections are schemaless.
    fn get_columns_for_table(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
    ) -> Result<Vec<Column>, EngineError> {
        self.with_database(config, |db| {
            let sample = db
                .collection::<Document>(name)
                .find_one(Document::new())
                .run()
                .map_err(map_mongo_error)?;

            let Some(sample) = sample else {
                return Ok(document_columns());
            };

            Ok(sample
                .iter()
                .map(|(field, value)| {
                    Column::new(field, bson_type_name(value)).with_extra("nullable", "true")
                })
                .collect())
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
        let filter_doc = filter.map(where_to_document).transpose()?.unwrap_or_default();
        self.with_database(config, |db| {
            let cursor = db
                .collection::<Document>(storage_unit)
                .find(filter_doc)
                .sort(sort_to_document(sort))
                .skip(page_offset)
                .limit(i64::from(page_size))
                .run()
                .map_err(map_mongo_error)?;

            let documents: Vec<Document> = cursor
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_mongo_error)?;

            Ok(GetRowsResult {
                columns: document_columns(),
                rows: documents.into_iter().map(document_row).collect(),
                disable_update: false,
            })
        })
    }

    fn get_row_count(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<i64, EngineError> {
        let filter_doc = filter.map(where_to_document).transpose()?.unwrap_or_default();
        self.with_database(config, |db| {
            let count = db
                .collection::<Document>(storage_unit)
                .count_documents(filter_doc)
                .run()
                .map_err(map_mongo_error)?;
            Ok(count as i64)
        })
    }

    /// Collections are schemaless, so the field list is advisory only.
    fn add_storage_unit(
        &self,
        config: &PluginConfig,
        _schema: &str,
        name: &str,
        _fields: &[Record],
    ) -> Result<bool, EngineError> {
        self.with_database(config, |db| {
            db.create_collection(name).run().map_err(map_mongo_error)?;
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
        let document = records_to_document(values)?;
        self.with_database(config, |db| {
            db.collection::<Document>(storage_unit)
                .insert_one(document)
                .run()
                .map_err(map_mongo_error)?;
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
        let id = values
            .iter()
            .find(|r| r.key == "_id")
            .ok_or_else(|| EngineError::conflict("update requires the _id field"))?;

        let mut changes = Document::new();
        for record in values {
            if record.key == "_id" {
                continue;
            }
            if !updated_columns.is_empty() && !updated_columns.iter().any(|c| c == &record.key) {
                continue;
            }
            changes.insert(record.key.clone(), typed_value(&record.key, &record.value));
        }
        if changes.is_empty() {
            return Err(EngineError::invalid_argument("no fields to update"));
        }

        let filter = doc! { "_id": typed_value("_id", &id.value) };
        self.with_database(config, |db| {
            let result = db
                .collection::<Document>(storage_unit)
                .update_one(filter, doc! { "$set": changes })
                .run()
                .map_err(map_mongo_error)?;
            Ok(result.matched_count > 0)
        })
    }

    fn delete_row(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
        key_values: &[Record],
    ) -> Result<bool, EngineError> {
        if key_values.is_empty() {
            return Err(EngineError::conflict("delete requires key values"));
        }
        let mut filter = Document::new();
        for record in key_values {
            filter.insert(record.key.clone(), typed_value(&record.key, &record.value));
        }

        self.with_database(config, |db| {
            let result = db
                .collection::<Document>(storage_unit)
                .delete_one(filter)
                .run()
                .map_err(map_mongo_error)?;
            Ok(result.deleted_count > 0)
        })
    }

    fn clear_table_data(
        &self,
        config: &PluginConfig,
        _schema: &str,
        storage_unit: &str,
    ) -> Result<bool, EngineError> {
        self.with_database(config, |db| {
            db.collection::<Document>(storage_unit)
                .delete_many(Document::new())
                .run()
                .map_err(map_mongo_error)?;
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

    /// Raw queries are database commands in JSON form.
    fn raw_execute(
        &self,
        config: &PluginConfig,
        query: &str,
    ) -> Result<GetRowsResult, EngineError> {
        let json: serde_json::Value = serde_json::from_str(query).map_err(|e| {
            EngineError::invalid_argument(format!("expected a JSON database command: {e}"))
        })?;
        let command = bson::to_document(&json)
            .map_err(|e| EngineError::invalid_argument(format!("malformed command: {e}")))?;

        self.with_database(config, |db| {
            let reply = db.run_command(command).run().map_err(map_mongo_error)?;
            Ok(GetRowsResult {
                columns: document_columns(),
                rows: vec![document_row(reply)],
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
        self.with_database(config, |db| {
            sink.write_header(&document_columns())?;
            let cursor = db
                .collection::<Document>(storage_unit)
                .find(Document::new())
                .run()
                .map_err(map_mongo_error)?;

            for document in cursor {
                let row = document_row(document.map_err(map_mongo_error)?);
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
            Ok(())
        })
    }
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "Double",
        Bson::String(_) => "String",
        Bson::Array(_) => "Array",
        Bson::Document(_) => "Document",
        Bson::Boolean(_) => "Boolean",
        Bson::Null => "Null",
        Bson::Int32(_) => "Int32",
        Bson::Int64(_) => "Int64",
        Bson::ObjectId(_) => "ObjectId",
        Bson::DateTime(_) => "Date",
        Bson::Timestamp(_) => "Timestamp",
        Bson::Binary(_) => "Binary",
        Bson::Decimal128(_) => "Decimal128",
        _ => "Other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_build_typed_documents() {
        let values = vec![Record::new("name", "alice"), Record::new("age", "30")];
        let document = records_to_document(&values).unwrap();
        assert_eq!(document, doc! { "name": "alice", "age": 30i64 });
    }

    #[test]
    fn whole_document_records_parse_json() {
        let values = vec![Record::new("document", r#"{"name":"alice","tags":["a"]}"#)];
        let document = records_to_document(&values).unwrap();
        assert_eq!(document.get_str("name").unwrap(), "alice");
    }

    #[test]
    fn malformed_document_is_invalid_argument() {
        let values = vec![Record::new("document", "{not json")];
        assert!(records_to_document(&values).is_err());
    }

    #[test]
    fn userinfo_is_percent_encoded() {
        assert_eq!(encode_userinfo("p@ss:word"), "p%40ss%3Aword");
        assert_eq!(encode_userinfo("alice"), "alice");
    }
}
