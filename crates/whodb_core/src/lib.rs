mod credential;
mod error;
mod history;
mod plugin;
mod profile;
mod query_safety;
mod registry;
mod secrets;
mod type_metadata;
mod value;

pub mod config;
pub mod connection_cache;
pub mod sql;

pub use config::{AppConfig, ConfigFile, ConfigStore, LogLevel, NamedConnection, app_config,
    data_dir, init_app_config};
pub use connection_cache::{CacheOptions, ConnectionCache, Fingerprint, Lease, ManagedConnection};
pub use credential::{Credential, CredentialToken, DatabaseKind, Record};
pub use error::EngineError;
pub use history::{HistoryEntry, HistoryStore};
pub use plugin::{
    ChatMessage, Column, ExternalModel, ForeignKey, GetRowsResult, GraphRelation,
    GraphRelationKind, GraphUnit, Plugin, PluginConfig, RowSink, SortCondition, SortDirection,
    SslStatus, StorageUnit, TransactionOp, TransactionScope, WhereCondition, retry_read,
};
pub use profile::{LoginProfile, env_profiles, env_profiles_from};
pub use query_safety::{StatementKind, classify_statement, is_safe_read_query};
pub use registry::{EngineRegistry, ProfileRetriever};
pub use secrets::{
    KeyringSecretStore, NoopSecretStore, SecretStore, create_secret_store, credential_secret_ref,
};
pub use sql::{AnsiSqlDialect, SelectBuilder, SqlDialect, render_order_by, render_where};
pub use type_metadata::{
    DatabaseMetadata, TypeCategory, TypeDefinition, UnsupportedType, validate_column_type,
};
pub use value::Value;
