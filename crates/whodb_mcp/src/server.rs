use crate::confirmation::ConfirmationStore;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt, schemars, tool, tool_handler, tool_router,
    transport::stdio,
};
use serde::Deserialize;
use std::sync::Arc;
use whodb_core::{
    EngineError, EngineRegistry, LoginProfile, Plugin, PluginConfig, StatementKind,
    classify_statement, env_profiles,
};

/// How the server treats statements classified as mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Park the statement and require `whodb_confirm`.
    #[default]
    Confirm,
    /// Execute writes directly.
    AllowWrite,
    /// Refuse writes outright.
    ReadOnly,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ConnectionArgs {
    /// Profile id of the connection, as listed by `whodb_connections`.
    pub connection: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SchemaArgs {
    /// Profile id of the connection.
    pub connection: String,
    /// Schema to inspect; defaults to the profile's database.
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ColumnsArgs {
    /// Profile id of the connection.
    pub connection: String,
    /// Schema the table lives in; defaults to the profile's database.
    pub schema: Option<String>,
    /// Table (or collection) name.
    pub table: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct QueryArgs {
    /// Profile id of the connection.
    pub connection: String,
    /// Statement to run. Mutating statements may require confirmation.
    pub query: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ConfirmArgs {
    /// One-shot token from a `confirmation_required` response.
    pub token: String,
}

/// JSON-RPC tool server exposing a narrow, confirmation-gated subset of
/// the gateway over stdio.
///
/// Connection discovery reads the environment-profile variables only; the
/// session cookie never reaches this surface.
#[derive(Clone)]
pub struct McpGateway {
    registry: Arc<EngineRegistry>,
    mode: WriteMode,
    confirmations: Arc<ConfirmationStore>,
    tool_router: ToolRouter<Self>,
}

fn mcp_error(error: EngineError) -> McpError {
    let data = serde_json::json!({ "code": error.code() });
    match &error {
        EngineError::InvalidArgument(_) | EngineError::PayloadTooLarge(_) => {
            McpError::invalid_params(error.to_string(), Some(data))
        }
        _ => McpError::internal_error(error.to_string(), Some(data)),
    }
}

fn json_content(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(&value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

async fn blocking<T, F>(f: F) -> Result<T, McpError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| McpError::internal_error(format!("worker task failed: {e}"), None))?
        .map_err(mcp_error)
}

#[tool_router]
impl McpGateway {
    pub fn new(registry: Arc<EngineRegistry>, mode: WriteMode) -> Self {
        Self {
            registry,
            mode,
            confirmations: Arc::new(ConfirmationStore::new()),
            tool_router: Self::tool_router(),
        }
    }

    fn find_connection(&self, id: &str) -> Result<LoginProfile, McpError> {
        let profiles = env_profiles();
        profiles
            .iter()
            .enumerate()
            .find(|(index, profile)| profile.resolved_id(*index) == id)
            .map(|(_, profile)| profile.clone())
            .ok_or_else(|| {
                mcp_error(EngineError::not_found(format!("unknown connection: {id}")))
            })
    }

    fn plugin_and_config(&self, id: &str) -> Result<(Arc<dyn Plugin>, PluginConfig), McpError> {
        let profile = self.find_connection(id)?;
        let plugin = self
            .registry
            .plugin_for(&profile.credential)
            .map_err(mcp_error)?;
        Ok((plugin, PluginConfig::new(profile.credential)))
    }

    async fn run_statement(
        &self,
        connection: &str,
        query: &str,
    ) -> Result<CallToolResult, McpError> {
        let (plugin, config) = self.plugin_and_config(connection)?;
        let query = query.to_string();
        let result = blocking(move || plugin.raw_execute(&config, &query)).await?;
        json_content(serde_json::json!({
            "columns": result.columns.iter().map(|c| &c.name).collect::<Vec<_>>(),
            "rows": result.rows,
        }))
    }

    #[tool(description = "List the database connections configured through the environment")]
    async fn whodb_connections(&self) -> Result<CallToolResult, McpError> {
        let connections: Vec<serde_json::Value> = env_profiles()
            .iter()
            .enumerate()
            .map(|(index, profile)| {
                serde_json::json!({
                    "id": profile.resolved_id(index),
                    "type": profile.credential.kind.id(),
                    "hostname": profile.credential.hostname,
                    "database": profile.credential.database,
                })
            })
            .collect();
        json_content(serde_json::json!({ "connections": connections }))
    }

    #[tool(description = "List the schemas of a connection")]
    async fn whodb_schemas(
        &self,
        Parameters(args): Parameters<ConnectionArgs>,
    ) -> Result<CallToolResult, McpError> {
        let (plugin, config) = self.plugin_and_config(&args.connection)?;
        let schemas = blocking(move || plugin.get_all_schemas(&config)).await?;
        json_content(serde_json::json!({ "schemas": schemas }))
    }

    #[tool(description = "List the tables (storage units) of a schema")]
    async fn whodb_tables(
        &self,
        Parameters(args): Parameters<SchemaArgs>,
    ) -> Result<CallToolResult, McpError> {
        let (plugin, config) = self.plugin_and_config(&args.connection)?;
        let schema = args
            .schema
            .unwrap_or_else(|| config.credential.database.clone());
        let units = blocking(move || plugin.get_storage_units(&config, &schema)).await?;

        let tables: Vec<serde_json::Value> = units
            .iter()
            .map(|unit| {
                serde_json::json!({
                    "name": unit.name,
                    "attributes": unit
                        .attributes
                        .iter()
                        .map(|a| serde_json::json!({ "key": a.key, "value": a.value }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        json_content(serde_json::json!({ "tables": tables }))
    }

    #[tool(description = "List the columns of a table")]
    async fn whodb_columns(
        &self,
        Parameters(args): Parameters<ColumnsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let (plugin, config) = self.plugin_and_config(&args.connection)?;
        let schema = args
            .schema
            .unwrap_or_else(|| config.credential.database.clone());
        let table = args.table;
        let columns =
            blocking(move || plugin.get_columns_for_table(&config, &schema, &table)).await?;

        let columns: Vec<serde_json::Value> = columns
            .iter()
            .map(|column| {
                serde_json::json!({
                    "name": column.name,
                    "type": column.column_type,
                    "nullable": column.is_nullable(),
                })
            })
            .collect();
        json_content(serde_json::json!({ "columns": columns }))
    }

    #[tool(
        description = "Run a query. Mutating statements return a confirmation token unless writes are enabled"
    )]
    async fn whodb_query(
        &self,
        Parameters(args): Parameters<QueryArgs>,
    ) -> Result<CallToolResult, McpError> {
        let (plugin, _) = self.plugin_and_config(&args.connection)?;
        let kind = classify_statement(&args.query, plugin.get_database_metadata());

        if kind == StatementKind::Mutating {
            match self.mode {
                WriteMode::ReadOnly => {
                    return Err(mcp_error(EngineError::forbidden(
                        "this server is read-only; mutating statements are refused",
                    )));
                }
                WriteMode::Confirm => {
                    let token = self
                        .confirmations
                        .park(args.connection.clone(), args.query.clone());
                    return json_content(serde_json::json!({
                        "confirmation_required": true,
                        "token": token,
                        "message": "This statement would modify data. Call whodb_confirm with the token to run it.",
                    }));
                }
                WriteMode::AllowWrite => {}
            }
        }

        self.run_statement(&args.connection, &args.query).await
    }

    #[tool(description = "Run a previously parked mutating statement")]
    async fn whodb_confirm(
        &self,
        Parameters(args): Parameters<ConfirmArgs>,
    ) -> Result<CallToolResult, McpError> {
        if self.mode == WriteMode::ReadOnly {
            return Err(mcp_error(EngineError::forbidden(
                "this server is read-only; mutating statements are refused",
            )));
        }

        let pending = self.confirmations.take(&args.token).ok_or_else(|| {
            mcp_error(EngineError::not_found(
                "unknown or expired confirmation token",
            ))
        })?;

        self.run_statement(&pending.connection, &pending.query).await
    }
}

#[tool_handler]
impl ServerHandler for McpGateway {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.protocol_version = ProtocolVersion::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info = Implementation::from_build_env();
        info.instructions = Some(
            "WhoDB gateway tools. Discover connections with whodb_connections, inspect \
             schemas and tables, and run queries with whodb_query. Mutating statements \
             require confirmation through whodb_confirm unless writes are enabled."
                .to_string(),
        );
        info
    }
}

/// Serve the tool set over stdio until the client hangs up.
pub async fn serve_stdio(
    registry: Arc<EngineRegistry>,
    mode: WriteMode,
) -> Result<(), EngineError> {
    let gateway = McpGateway::new(registry, mode);
    let service = gateway
        .serve(stdio())
        .await
        .map_err(|e| EngineError::internal(format!("mcp server failed to start: {e}")))?;
    service
        .waiting()
        .await
        .map_err(|e| EngineError::internal(format!("mcp server failed: {e}")))?;
    whodb_core::connection_cache::global().shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use whodb_core::DatabaseKind;
    use whodb_test_support::FakePlugin;

    fn gateway(mode: WriteMode) -> (McpGateway, FakePlugin) {
        let plugin = FakePlugin::new(DatabaseKind::Postgres);
        let mut registry = EngineRegistry::new();
        registry.register(plugin.clone().as_plugin_arc());
        (McpGateway::new(Arc::new(registry), mode), plugin)
    }

    #[tokio::test]
    async fn mutating_queries_are_parked_until_confirmed() {
        let (gateway, plugin) = gateway(WriteMode::Confirm);

        // Resolution happens against env profiles, so fake the lookup by
        // driving the store directly.
        let token = gateway
            .confirmations
            .park("ignored".into(), "DELETE FROM users".into());
        assert_eq!(gateway.confirmations.len(), 1);

        let pending = gateway.confirmations.take(&token).unwrap();
        assert_eq!(pending.query, "DELETE FROM users");
        assert!(gateway.confirmations.is_empty());
        assert_eq!(plugin.stats().executed_queries.len(), 0);
    }

    #[test]
    fn classification_drives_the_gate() {
        assert_eq!(classify_statement("SELECT 1", None), StatementKind::Read);
        assert_eq!(
            classify_statement("-- note\nDROP TABLE users", None),
            StatementKind::Mutating
        );
    }
}
