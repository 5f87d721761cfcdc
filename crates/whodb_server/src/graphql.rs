use crate::auth::{ResolvedCredential, login_cookie, logout_cookie};
use crate::server::ServerState;
use async_graphql::http::GraphiQLSource;
use async_graphql::{
    Context, EmptySubscription, Enum, Error, ErrorExtensions, InputObject, Object, Schema,
    SimpleObject,
};
use axum::http::header;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use whodb_core::{
    ChatMessage, Column, Credential, DatabaseKind, EngineError, ExternalModel, GetRowsResult,
    GraphRelationKind, GraphUnit, HistoryEntry, Plugin, PluginConfig, Record, SortCondition,
    SortDirection, StorageUnit, WhereCondition, retry_read,
};

/// GraphQL complexity cap; generous for the frontend, hostile to
/// pathological selections.
pub const COMPLEXITY_LIMIT: usize = 100;

/// Session-process settings toggled through `UpdateSettings`.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub metrics_enabled: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
        }
    }
}

pub type SharedSettings = Arc<RwLock<GatewaySettings>>;

/// Origin header of the current request, used for cookie attributes.
#[derive(Debug, Clone, Default)]
pub struct RequestOrigin(pub Option<String>);

pub type GatewaySchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub fn build_schema(state: ServerState) -> GatewaySchema {
    let mut builder = Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(state.clone())
        .limit_complexity(COMPLEXITY_LIMIT);
    if !state.dev_mode {
        builder = builder.disable_introspection();
    }
    builder.finish()
}

pub fn graphiql_html(endpoint: &str) -> String {
    GraphiQLSource::build().endpoint(endpoint).finish()
}

// --- Wire types ---

#[derive(SimpleObject)]
struct GqlRecord {
    key: String,
    value: String,
}

impl From<&Record> for GqlRecord {
    fn from(record: &Record) -> Self {
        Self {
            key: record.key.clone(),
            value: record.value.clone(),
        }
    }
}

#[derive(SimpleObject)]
struct GqlColumn {
    name: String,
    #[graphql(name = "type")]
    column_type: String,
    nullable: bool,
}

impl From<&Column> for GqlColumn {
    fn from(column: &Column) -> Self {
        Self {
            name: column.name.clone(),
            column_type: column.column_type.clone(),
            nullable: column.is_nullable(),
        }
    }
}

#[derive(SimpleObject)]
struct GqlRowsResult {
    columns: Vec<GqlColumn>,
    rows: Vec<Vec<String>>,
    disable_update: bool,
}

impl From<GetRowsResult> for GqlRowsResult {
    fn from(result: GetRowsResult) -> Self {
        Self {
            columns: result.columns.iter().map(GqlColumn::from).collect(),
            rows: result.rows,
            disable_update: result.disable_update,
        }
    }
}

#[derive(SimpleObject)]
struct GqlStorageUnit {
    name: String,
    attributes: Vec<GqlRecord>,
}

impl From<&StorageUnit> for GqlStorageUnit {
    fn from(unit: &StorageUnit) -> Self {
        Self {
            name: unit.name.clone(),
            attributes: unit.attributes.iter().map(GqlRecord::from).collect(),
        }
    }
}

#[derive(SimpleObject)]
struct GqlGraphRelation {
    name: String,
    relationship: String,
}

#[derive(SimpleObject)]
struct GqlGraphUnit {
    unit: GqlStorageUnit,
    relations: Vec<GqlGraphRelation>,
}

impl From<&GraphUnit> for GqlGraphUnit {
    fn from(graph_unit: &GraphUnit) -> Self {
        Self {
            unit: GqlStorageUnit::from(&graph_unit.unit),
            relations: graph_unit
                .relations
                .iter()
                .map(|relation| GqlGraphRelation {
                    name: relation.name.clone(),
                    relationship: relation_name(relation.relation).to_string(),
                })
                .collect(),
        }
    }
}

fn relation_name(kind: GraphRelationKind) -> &'static str {
    match kind {
        GraphRelationKind::OneToOne => "OneToOne",
        GraphRelationKind::OneToMany => "OneToMany",
        GraphRelationKind::ManyToOne => "ManyToOne",
        GraphRelationKind::ManyToMany => "ManyToMany",
        GraphRelationKind::Unknown => "Unknown",
    }
}

#[derive(SimpleObject)]
struct GqlProfile {
    id: String,
    #[graphql(name = "type")]
    kind: String,
    database: String,
    is_environment_defined: bool,
}

#[derive(SimpleObject)]
struct GqlSettings {
    metrics_enabled: bool,
}

#[derive(SimpleObject)]
struct GqlSslStatus {
    enabled: bool,
    detail: Option<String>,
}

#[derive(SimpleObject)]
struct GqlStatus {
    status: bool,
}

#[derive(SimpleObject)]
struct GqlChatMessage {
    #[graphql(name = "type")]
    kind: String,
    text: String,
    result: Option<GqlRowsResult>,
}

impl From<ChatMessage> for GqlChatMessage {
    fn from(message: ChatMessage) -> Self {
        Self {
            kind: message.kind,
            text: message.text,
            result: message.result.map(GqlRowsResult::from),
        }
    }
}

#[derive(InputObject)]
struct RecordInput {
    key: String,
    value: String,
    extras: Option<Vec<ExtraInput>>,
}

#[derive(InputObject)]
struct ExtraInput {
    key: String,
    value: String,
}

impl RecordInput {
    fn into_record(self) -> Record {
        Record {
            key: self.key,
            value: self.value,
            extras: self.extras.map(|extras| {
                extras
                    .into_iter()
                    .map(|extra| (extra.key, extra.value))
                    .collect()
            }),
        }
    }
}

#[derive(InputObject)]
struct LoginInput {
    #[graphql(name = "type")]
    kind: String,
    id: Option<String>,
    hostname: Option<String>,
    username: Option<String>,
    password: Option<String>,
    database: Option<String>,
    advanced: Option<Vec<RecordInput>>,
    access_token: Option<String>,
}

impl LoginInput {
    fn into_credential(self) -> Result<Credential, EngineError> {
        let kind: DatabaseKind = self.kind.parse()?;
        let mut credential = Credential::new(kind);
        credential.id = self.id;
        credential.hostname = self.hostname.unwrap_or_default();
        credential.username = self.username.unwrap_or_default();
        credential.password = self.password.unwrap_or_default();
        credential.database = self.database.unwrap_or_default();
        credential.advanced = self
            .advanced
            .unwrap_or_default()
            .into_iter()
            .map(RecordInput::into_record)
            .collect();
        credential.access_token = self.access_token;
        Ok(credential)
    }
}

#[derive(Enum, Copy, Clone, Eq, PartialEq)]
enum WhereKind {
    Atomic,
    And,
    Or,
}

#[derive(InputObject)]
struct WhereInput {
    #[graphql(name = "type")]
    kind: WhereKind,
    children: Option<Vec<WhereInput>>,
    key: Option<String>,
    operator: Option<String>,
    value: Option<String>,
    column_type: Option<String>,
}

impl WhereInput {
    fn into_condition(self) -> Result<WhereCondition, EngineError> {
        match self.kind {
            WhereKind::Atomic => Ok(WhereCondition::Atomic {
                key: self
                    .key
                    .ok_or_else(|| EngineError::invalid_argument("atomic filter needs a key"))?,
                operator: self.operator.unwrap_or_else(|| "=".to_string()),
                value: self.value.unwrap_or_default(),
                column_type: self.column_type,
            }),
            WhereKind::And => Ok(WhereCondition::And(Self::children(self.children)?)),
            WhereKind::Or => Ok(WhereCondition::Or(Self::children(self.children)?)),
        }
    }

    fn children(children: Option<Vec<WhereInput>>) -> Result<Vec<WhereCondition>, EngineError> {
        children
            .unwrap_or_default()
            .into_iter()
            .map(WhereInput::into_condition)
            .collect()
    }
}

#[derive(Enum, Copy, Clone, Eq, PartialEq)]
enum SortOrder {
    Asc,
    Desc,
}

#[derive(InputObject)]
struct SortInput {
    column: String,
    direction: SortOrder,
}

impl SortInput {
    fn into_condition(self) -> SortCondition {
        SortCondition {
            column: self.column,
            direction: match self.direction {
                SortOrder::Asc => SortDirection::Asc,
                SortOrder::Desc => SortDirection::Desc,
            },
        }
    }
}

// --- Resolver plumbing ---

fn gql_error(error: EngineError) -> Error {
    let code = error.code();
    Error::new(error.to_string()).extend_with(|_, extensions| extensions.set("code", code))
}

fn state<'a>(ctx: &Context<'a>) -> Result<&'a ServerState, Error> {
    ctx.data::<ServerState>()
        .map_err(|_| gql_error(EngineError::internal("server state is missing")))
}

/// One lookup: the resolver middleware bound the credential to the request.
fn current(ctx: &Context<'_>) -> Result<(Arc<dyn Plugin>, PluginConfig), Error> {
    let state = state(ctx)?;
    let resolved = ctx
        .data::<ResolvedCredential>()
        .ok()
        .and_then(|r| r.0.clone())
        .ok_or_else(|| gql_error(EngineError::unauthorized("this operation requires a session")))?;

    let plugin = state.registry.plugin_for(&resolved).map_err(gql_error)?;
    Ok((plugin, PluginConfig::new(resolved)))
}

/// Drivers are synchronous; hop to the blocking pool for every call.
async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| gql_error(EngineError::internal(format!("worker task failed: {e}"))))?
        .map_err(gql_error)
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn database(&self, ctx: &Context<'_>) -> Result<Vec<String>, Error> {
        let (plugin, config) = current(ctx)?;
        blocking(move || retry_read(&config, || plugin.get_databases(&config))).await
    }

    async fn schema(&self, ctx: &Context<'_>) -> Result<Vec<String>, Error> {
        let (plugin, config) = current(ctx)?;
        blocking(move || retry_read(&config, || plugin.get_all_schemas(&config))).await
    }

    async fn storage_unit(
        &self,
        ctx: &Context<'_>,
        schema: String,
    ) -> Result<Vec<GqlStorageUnit>, Error> {
        let (plugin, config) = current(ctx)?;
        let units = blocking(move || {
            retry_read(&config, || plugin.get_storage_units(&config, &schema))
        })
        .await?;
        Ok(units.iter().map(GqlStorageUnit::from).collect())
    }

    async fn column(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
    ) -> Result<Vec<GqlColumn>, Error> {
        let (plugin, config) = current(ctx)?;
        let columns = blocking(move || {
            retry_read(&config, || {
                plugin.get_columns_for_table(&config, &schema, &storage_unit)
            })
        })
        .await?;
        Ok(columns.iter().map(GqlColumn::from).collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn row(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
        #[graphql(name = "where")] filter: Option<WhereInput>,
        sort: Option<Vec<SortInput>>,
        page_size: i32,
        page_offset: i64,
    ) -> Result<GqlRowsResult, Error> {
        if page_size <= 0 {
            return Err(gql_error(EngineError::invalid_argument(
                "pageSize must be positive",
            )));
        }
        let page_offset = u64::try_from(page_offset)
            .map_err(|_| gql_error(EngineError::invalid_argument("pageOffset must not be negative")))?;

        let (plugin, config) = current(ctx)?;
        let filter = filter.map(WhereInput::into_condition).transpose().map_err(gql_error)?;
        let sort: Vec<SortCondition> = sort
            .unwrap_or_default()
            .into_iter()
            .map(SortInput::into_condition)
            .collect();

        let result = blocking(move || {
            retry_read(&config, || {
                plugin.get_rows(
                    &config,
                    &schema,
                    &storage_unit,
                    filter.as_ref(),
                    &sort,
                    page_size as u32,
                    page_offset,
                )
            })
        })
        .await?;
        Ok(result.into())
    }

    async fn row_count(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
        #[graphql(name = "where")] filter: Option<WhereInput>,
    ) -> Result<i64, Error> {
        let (plugin, config) = current(ctx)?;
        let filter = filter.map(WhereInput::into_condition).transpose().map_err(gql_error)?;
        blocking(move || {
            retry_read(&config, || {
                plugin.get_row_count(&config, &schema, &storage_unit, filter.as_ref())
            })
        })
        .await
    }

    async fn graph(&self, ctx: &Context<'_>, schema: String) -> Result<Vec<GqlGraphUnit>, Error> {
        let (plugin, config) = current(ctx)?;
        let units = blocking(move || {
            retry_read(&config, || plugin.get_graph(&config, &schema))
        })
        .await?;
        Ok(units.iter().map(GqlGraphUnit::from).collect())
    }

    /// Profiles are discoverable without a session.
    async fn profiles(&self, ctx: &Context<'_>) -> Result<Vec<GqlProfile>, Error> {
        let state = state(ctx)?;
        Ok(state
            .registry
            .get_profiles()
            .into_iter()
            .map(|(id, profile)| GqlProfile {
                id,
                kind: profile.credential.kind.id().to_string(),
                database: profile.credential.database.clone(),
                is_environment_defined: profile.credential.is_profile,
            })
            .collect())
    }

    async fn settings(&self, ctx: &Context<'_>) -> Result<GqlSettings, Error> {
        let state = state(ctx)?;
        let settings = state
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner());
        Ok(GqlSettings {
            metrics_enabled: settings.metrics_enabled,
        })
    }

    async fn ssl_status(&self, ctx: &Context<'_>) -> Result<Option<GqlSslStatus>, Error> {
        let (plugin, config) = current(ctx)?;
        let status = blocking(move || {
            retry_read(&config, || plugin.get_ssl_status(&config))
        })
        .await?;
        Ok(status.map(|s| GqlSslStatus {
            enabled: s.enabled,
            detail: s.detail,
        }))
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    async fn login(&self, ctx: &Context<'_>, credentials: LoginInput) -> Result<GqlStatus, Error> {
        let state = state(ctx)?;
        let mut credential = credentials.into_credential().map_err(gql_error)?;

        if state.config.api_gateway {
            let accepted = credential
                .access_token
                .as_deref()
                .is_some_and(|token| state.config.accepts_token(token));
            if !accepted {
                return Err(gql_error(EngineError::unauthorized(
                    "the access token is not accepted by this gateway",
                )));
            }
        }

        let plugin = state.registry.plugin_for(&credential).map_err(gql_error)?;
        let probe = credential.clone();
        let available =
            blocking(move || Ok(plugin.is_available(&PluginConfig::new(probe)))).await?;
        if !available {
            return Err(gql_error(EngineError::unauthorized(
                "could not reach the database with these credentials",
            )));
        }

        if state.config.desktop_mode
            && let Some(id) = credential.id.clone()
        {
            credential.is_profile = true;
            if let Err(e) = state.secret_store.store_credential(&id, &credential) {
                log::warn!("could not persist credential to the keyring: {e}");
            }
        }

        let origin = ctx
            .data::<RequestOrigin>()
            .map(|o| o.0.clone())
            .unwrap_or_default();
        let token = credential.encode_token();
        ctx.insert_http_header(header::SET_COOKIE, login_cookie(&token, origin.as_deref()));
        Ok(GqlStatus { status: true })
    }

    async fn login_with_profile(
        &self,
        ctx: &Context<'_>,
        id: String,
    ) -> Result<GqlStatus, Error> {
        let state = state(ctx)?;
        let profile = state
            .registry
            .find_profile(&id)
            .map(|p| p.credential)
            .or_else(|| {
                if state.config.desktop_mode {
                    state.secret_store.get_credential(&id).ok().flatten()
                } else {
                    None
                }
            })
            .ok_or_else(|| gql_error(EngineError::unauthorized(format!("unknown profile: {id}"))))?;

        let plugin = state.registry.plugin_for(&profile).map_err(gql_error)?;
        let probe = profile.clone();
        let available =
            blocking(move || Ok(plugin.is_available(&PluginConfig::new(probe)))).await?;
        if !available {
            return Err(gql_error(EngineError::unauthorized(
                "could not reach the database for this profile",
            )));
        }

        // The cookie only needs to reference the profile.
        let mut reference = Credential::new(profile.kind);
        reference.id = Some(id);
        let origin = ctx
            .data::<RequestOrigin>()
            .map(|o| o.0.clone())
            .unwrap_or_default();
        ctx.insert_http_header(
            header::SET_COOKIE,
            login_cookie(&reference.encode_token(), origin.as_deref()),
        );
        Ok(GqlStatus { status: true })
    }

    async fn logout(&self, ctx: &Context<'_>) -> Result<GqlStatus, Error> {
        if let Some(credential) = ctx
            .data::<ResolvedCredential>()
            .ok()
            .and_then(|r| r.0.clone())
        {
            whodb_core::connection_cache::global().remove(&credential);
        }
        ctx.insert_http_header(header::SET_COOKIE, logout_cookie());
        Ok(GqlStatus { status: true })
    }

    async fn add_storage_unit(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
        fields: Vec<RecordInput>,
    ) -> Result<GqlStatus, Error> {
        let (plugin, config) = current(ctx)?;
        let fields: Vec<Record> = fields.into_iter().map(RecordInput::into_record).collect();
        let status = blocking(move || {
            plugin.add_storage_unit(&config, &schema, &storage_unit, &fields)
        })
        .await?;
        Ok(GqlStatus { status })
    }

    async fn add_row(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
        values: Vec<RecordInput>,
    ) -> Result<GqlStatus, Error> {
        let (plugin, config) = current(ctx)?;
        let values: Vec<Record> = values.into_iter().map(RecordInput::into_record).collect();
        let status =
            blocking(move || plugin.add_row(&config, &schema, &storage_unit, &values)).await?;
        Ok(GqlStatus { status })
    }

    async fn update_storage_unit(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
        values: Vec<RecordInput>,
        updated_columns: Vec<String>,
    ) -> Result<GqlStatus, Error> {
        let (plugin, config) = current(ctx)?;
        let values: Vec<Record> = values.into_iter().map(RecordInput::into_record).collect();
        let status = blocking(move || {
            plugin.update_storage_unit(&config, &schema, &storage_unit, &values, &updated_columns)
        })
        .await?;
        Ok(GqlStatus { status })
    }

    async fn delete_row(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
        values: Vec<RecordInput>,
    ) -> Result<GqlStatus, Error> {
        let (plugin, config) = current(ctx)?;
        let values: Vec<Record> = values.into_iter().map(RecordInput::into_record).collect();
        let status =
            blocking(move || plugin.delete_row(&config, &schema, &storage_unit, &values)).await?;
        Ok(GqlStatus { status })
    }

    async fn clear_table_data(
        &self,
        ctx: &Context<'_>,
        schema: String,
        storage_unit: String,
    ) -> Result<GqlStatus, Error> {
        let (plugin, config) = current(ctx)?;
        let status =
            blocking(move || plugin.clear_table_data(&config, &schema, &storage_unit)).await?;
        Ok(GqlStatus { status })
    }

    async fn raw_execute(
        &self,
        ctx: &Context<'_>,
        query: String,
    ) -> Result<GqlRowsResult, Error> {
        let state = state(ctx)?.clone();
        let (plugin, config) = current(ctx)?;

        let started = Instant::now();
        let history_query = query.clone();
        let kind = config.credential.kind;
        let database = config.credential.database.clone();

        let result = blocking(move || plugin.raw_execute(&config, &query)).await?;

        if let Some(history) = state.history.as_ref() {
            let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
            history.add(HistoryEntry::new(
                history_query,
                kind,
                if database.is_empty() { None } else { Some(database) },
                started.elapsed(),
                Some(result.rows.len()),
            ));
            if let Err(e) = history.save() {
                log::debug!("could not persist query history: {e}");
            }
        }

        Ok(result.into())
    }

    async fn update_settings(
        &self,
        ctx: &Context<'_>,
        metrics_enabled: Option<bool>,
    ) -> Result<GqlStatus, Error> {
        let state = state(ctx)?;
        let mut settings = state.settings.write().unwrap_or_else(|e| e.into_inner());
        if let Some(metrics_enabled) = metrics_enabled {
            settings.metrics_enabled = metrics_enabled;
        }
        Ok(GqlStatus { status: true })
    }

    async fn chat(
        &self,
        ctx: &Context<'_>,
        schema: String,
        model: Option<String>,
        token: Option<String>,
        query: String,
    ) -> Result<Vec<GqlChatMessage>, Error> {
        let (plugin, mut config) = current(ctx)?;
        if let Some(model) = model {
            config.external_model = Some(ExternalModel {
                kind: model,
                token: token.unwrap_or_default(),
            });
        }

        let messages = blocking(move || {
            let history: Vec<ChatMessage> = Vec::new();
            plugin.chat(
                &config,
                &schema,
                config.external_model.as_ref(),
                &history,
                &query,
            )
        })
        .await?;
        Ok(messages.into_iter().map(GqlChatMessage::from).collect())
    }
}
