use crate::auth::{ResolvedCredential, resolve_credential};
use crate::gate::{self, Throttle, error_response, origin_matches};
use crate::graphql::{
    GatewaySchema, RequestOrigin, SharedSettings, build_schema, graphiql_html,
};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse, GraphQLSubscription};
use axum::extract::{Extension, FromRequest};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use whodb_core::{
    AppConfig, EngineError, EngineRegistry, HistoryStore, SecretStore, connection_cache,
};

/// Everything the gate and the resolvers share. Cheap to clone; all the
/// fields are shared handles.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<EngineRegistry>,
    pub config: Arc<AppConfig>,
    pub secret_store: Arc<dyn SecretStore>,
    pub settings: SharedSettings,
    pub history: Option<Arc<Mutex<HistoryStore>>>,
    pub dev_mode: bool,
}

impl ServerState {
    pub fn new(
        registry: Arc<EngineRegistry>,
        config: Arc<AppConfig>,
        secret_store: Arc<dyn SecretStore>,
        dev_mode: bool,
    ) -> Self {
        let history = match HistoryStore::open() {
            Ok(store) => Some(Arc::new(Mutex::new(store))),
            Err(e) => {
                log::debug!("query history disabled: {e}");
                None
            }
        };

        Self {
            registry,
            config,
            secret_store,
            settings: Arc::new(RwLock::new(Default::default())),
            history,
            dev_mode,
        }
    }
}

async fn graphql_handler(
    Extension(schema): Extension<GatewaySchema>,
    request: axum::extract::Request,
) -> Response {
    let resolved = request
        .extensions()
        .get::<ResolvedCredential>()
        .cloned()
        .unwrap_or_default();
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let gql_request = match GraphQLRequest::<async_graphql_axum::rejection::GraphQLRejection>::from_request(request, &()).await {
        Ok(request) => request,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &EngineError::invalid_argument("malformed GraphQL request"),
            );
        }
    };

    let inner = gql_request
        .into_inner()
        .data(resolved)
        .data(RequestOrigin(origin));
    GraphQLResponse::from(schema.execute(inner).await).into_response()
}

async fn graphiql() -> Html<String> {
    Html(graphiql_html("/api/query"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins = config.allowed_origins.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|origin| origins.iter().any(|pattern| origin_matches(pattern, origin)))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(300))
}

fn panic_handler(_: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let correlation_id = uuid::Uuid::new_v4();
    log::error!("recovered from a panic while handling a request [{correlation_id}]");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &EngineError::internal(format!(
            "the gateway hit an internal error (correlation id {correlation_id})"
        )),
    )
}

/// Assemble the full router: the global middleware chain in gate order,
/// then the GraphQL endpoint with the credential resolver and operation
/// gate applied per route.
pub fn build_router(state: ServerState) -> Router {
    let schema = build_schema(state.clone());
    let throttle = Throttle::new();

    // The playground only exists in development.
    let query_route = if state.dev_mode {
        get(graphiql).post(graphql_handler)
    } else {
        axum::routing::post(graphql_handler)
    };

    let graphql_routes = Router::new()
        .route("/api/query", query_route)
        .route_service("/api/query/ws", GraphQLSubscription::new(schema.clone()))
        .layer(middleware::from_fn_with_state(
            state.dev_mode,
            gate::operation_gate,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_credential,
        ))
        .layer(Extension(schema));

    let router = Router::new()
        .route("/health", get(health))
        .merge(graphql_routes)
        .layer(RequestBodyLimitLayer::new(gate::MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(throttle, gate::throttle))
        .layer(cors_layer(&state.config))
        .layer(middleware::from_fn(gate::timeout))
        .layer(CatchPanicLayer::custom(panic_handler))
        .layer(middleware::from_fn(gate::real_ip))
        .layer(middleware::from_fn(gate::request_id));

    let base = state.config.base_path.trim_matches('/');
    if base.is_empty() {
        router
    } else {
        Router::new().nest(&format!("/{base}"), router)
    }
}

/// Bind and serve until ctrl-c, then drain the connection cache.
pub async fn run(state: ServerState) -> Result<(), EngineError> {
    let port = state.config.port;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| EngineError::unavailable(format!("could not bind port {port}: {e}")))?;

    log::info!("gateway listening on port {port}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down");
        })
        .await
        .map_err(|e| EngineError::internal(format!("server error: {e}")))?;

    connection_cache::global().shutdown();
    Ok(())
}
