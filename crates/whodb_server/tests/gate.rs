use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;
use whodb_core::{
    AppConfig, Credential, DatabaseKind, EngineRegistry, LoginProfile, NoopSecretStore,
};
use whodb_server::{ServerState, build_router};
use whodb_test_support::FakePlugin;

fn credential(kind: DatabaseKind, username: &str, database: &str) -> Credential {
    let mut credential = Credential::new(kind);
    credential.hostname = "db.local".into();
    credential.username = username.into();
    credential.password = "pw".into();
    credential.database = database.into();
    credential
}

struct Harness {
    router: Router,
    plugin: FakePlugin,
}

fn harness(config: AppConfig) -> Harness {
    let plugin = FakePlugin::new(DatabaseKind::Postgres);

    let mut registry = EngineRegistry::new();
    registry.register(plugin.clone().as_plugin_arc());

    let mut profile_credential = credential(DatabaseKind::Postgres, "alice", "app");
    profile_credential.is_profile = true;
    registry.register_profile(LoginProfile {
        id: Some("profile-1".into()),
        alias: None,
        credential: profile_credential,
    });

    let state = ServerState::new(
        Arc::new(registry),
        Arc::new(config),
        Arc::new(NoopSecretStore),
        false,
    );
    Harness {
        router: build_router(state),
        plugin,
    }
}

async fn send(
    router: &Router,
    body: &str,
    headers: &[(header::HeaderName, String)],
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/query")
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn bearer(credential: &Credential) -> String {
    format!("Bearer {}", credential.encode_token())
}

fn token_cookie(credential: &Credential) -> String {
    format!("Token={}", credential.encode_token())
}

const DATABASE_QUERY: &str =
    r#"{"operationName":"Other","query":"query Other { database }"}"#;

#[tokio::test]
async fn header_credential_beats_cookie() {
    let h = harness(AppConfig::default());

    // The cookie names an engine with no registered driver; if the
    // resolver ever preferred it, the request would fail.
    let header_credential = credential(DatabaseKind::Postgres, "alice", "app");
    let cookie_credential = credential(DatabaseKind::Redis, "bob", "other");

    let (status, body) = send(
        &h.router,
        DATABASE_QUERY,
        &[
            (header::AUTHORIZATION, bearer(&header_credential)),
            (header::COOKIE, token_cookie(&cookie_credential)),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["database"][0], "app");

    let seen = h.plugin.last_credential().expect("plugin saw a credential");
    assert_eq!(seen.username, "alice");
    assert_eq!(seen.hostname, "db.local");
    assert_eq!(seen.database, "app");
}

#[tokio::test]
async fn oversize_header_is_rejected_with_payload_too_large() {
    let h = harness(AppConfig::default());
    let huge = format!("Bearer {}", "A".repeat(20_000));

    let (status, body) = send(
        &h.router,
        DATABASE_QUERY,
        &[(header::AUTHORIZATION, huge)],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["extensions"]["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn malformed_header_never_falls_back_to_the_cookie() {
    let h = harness(AppConfig::default());
    let cookie_credential = credential(DatabaseKind::Postgres, "alice", "app");

    let (status, body) = send(
        &h.router,
        DATABASE_QUERY,
        &[
            (header::AUTHORIZATION, "Bearer !!not-a-token!!".to_string()),
            (header::COOKIE, token_cookie(&cookie_credential)),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errors"][0]["extensions"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn gateway_mode_enforces_access_tokens() {
    let config = AppConfig {
        api_gateway: true,
        tokens: vec!["good".to_string()],
        ..AppConfig::default()
    };
    let h = harness(config);

    let mut rejected = credential(DatabaseKind::Postgres, "alice", "app");
    rejected.access_token = Some("bad".into());
    let (status, body) = send(
        &h.router,
        DATABASE_QUERY,
        &[(header::AUTHORIZATION, bearer(&rejected))],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["extensions"]["code"], "UNAUTHORIZED");

    let mut accepted = credential(DatabaseKind::Postgres, "alice", "app");
    accepted.access_token = Some("good".into());
    let (status, body) = send(
        &h.router,
        DATABASE_QUERY,
        &[(header::AUTHORIZATION, bearer(&accepted))],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["database"][0], "app");
}

#[tokio::test]
async fn profile_reference_resolves_with_field_overrides() {
    let h = harness(AppConfig::default());

    // Token only names the profile, plus a database override.
    let token = r#"{"Id":"profile-1","Database":"override"}"#;
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(token);

    let (status, body) = send(
        &h.router,
        DATABASE_QUERY,
        &[(header::AUTHORIZATION, format!("Bearer {encoded}"))],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    let seen = h.plugin.last_credential().expect("plugin saw a credential");
    assert_eq!(seen.username, "alice");
    assert_eq!(seen.hostname, "db.local");
    assert_eq!(seen.database, "override");
}

#[tokio::test]
async fn unknown_operations_require_a_session() {
    let h = harness(AppConfig::default());

    let (status, body) = send(&h.router, DATABASE_QUERY, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errors"][0]["extensions"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn profiles_are_discoverable_without_a_session() {
    let h = harness(AppConfig::default());
    let body = r#"{"operationName":"GetProfiles","query":"query GetProfiles { profiles { id } }"}"#;

    let (status, json) = send(&h.router, body, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["profiles"][0]["id"], "profile-1");
}

#[tokio::test]
async fn unavailable_reads_are_retried_once() {
    let h = harness(AppConfig::default());
    h.plugin.set_query_outcome(
        "users",
        whodb_test_support::FakeOutcome::Unavailable("gone".into()),
    );

    let body = r#"{"operationName":"Other","query":"query Other { row(schema: \"public\", storageUnit: \"users\", pageSize: 10, pageOffset: 0) { rows } }"}"#;
    let auth = bearer(&credential(DatabaseKind::Postgres, "alice", "app"));

    let (status, json) = send(&h.router, body, &[(header::AUTHORIZATION, auth)]).await;

    // Both attempts fail; the error surfaces as a typed GraphQL error.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["errors"][0]["extensions"]["code"], "UNAVAILABLE");
    assert_eq!(h.plugin.stats().row_calls, 2);
}
