use crate::server::ServerState;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use whodb_core::{Credential, CredentialToken, EngineError};

const MAX_TOKEN_BYTES: usize = 16 * 1024;
const COOKIE_NAME: &str = "Token";

/// Credential bound to the request after the resolver ran. `None` means no
/// session was presented; the operation gate decides whether that is
/// acceptable for the requested operation.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCredential(pub Option<Credential>);

/// Credential resolver middleware.
///
/// Precedence: `Authorization: Bearer` header, then the `Token` cookie,
/// then profile/keyring resolution for blobs that only name a profile id.
/// A malformed header is `Unauthorized` outright; it never falls back to
/// the cookie.
pub async fn resolve_credential(
    State(state): State<ServerState>,
    mut request: Request,
    next: Next,
) -> Response {
    match extract_credential(&state, request.headers()) {
        Ok(resolved) => {
            request.extensions_mut().insert(resolved);
            next.run(request).await
        }
        Err((status, error)) => crate::gate::error_response(status, &error),
    }
}

fn extract_credential(
    state: &ServerState,
    headers: &HeaderMap,
) -> Result<ResolvedCredential, (StatusCode, EngineError)> {
    let token = match bearer_token(headers)? {
        Some(token) => Some(token),
        None => cookie_token(headers)?,
    };

    let Some(token) = token else {
        return Ok(ResolvedCredential(None));
    };

    let decoded = CredentialToken::decode(&token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e))?;

    let credential = if decoded.is_profile_reference() {
        let id = decoded.id.clone().unwrap_or_default();
        let stored = resolve_profile(state, &id)
            .map_err(|e| (StatusCode::UNAUTHORIZED, e))?;
        decoded.apply_over(stored)
    } else {
        decoded
            .into_credential()
            .map_err(|e| (StatusCode::UNAUTHORIZED, e))?
    };

    if state.config.api_gateway {
        let accepted = credential
            .access_token
            .as_deref()
            .is_some_and(|token| state.config.accepts_token(token));
        if !accepted {
            // BadRequest, not 401, so clients can tell a rejected gateway
            // token apart from a missing session.
            return Err((
                StatusCode::BAD_REQUEST,
                EngineError::unauthorized("the access token is not accepted by this gateway"),
            ));
        }
    }

    Ok(ResolvedCredential(Some(credential)))
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, (StatusCode, EngineError)> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    if value.len() > MAX_TOKEN_BYTES {
        return Err((
            StatusCode::BAD_REQUEST,
            EngineError::payload_too_large("authorization header exceeds 16 KiB"),
        ));
    }

    let text = value.to_str().map_err(|_| {
        (
            StatusCode::UNAUTHORIZED,
            EngineError::unauthorized("authorization header is not valid UTF-8"),
        )
    })?;

    let token = text
        .strip_prefix("Bearer ")
        .or_else(|| text.strip_prefix("bearer "))
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                EngineError::unauthorized("authorization header is not a bearer token"),
            )
        })?;

    Ok(Some(token.trim().to_string()))
}

fn cookie_token(headers: &HeaderMap) -> Result<Option<String>, (StatusCode, EngineError)> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(text) = value.to_str() else { continue };
        for pair in text.split(';') {
            let Some((name, cookie_value)) = pair.trim().split_once('=') else {
                continue;
            };
            if name.trim() != COOKIE_NAME {
                continue;
            }
            if cookie_value.len() > MAX_TOKEN_BYTES {
                return Err((
                    StatusCode::BAD_REQUEST,
                    EngineError::payload_too_large("session cookie exceeds 16 KiB"),
                ));
            }
            return Ok(Some(cookie_value.trim().to_string()));
        }
    }
    Ok(None)
}

/// Resolve a profile id through the registry, then the keyring when
/// desktop mode is on.
fn resolve_profile(state: &ServerState, id: &str) -> Result<Credential, EngineError> {
    if let Some(profile) = state.registry.find_profile(id) {
        return Ok(profile.credential);
    }
    if state.config.desktop_mode
        && let Some(credential) = state.secret_store.get_credential(id)?
    {
        return Ok(credential);
    }
    Err(EngineError::unauthorized(format!("unknown profile: {id}")))
}

/// Origins that identify the desktop shell; those sessions get a
/// cross-site cookie because the shell serves from its own scheme.
pub fn desktop_origin(origin: Option<&str>) -> bool {
    origin.is_some_and(|o| {
        o.starts_with("wails://") || o.starts_with("tauri://") || o.starts_with("file://")
    })
}

pub fn login_cookie(token: &str, origin: Option<&str>) -> String {
    if desktop_origin(origin) {
        format!("{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=None")
    } else {
        format!("{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Strict")
    }
}

pub fn logout_cookie() -> String {
    format!("{COOKIE_NAME}=; Path=/; HttpOnly; Max-Age=0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_parsing_finds_the_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; Token=abc123; lang=en"),
        );
        assert_eq!(cookie_token(&headers).unwrap(), Some("abc123".to_string()));
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let (status, error) = bearer_token(&headers).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error.code(), "UNAUTHORIZED");
    }

    #[test]
    fn oversize_header_is_payload_too_large() {
        let mut headers = HeaderMap::new();
        let huge = format!("Bearer {}", "a".repeat(20_000));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&huge).unwrap(),
        );
        let (status, error) = bearer_token(&headers).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code(), "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn desktop_origins_get_cross_site_cookies() {
        assert!(login_cookie("t", Some("tauri://localhost")).contains("SameSite=None"));
        assert!(login_cookie("t", Some("https://app.example")).contains("SameSite=Strict"));
        assert!(login_cookie("t", None).contains("SameSite=Strict"));
    }
}
