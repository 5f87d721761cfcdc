use crate::EngineError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseKind {
    Postgres,
    MySQL,
    MariaDB,
    Sqlite3,
    MongoDB,
    Redis,
    ElasticSearch,
    ClickHouse,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 8] = [
        DatabaseKind::Postgres,
        DatabaseKind::MySQL,
        DatabaseKind::MariaDB,
        DatabaseKind::Sqlite3,
        DatabaseKind::MongoDB,
        DatabaseKind::Redis,
        DatabaseKind::ElasticSearch,
        DatabaseKind::ClickHouse,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "PostgreSQL",
            DatabaseKind::MySQL => "MySQL",
            DatabaseKind::MariaDB => "MariaDB",
            DatabaseKind::Sqlite3 => "SQLite",
            DatabaseKind::MongoDB => "MongoDB",
            DatabaseKind::Redis => "Redis",
            DatabaseKind::ElasticSearch => "Elasticsearch",
            DatabaseKind::ClickHouse => "ClickHouse",
        }
    }

    /// Stable lowercase identifier used in cache fingerprints and the CLI.
    pub fn id(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::MySQL => "mysql",
            DatabaseKind::MariaDB => "mariadb",
            DatabaseKind::Sqlite3 => "sqlite3",
            DatabaseKind::MongoDB => "mongodb",
            DatabaseKind::Redis => "redis",
            DatabaseKind::ElasticSearch => "elasticsearch",
            DatabaseKind::ClickHouse => "clickhouse",
        }
    }

    /// Uppercase segment used for `WHODB_<KIND>` environment profiles.
    pub fn env_key(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "POSTGRES",
            DatabaseKind::MySQL => "MYSQL",
            DatabaseKind::MariaDB => "MARIADB",
            DatabaseKind::Sqlite3 => "SQLITE3",
            DatabaseKind::MongoDB => "MONGODB",
            DatabaseKind::Redis => "REDIS",
            DatabaseKind::ElasticSearch => "ELASTICSEARCH",
            DatabaseKind::ClickHouse => "CLICKHOUSE",
        }
    }

    /// File-backed engines take a path instead of a network address.
    pub fn is_file_backed(&self) -> bool {
        matches!(self, DatabaseKind::Sqlite3)
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for DatabaseKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseKind::Postgres),
            "mysql" => Ok(DatabaseKind::MySQL),
            "mariadb" => Ok(DatabaseKind::MariaDB),
            "sqlite" | "sqlite3" => Ok(DatabaseKind::Sqlite3),
            "mongo" | "mongodb" => Ok(DatabaseKind::MongoDB),
            "redis" => Ok(DatabaseKind::Redis),
            "elasticsearch" | "elastic" => Ok(DatabaseKind::ElasticSearch),
            "clickhouse" => Ok(DatabaseKind::ClickHouse),
            other => Err(EngineError::invalid_argument(format!(
                "unknown database type: {other}"
            ))),
        }
    }
}

/// Ordered key/value entry used for advanced connection parameters,
/// storage-unit attributes, and row field values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Record {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<BTreeMap<String, String>>,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            extras: None,
        }
    }
}

/// Identity of a target database.
///
/// Created on login or credential resolution and lives for the request.
/// Equality and the cache fingerprint derive from kind, hostname, username,
/// password, database, and the sorted advanced list; `id` and
/// `access_token` are session metadata and do not participate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credential {
    #[serde(rename = "Type")]
    pub kind: DatabaseKind,

    /// Stable profile id when this credential references a stored profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub database: String,

    /// Ordered advanced parameters (port, ssl mode, driver flags).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advanced: Vec<Record>,

    /// Gateway access token; checked when API-gateway mode is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Whether this credential came from a profile or environment source
    /// rather than being typed by the user. Never serialized.
    #[serde(skip)]
    pub is_profile: bool,
}

impl Credential {
    pub fn new(kind: DatabaseKind) -> Self {
        Self {
            kind,
            id: None,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            database: String::new(),
            advanced: Vec::new(),
            access_token: None,
            is_profile: false,
        }
    }

    /// Look up an advanced parameter by key (first match wins).
    pub fn advanced_value(&self, key: &str) -> Option<&str> {
        self.advanced
            .iter()
            .find(|r| r.key.eq_ignore_ascii_case(key))
            .map(|r| r.value.as_str())
    }

    /// Port from the advanced list, falling back to `default`.
    pub fn port_or(&self, default: u16) -> u16 {
        self.advanced_value("port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Session token form: base64 over the JSON serialization. The plain
    /// JSON form is what the secret store persists.
    pub fn encode_token(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64.encode(json)
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        let mut a = self.advanced.clone();
        let mut b = other.advanced.clone();
        a.sort_by(|x, y| x.key.cmp(&y.key));
        b.sort_by(|x, y| x.key.cmp(&y.key));
        self.kind == other.kind
            && self.hostname == other.hostname
            && self.username == other.username
            && self.password == other.password
            && self.database == other.database
            && a == b
    }
}

/// Wire face of a credential as carried in the `Authorization` header or
/// the `Token` cookie. Everything is optional: a blob may reference a
/// stored profile by id and override individual fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CredentialToken {
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DatabaseKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub database: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advanced: Vec<Record>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl CredentialToken {
    /// Decode a base64(JSON) token blob.
    pub fn decode(token: &str) -> Result<Self, EngineError> {
        let bytes = BASE64
            .decode(token.trim())
            .map_err(|e| EngineError::unauthorized(format!("malformed session token: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::unauthorized(format!("malformed session token: {e}")))
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64.encode(json)
    }

    /// A blob that only names a stored profile: `id` is set and no
    /// identifying connection fields are present. Non-identifying fields
    /// (database, advanced) may still be present as overrides.
    pub fn is_profile_reference(&self) -> bool {
        self.id.is_some() && self.hostname.is_empty() && self.username.is_empty()
    }

    /// Turn a fully-specified token into a credential. Fails when the
    /// engine kind is absent (profile references resolve elsewhere).
    pub fn into_credential(self) -> Result<Credential, EngineError> {
        let kind = self
            .kind
            .ok_or_else(|| EngineError::unauthorized("session token carries no database type"))?;
        Ok(Credential {
            kind,
            id: self.id,
            hostname: self.hostname,
            username: self.username,
            password: self.password,
            database: self.database,
            advanced: self.advanced,
            access_token: self.access_token,
            is_profile: false,
        })
    }

    /// Merge this token over a stored profile credential. Non-empty token
    /// fields win per field; advanced records override by key and new keys
    /// are appended in token order.
    pub fn apply_over(&self, mut base: Credential) -> Credential {
        if let Some(kind) = self.kind {
            base.kind = kind;
        }
        if !self.hostname.is_empty() {
            base.hostname = self.hostname.clone();
        }
        if !self.username.is_empty() {
            base.username = self.username.clone();
        }
        if !self.password.is_empty() {
            base.password = self.password.clone();
        }
        if !self.database.is_empty() {
            base.database = self.database.clone();
        }
        for record in &self.advanced {
            match base
                .advanced
                .iter_mut()
                .find(|r| r.key.eq_ignore_ascii_case(&record.key))
            {
                Some(existing) => existing.value = record.value.clone(),
                None => base.advanced.push(record.clone()),
            }
        }
        if self.access_token.is_some() {
            base.access_token = self.access_token.clone();
        }
        if self.id.is_some() {
            base.id = self.id.clone();
        }
        base
    }
}

impl From<&Credential> for CredentialToken {
    fn from(credential: &Credential) -> Self {
        Self {
            kind: Some(credential.kind),
            id: credential.id.clone(),
            hostname: credential.hostname.clone(),
            username: credential.username.clone(),
            password: credential.password.clone(),
            database: credential.database.clone(),
            advanced: credential.advanced.clone(),
            access_token: credential.access_token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credential {
        let mut credential = Credential::new(DatabaseKind::Postgres);
        credential.hostname = "db.local".into();
        credential.username = "alice".into();
        credential.password = "pw".into();
        credential.database = "app".into();
        credential.advanced = vec![Record::new("Port", "5433"), Record::new("SSL Mode", "require")];
        credential
    }

    #[test]
    fn token_round_trip_preserves_credential() {
        let credential = sample();
        let token = credential.encode_token();
        let decoded = CredentialToken::decode(&token)
            .unwrap()
            .into_credential()
            .unwrap();
        assert_eq!(decoded, credential);
        assert_eq!(decoded.advanced.len(), 2);
    }

    #[test]
    fn decode_accepts_pascal_case_field_names() {
        let json = r#"{"Type":"Postgres","Hostname":"db.local","Username":"alice","Password":"pw","Database":"app"}"#;
        let token = BASE64.encode(json);
        let decoded = CredentialToken::decode(&token).unwrap();
        assert_eq!(decoded.kind, Some(DatabaseKind::Postgres));
        assert_eq!(decoded.hostname, "db.local");
        assert_eq!(decoded.database, "app");
    }

    #[test]
    fn malformed_token_is_unauthorized() {
        let err = CredentialToken::decode("!!not-base64!!").unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        let not_json = BASE64.encode("hello");
        let err = CredentialToken::decode(&not_json).unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[test]
    fn profile_reference_detection() {
        let token = CredentialToken {
            id: Some("profile-1".into()),
            database: "override".into(),
            ..Default::default()
        };
        assert!(token.is_profile_reference());

        let token = CredentialToken {
            id: Some("profile-1".into()),
            hostname: "db.local".into(),
            ..Default::default()
        };
        assert!(!token.is_profile_reference());
    }

    #[test]
    fn apply_over_overrides_per_field() {
        let stored = sample();
        let token = CredentialToken {
            id: Some("profile-1".into()),
            database: "override".into(),
            advanced: vec![Record::new("Port", "6000")],
            ..Default::default()
        };
        let merged = token.apply_over(stored);
        assert_eq!(merged.database, "override");
        assert_eq!(merged.username, "alice");
        assert_eq!(merged.advanced_value("port"), Some("6000"));
        assert_eq!(merged.advanced_value("ssl mode"), Some("require"));
    }

    #[test]
    fn equality_ignores_advanced_order() {
        let mut a = sample();
        let mut b = sample();
        b.advanced.reverse();
        assert_eq!(a, b);
        a.password = "other".into();
        assert_ne!(a, b);
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("POSTGRESQL".parse::<DatabaseKind>().unwrap(), DatabaseKind::Postgres);
        assert_eq!("sqlite".parse::<DatabaseKind>().unwrap(), DatabaseKind::Sqlite3);
        assert!("oracle".parse::<DatabaseKind>().is_err());
    }
}
