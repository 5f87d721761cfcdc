use crate::{Credential, DatabaseKind, Record};
use serde::{Deserialize, Serialize};

/// A named, persisted credential template discoverable without login.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginProfile {
    /// Explicit custom id, when the source supplied one.
    pub id: Option<String>,
    /// Human alias; used as the id when no explicit id exists.
    pub alias: Option<String>,
    pub credential: Credential,
}

impl LoginProfile {
    pub fn new(credential: Credential) -> Self {
        Self {
            id: None,
            alias: None,
            credential,
        }
    }

    /// Id precedence: explicit custom id > alias > synthetic
    /// `"#i - user@host [db]"`.
    pub fn resolved_id(&self, index: usize) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        synthetic_id(index, &self.credential)
    }

    /// Whether the profile already carries a stable id and does not need a
    /// synthetic one.
    pub fn has_stable_id(&self) -> bool {
        self.id.is_some() || self.alias.is_some()
    }
}

fn synthetic_id(index: usize, credential: &Credential) -> String {
    if credential.database.is_empty() {
        format!(
            "#{} - {}@{}",
            index + 1,
            credential.username,
            credential.hostname
        )
    } else {
        format!(
            "#{} - {}@{} [{}]",
            index + 1,
            credential.username,
            credential.hostname,
            credential.database
        )
    }
}

/// Shape of one environment-variable profile object. Field names accept
/// both the token casing and common lowercase spellings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
struct EnvProfile {
    #[serde(alias = "id")]
    id: Option<String>,
    #[serde(alias = "alias")]
    alias: Option<String>,
    #[serde(alias = "host", alias = "hostname")]
    hostname: String,
    #[serde(alias = "user", alias = "username")]
    username: String,
    #[serde(alias = "password")]
    password: String,
    #[serde(alias = "database")]
    database: String,
    #[serde(alias = "port")]
    port: Option<serde_json::Value>,
    #[serde(alias = "config")]
    config: Option<std::collections::BTreeMap<String, String>>,
}

impl EnvProfile {
    fn into_profile(self, kind: DatabaseKind) -> LoginProfile {
        let mut credential = Credential::new(kind);
        credential.hostname = self.hostname;
        credential.username = self.username;
        credential.password = self.password;
        credential.database = self.database;
        credential.is_profile = true;

        if let Some(port) = self.port {
            let port = match port {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            credential.advanced.push(Record::new("Port", port));
        }
        if let Some(config) = self.config {
            for (key, value) in config {
                credential.advanced.push(Record::new(key, value));
            }
        }

        credential.id = self.id.clone();
        LoginProfile {
            id: self.id,
            alias: self.alias,
            credential,
        }
    }
}

/// Read credential profiles from the environment.
///
/// `WHODB_<KIND>` holds a JSON array of profile objects and
/// `WHODB_<KIND>_<N>` a single object. Malformed values are logged and
/// skipped rather than failing discovery.
pub fn env_profiles() -> Vec<LoginProfile> {
    env_profiles_from(|name| std::env::var(name).ok())
}

/// Testable variant taking an environment lookup function.
pub fn env_profiles_from(get: impl Fn(&str) -> Option<String>) -> Vec<LoginProfile> {
    let mut profiles = Vec::new();

    for kind in DatabaseKind::ALL {
        let base = format!("WHODB_{}", kind.env_key());

        if let Some(raw) = get(&base) {
            match serde_json::from_str::<Vec<EnvProfile>>(&raw) {
                Ok(list) => {
                    profiles.extend(list.into_iter().map(|p| p.into_profile(kind)));
                }
                Err(e) => log::warn!("ignoring malformed {base}: {e}"),
            }
        }

        for index in 1.. {
            let name = format!("{base}_{index}");
            let Some(raw) = get(&name) else { break };
            match serde_json::from_str::<EnvProfile>(&raw) {
                Ok(profile) => profiles.push(profile.into_profile(kind)),
                Err(e) => log::warn!("ignoring malformed {name}: {e}"),
            }
        }
    }

    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_id_includes_position_and_target() {
        let mut credential = Credential::new(DatabaseKind::Postgres);
        credential.username = "alice".into();
        credential.hostname = "db.local".into();
        credential.database = "app".into();
        let profile = LoginProfile::new(credential);
        assert_eq!(profile.resolved_id(0), "#1 - alice@db.local [app]");
    }

    #[test]
    fn explicit_id_beats_alias() {
        let mut profile = LoginProfile::new(Credential::new(DatabaseKind::Redis));
        profile.alias = Some("cache".to_string());
        assert_eq!(profile.resolved_id(3), "cache");
        profile.id = Some("custom".to_string());
        assert_eq!(profile.resolved_id(3), "custom");
    }

    #[test]
    fn parses_array_and_indexed_env_profiles() {
        let profiles = env_profiles_from(|name| match name {
            "WHODB_POSTGRES" => Some(
                r#"[{"host":"db.local","user":"alice","password":"pw","database":"app","port":5433}]"#
                    .to_string(),
            ),
            "WHODB_REDIS_1" => {
                Some(r#"{"alias":"cache","host":"kv.local","password":"s3cret"}"#.to_string())
            }
            _ => None,
        });

        assert_eq!(profiles.len(), 2);
        let pg = &profiles[0];
        assert_eq!(pg.credential.kind, DatabaseKind::Postgres);
        assert_eq!(pg.credential.hostname, "db.local");
        assert_eq!(pg.credential.advanced_value("port"), Some("5433"));
        assert!(pg.credential.is_profile);

        let redis = &profiles[1];
        assert_eq!(redis.alias.as_deref(), Some("cache"));
        assert_eq!(redis.resolved_id(1), "cache");
    }

    #[test]
    fn malformed_env_profiles_are_skipped() {
        let profiles = env_profiles_from(|name| match name {
            "WHODB_POSTGRES" => Some("not json".to_string()),
            _ => None,
        });
        assert!(profiles.is_empty());
    }

    #[test]
    fn indexed_profiles_stop_at_first_gap() {
        let profiles = env_profiles_from(|name| match name {
            "WHODB_REDIS_1" => Some(r#"{"host":"a"}"#.to_string()),
            "WHODB_REDIS_3" => Some(r#"{"host":"c"}"#.to_string()),
            _ => None,
        });
        assert_eq!(profiles.len(), 1);
    }
}
