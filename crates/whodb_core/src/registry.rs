use crate::{Credential, DatabaseKind, EngineError, LoginProfile, Plugin, env_profiles};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Callback that produces additional profiles on demand (keyring contents,
/// remote secret stores). Called lazily on every `get_profiles`.
pub type ProfileRetriever = Box<dyn Fn() -> Vec<LoginProfile> + Send + Sync>;

/// Map of database kind to plugin instance plus the profile sources.
///
/// Plugins are registered once at startup; after that the registry is
/// read-only. Profile lists are write-rare and guarded by a single RW lock
/// so concurrent readers never block each other.
pub struct EngineRegistry {
    plugins: HashMap<DatabaseKind, Arc<dyn Plugin>>,
    static_profiles: RwLock<Vec<LoginProfile>>,
    retrievers: RwLock<Vec<ProfileRetriever>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            static_profiles: RwLock::new(Vec::new()),
            retrievers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.kind(), plugin);
    }

    pub fn choose(&self, kind: DatabaseKind) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(&kind).cloned()
    }

    /// Case-insensitive lookup by engine name.
    pub fn choose_by_name(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        DatabaseKind::from_str(name).ok().and_then(|k| self.choose(k))
    }

    /// Plugin for a resolved credential, or `Unsupported` when no driver
    /// was compiled in for its kind.
    pub fn plugin_for(&self, credential: &Credential) -> Result<Arc<dyn Plugin>, EngineError> {
        self.choose(credential.kind).ok_or_else(|| {
            EngineError::unsupported(format!("no driver registered for {}", credential.kind))
        })
    }

    pub fn kinds(&self) -> Vec<DatabaseKind> {
        let mut kinds: Vec<DatabaseKind> = self.plugins.keys().copied().collect();
        kinds.sort_by_key(|k| k.id());
        kinds
    }

    /// Register an in-process default profile at startup.
    pub fn register_profile(&self, profile: LoginProfile) {
        self.static_profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(profile);
    }

    pub fn register_retriever(&self, retriever: ProfileRetriever) {
        self.retrievers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(retriever);
    }

    /// Merge static, retriever, and environment profiles.
    ///
    /// Deduplicated by resolved id; profiles without a stable id get
    /// synthetic positional ids after everything else is placed, so an
    /// explicit id or alias never collides with a positional one.
    pub fn get_profiles(&self) -> Vec<(String, LoginProfile)> {
        let mut merged: Vec<LoginProfile> = self
            .static_profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for retriever in self
            .retrievers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            merged.extend(retriever());
        }
        merged.extend(env_profiles());

        let mut seen = HashSet::new();
        let mut named = Vec::new();
        let mut anonymous = Vec::new();
        for profile in merged {
            if profile.has_stable_id() {
                let id = profile.resolved_id(0);
                if seen.insert(id.clone()) {
                    named.push((id, profile));
                }
            } else {
                anonymous.push(profile);
            }
        }

        for (index, profile) in anonymous.into_iter().enumerate() {
            let id = profile.resolved_id(index);
            if seen.insert(id.clone()) {
                named.push((id, profile));
            }
        }

        named
    }

    /// Resolve a profile id to its credential.
    pub fn find_profile(&self, id: &str) -> Option<LoginProfile> {
        self.get_profiles()
            .into_iter()
            .find(|(resolved, _)| resolved == id)
            .map(|(resolved, mut profile)| {
                profile.credential.id = Some(resolved);
                profile.credential.is_profile = true;
                profile
            })
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GetRowsResult, PluginConfig, Record, SortCondition, StorageUnit, WhereCondition};

    struct NullPlugin(DatabaseKind);

    impl Plugin for NullPlugin {
        fn kind(&self) -> DatabaseKind {
            self.0
        }

        fn is_available(&self, _: &PluginConfig) -> bool {
            true
        }

        fn get_storage_units(
            &self,
            _: &PluginConfig,
            _: &str,
        ) -> Result<Vec<StorageUnit>, EngineError> {
            Ok(Vec::new())
        }

        fn get_columns_for_table(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
        ) -> Result<Vec<crate::Column>, EngineError> {
            Ok(Vec::new())
        }

        fn get_rows(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
            _: Option<&WhereCondition>,
            _: &[SortCondition],
            _: u32,
            _: u64,
        ) -> Result<GetRowsResult, EngineError> {
            Ok(GetRowsResult::default())
        }

        fn get_row_count(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
            _: Option<&WhereCondition>,
        ) -> Result<i64, EngineError> {
            Ok(0)
        }

        fn add_storage_unit(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
            _: &[Record],
        ) -> Result<bool, EngineError> {
            Ok(true)
        }

        fn add_row(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
            _: &[Record],
        ) -> Result<bool, EngineError> {
            Ok(true)
        }

        fn update_storage_unit(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
            _: &[Record],
            _: &[String],
        ) -> Result<bool, EngineError> {
            Ok(true)
        }

        fn delete_row(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
            _: &[Record],
        ) -> Result<bool, EngineError> {
            Ok(true)
        }

        fn clear_table_data(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
        ) -> Result<bool, EngineError> {
            Ok(true)
        }

        fn get_graph(
            &self,
            _: &PluginConfig,
            _: &str,
        ) -> Result<Vec<crate::GraphUnit>, EngineError> {
            Ok(Vec::new())
        }

        fn raw_execute(&self, _: &PluginConfig, _: &str) -> Result<GetRowsResult, EngineError> {
            Ok(GetRowsResult::default())
        }

        fn export_data(
            &self,
            _: &PluginConfig,
            _: &str,
            _: &str,
            _: &mut dyn crate::RowSink,
            _: Option<&[Vec<String>]>,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn profile(kind: DatabaseKind, alias: Option<&str>, host: &str) -> LoginProfile {
        let mut credential = Credential::new(kind);
        credential.hostname = host.into();
        credential.username = "svc".into();
        credential.is_profile = true;
        LoginProfile {
            id: None,
            alias: alias.map(String::from),
            credential,
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(NullPlugin(DatabaseKind::Postgres)));
        assert!(registry.choose_by_name("POSTGRESQL").is_some());
        assert!(registry.choose_by_name("postgres").is_some());
        assert!(registry.choose_by_name("oracle").is_none());
    }

    #[test]
    fn profiles_merge_and_dedup_by_id() {
        let registry = EngineRegistry::new();
        registry.register_profile(profile(DatabaseKind::Postgres, Some("main"), "a.local"));
        registry.register_profile(profile(DatabaseKind::Postgres, Some("main"), "b.local"));
        registry.register_retriever(Box::new(|| {
            vec![profile(DatabaseKind::Redis, Some("cache"), "kv.local")]
        }));

        let profiles = registry.get_profiles();
        let ids: Vec<&str> = profiles.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["main", "cache"]);
        // First registration wins on conflict.
        assert_eq!(profiles[0].1.credential.hostname, "a.local");
    }

    #[test]
    fn synthetic_ids_are_assigned_last() {
        let registry = EngineRegistry::new();
        registry.register_profile(profile(DatabaseKind::Postgres, None, "a.local"));
        registry.register_profile(profile(DatabaseKind::Postgres, Some("named"), "b.local"));

        let profiles = registry.get_profiles();
        assert_eq!(profiles[0].0, "named");
        assert_eq!(profiles[1].0, "#1 - svc@a.local");
    }

    #[test]
    fn find_profile_stamps_resolved_id() {
        let registry = EngineRegistry::new();
        registry.register_profile(profile(DatabaseKind::Postgres, Some("main"), "a.local"));
        let found = registry.find_profile("main").unwrap();
        assert_eq!(found.credential.id.as_deref(), Some("main"));
        assert!(found.credential.is_profile);
        assert!(registry.find_profile("missing").is_none());
    }
}
