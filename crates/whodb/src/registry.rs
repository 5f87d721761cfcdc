use std::sync::Arc;
use whodb_core::EngineRegistry;

/// Register every compiled-in driver. Done once at startup; the registry
/// is read-only afterwards.
pub fn build_registry() -> Arc<EngineRegistry> {
    let mut registry = EngineRegistry::new();
    registry.register(Arc::new(whodb_driver_postgres::PostgresPlugin::new()));
    registry.register(Arc::new(whodb_driver_mysql::MySqlPlugin::new()));
    registry.register(Arc::new(whodb_driver_mysql::MySqlPlugin::mariadb()));
    registry.register(Arc::new(whodb_driver_sqlite::SqlitePlugin::new()));
    registry.register(Arc::new(whodb_driver_mongodb::MongoPlugin::new()));
    registry.register(Arc::new(whodb_driver_redis::RedisPlugin::new()));
    registry.register(Arc::new(
        whodb_driver_elasticsearch::ElasticSearchPlugin::new(),
    ));
    registry.register(Arc::new(whodb_driver_clickhouse::ClickHousePlugin::new()));
    Arc::new(registry)
}
