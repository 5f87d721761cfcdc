use crate::cli::{Cli, Command, ConnectionsCommand, ExportFormat, McpCommand};
use crate::output::{print_list, print_result};
use crate::registry::build_registry;
use std::sync::Arc;
use whodb_core::{
    AppConfig, ConfigStore, Credential, EngineError, NamedConnection, Plugin, PluginConfig,
    Record, create_secret_store, env_profiles,
};
use whodb_export::{CsvSink, JsonLinesSink};

pub fn run(cli: Cli, config: &AppConfig) -> Result<(), EngineError> {
    match &cli.command {
        Command::Serve { dev, sample } => serve(config, *dev, *sample),
        Command::Connections { command } => connections(&cli, command),
        Command::Schemas => {
            let (plugin, plugin_config) = select(&cli)?;
            let schemas = plugin.get_all_schemas(&plugin_config)?;
            print_list(&schemas, cli.format)
        }
        Command::Tables { schema } => {
            let (plugin, plugin_config) = select(&cli)?;
            let schema = schema_or_default(schema.as_deref(), &plugin_config);
            let units = plugin.get_storage_units(&plugin_config, &schema)?;
            let names: Vec<String> = units.into_iter().map(|u| u.name).collect();
            print_list(&names, cli.format)
        }
        Command::Columns { table, schema } => {
            let (plugin, plugin_config) = select(&cli)?;
            let schema = schema_or_default(schema.as_deref(), &plugin_config);
            let columns = plugin.get_columns_for_table(&plugin_config, &schema, table)?;

            let result = whodb_core::GetRowsResult {
                columns: vec![
                    whodb_core::Column::new("name", "TEXT"),
                    whodb_core::Column::new("type", "TEXT"),
                    whodb_core::Column::new("nullable", "TEXT"),
                ],
                rows: columns
                    .iter()
                    .map(|c| {
                        vec![
                            c.name.clone(),
                            c.column_type.clone(),
                            c.is_nullable().to_string(),
                        ]
                    })
                    .collect(),
                disable_update: true,
            };
            print_result(&result, cli.format)
        }
        Command::Query { query } => {
            let (plugin, plugin_config) = select(&cli)?;
            let result = plugin.raw_execute(&plugin_config, query)?;
            print_result(&result, cli.format)
        }
        Command::Export {
            table,
            schema,
            output,
            export_format,
        } => {
            let (plugin, plugin_config) = select(&cli)?;
            let schema = schema_or_default(schema.as_deref(), &plugin_config);
            export(
                &*plugin,
                &plugin_config,
                &schema,
                table,
                output.as_deref(),
                *export_format,
            )
        }
        Command::Mcp { command } => match command {
            McpCommand::Serve {
                read_only,
                allow_write,
            } => {
                let mode = if *read_only {
                    whodb_mcp::WriteMode::ReadOnly
                } else if *allow_write {
                    whodb_mcp::WriteMode::AllowWrite
                } else {
                    whodb_mcp::WriteMode::Confirm
                };
                let registry = build_registry();
                runtime()?.block_on(whodb_mcp::serve_stdio(registry, mode))
            }
        },
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, EngineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| EngineError::internal(format!("could not start the runtime: {e}")))
}

fn serve(config: &AppConfig, dev: bool, sample: bool) -> Result<(), EngineError> {
    let registry = build_registry();
    if sample {
        let mut credential = Credential::new(whodb_core::DatabaseKind::Sqlite3);
        credential.database = "sample.db".to_string();
        credential.is_profile = true;
        registry.register_profile(whodb_core::LoginProfile {
            id: None,
            alias: Some("sample".to_string()),
            credential,
        });
    }

    let secret_store: Arc<dyn whodb_core::SecretStore> =
        Arc::from(create_secret_store(config.desktop_mode));
    let state = whodb_server::ServerState::new(
        registry,
        Arc::new(config.clone()),
        secret_store,
        dev,
    );
    runtime()?.block_on(whodb_server::run(state))
}

fn schema_or_default(schema: Option<&str>, config: &PluginConfig) -> String {
    schema
        .map(String::from)
        .unwrap_or_else(|| config.credential.database.clone())
}

/// Resolve the selected connection: a named connection from the config
/// file first, then an environment profile by id. With exactly one
/// candidate overall, `--connection` may be omitted.
fn select(cli: &Cli) -> Result<(Arc<dyn Plugin>, PluginConfig), EngineError> {
    let credential = resolve_credential(cli.connection.as_deref())?;
    let registry = build_registry();
    let plugin = registry.plugin_for(&credential)?;
    Ok((plugin, PluginConfig::new(credential)))
}

fn resolve_credential(name: Option<&str>) -> Result<Credential, EngineError> {
    let store = ConfigStore::load()?;
    let profiles = env_profiles();

    match name {
        Some(name) => {
            if let Some(connection) = store.find(name) {
                return Ok(connection.credential.clone());
            }
            if let Some((_, profile)) = profiles
                .iter()
                .enumerate()
                .find(|(index, profile)| profile.resolved_id(*index) == name)
            {
                return Ok(profile.credential.clone());
            }
            Err(EngineError::invalid_argument(format!(
                "unknown connection: {name}"
            )))
        }
        None => {
            let mut candidates: Vec<Credential> = store
                .file
                .connections
                .iter()
                .map(|c| c.credential.clone())
                .collect();
            candidates.extend(profiles.iter().map(|p| p.credential.clone()));

            match candidates.len() {
                0 => Err(EngineError::invalid_argument(
                    "no connections configured; add one with `whodb connections add`",
                )),
                1 => Ok(candidates.remove(0)),
                _ => Err(EngineError::invalid_argument(
                    "several connections configured; pick one with --connection",
                )),
            }
        }
    }
}

fn connections(cli: &Cli, command: &ConnectionsCommand) -> Result<(), EngineError> {
    match command {
        ConnectionsCommand::List => {
            let store = ConfigStore::load()?;
            let mut names: Vec<String> = store
                .file
                .connections
                .iter()
                .map(|c| format!("{} ({})", c.name, c.credential.kind.id()))
                .collect();
            names.extend(
                env_profiles()
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("{} ({}, env)", p.resolved_id(i), p.credential.kind.id())),
            );
            print_list(&names, cli.format)
        }
        ConnectionsCommand::Add {
            name,
            kind,
            host,
            user,
            password,
            database,
            port,
        } => {
            let mut credential = Credential::new(kind.parse()?);
            credential.hostname = host.clone();
            credential.username = user.clone();
            credential.password = password.clone();
            credential.database = database.clone();
            if let Some(port) = port {
                credential.advanced.push(Record::new("Port", port.to_string()));
            }

            let mut store = ConfigStore::load()?;
            store.add(NamedConnection {
                name: name.clone(),
                credential,
            })?;
            store.save()?;
            if !cli.quiet {
                eprintln!("saved connection {name}");
            }
            Ok(())
        }
        ConnectionsCommand::Remove { name } => {
            let mut store = ConfigStore::load()?;
            if !store.remove(name) {
                return Err(EngineError::invalid_argument(format!(
                    "unknown connection: {name}"
                )));
            }
            store.save()?;
            if !cli.quiet {
                eprintln!("removed connection {name}");
            }
            Ok(())
        }
        ConnectionsCommand::Test => {
            let (plugin, plugin_config) = select(cli)?;
            if plugin.is_available(&plugin_config) {
                if !cli.quiet {
                    eprintln!("connection ok");
                }
                Ok(())
            } else {
                Err(EngineError::unavailable(
                    "the database did not answer the probe",
                ))
            }
        }
    }
}

fn export(
    plugin: &dyn Plugin,
    config: &PluginConfig,
    schema: &str,
    table: &str,
    output: Option<&std::path::Path>,
    format: ExportFormat,
) -> Result<(), EngineError> {
    let writer: Box<dyn std::io::Write> = match output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };

    match format {
        ExportFormat::Csv => {
            let mut sink = CsvSink::new(writer);
            plugin.export_data(config, schema, table, &mut sink, None)?;
            sink.finish()
        }
        ExportFormat::Jsonl => {
            let mut sink = JsonLinesSink::new(writer);
            plugin.export_data(config, schema, table, &mut sink, None)
        }
    }
}
