use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "whodb",
    version,
    about = "A multi-engine database gateway",
    propagate_version = true
)]
pub struct Cli {
    /// Output format for data-producing commands.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Auto)]
    pub format: OutputFormat,

    /// Suppress informational output.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Named connection (from `connections add`) or environment profile id.
    #[arg(long, short, global = true)]
    pub connection: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table on a terminal, plain otherwise.
    Auto,
    Table,
    Plain,
    Json,
    Csv,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway HTTP server.
    Serve {
        /// Enable introspection, the playground, and the dev allow-list.
        #[arg(long)]
        dev: bool,

        /// Register a sample SQLite profile for quick exploration.
        #[arg(long)]
        sample: bool,
    },

    /// Manage named connections.
    Connections {
        #[command(subcommand)]
        command: ConnectionsCommand,
    },

    /// List schemas of the selected connection.
    Schemas,

    /// List tables of a schema.
    Tables {
        #[arg(long)]
        schema: Option<String>,
    },

    /// Show the columns of a table.
    Columns {
        table: String,
        #[arg(long)]
        schema: Option<String>,
    },

    /// Execute a raw query on the selected connection.
    Query { query: String },

    /// Export a table to CSV or JSON lines.
    Export {
        table: String,
        #[arg(long)]
        schema: Option<String>,
        /// Write to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        export_format: ExportFormat,
    },

    /// Model-context-protocol tools for AI assistants.
    Mcp {
        #[command(subcommand)]
        command: McpCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConnectionsCommand {
    /// List named connections and environment profiles.
    List,

    /// Save a named connection to the config file.
    Add {
        name: String,
        /// Database engine (postgres, mysql, mariadb, sqlite3, mongodb,
        /// redis, elasticsearch, clickhouse).
        #[arg(long = "type")]
        kind: String,
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value = "")]
        user: String,
        #[arg(long, default_value = "")]
        password: String,
        #[arg(long, default_value = "")]
        database: String,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Remove a named connection.
    Remove { name: String },

    /// Check that the selected connection is reachable.
    Test,
}

#[derive(Debug, Subcommand)]
pub enum McpCommand {
    /// Serve MCP tools over stdio.
    Serve {
        /// Refuse mutating statements outright.
        #[arg(long, conflicts_with = "allow_write")]
        read_only: bool,

        /// Execute mutating statements without confirmation.
        #[arg(long)]
        allow_write: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Jsonl,
}
