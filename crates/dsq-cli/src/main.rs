//! dsq - Command-line tool for querying datasources
//!
//! Lists datasources, runs queries (optionally following live updates), checks
//! datasource health and calls resource endpoints.

mod commands;
mod config;
mod output;
mod time;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dsq_client::{DataSourceClient, HttpBackend};
use dsq_core::{BackendTransport, DataSourceRef, DataSourceRegistry, DataSourceResolver};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::QueryArgs;
use crate::config::{Config, MergedConfig};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "dsq")]
#[command(author, version, about = "Datasource query CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Server URL [default: http://localhost:3000]
    #[arg(short, long, env = "DSQ_SERVER")]
    server: Option<String>,

    /// API token, sent as a bearer token
    #[arg(long, env = "DSQ_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "DSQ_CONFIG")]
    config: Option<PathBuf>,

    /// Output format [default: table]
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List datasources
    Datasources,

    /// Run one or more queries
    Query {
        /// Datasource uid or name (defaults to the configured or server default)
        #[arg(short, long)]
        datasource: Option<String>,

        /// Query model as a JSON object; repeatable
        #[arg(short, long = "query", value_name = "JSON")]
        queries: Vec<String>,

        /// Shortcut for a query with an `expr` field; repeatable
        #[arg(short, long = "expr", value_name = "EXPR")]
        exprs: Vec<String>,

        /// Range start: now, now-<N><s|m|h|d|w>, RFC 3339 or epoch ms
        #[arg(long, default_value = "now-1h")]
        from: String,

        /// Range end
        #[arg(long, default_value = "now")]
        to: String,

        /// Send the request without a time range
        #[arg(long, conflicts_with_all = ["from", "to"])]
        no_range: bool,

        /// Maximum number of data points per series
        #[arg(long)]
        max_data_points: Option<u64>,

        /// Query interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Keep following results until interrupted
        #[arg(short, long)]
        follow: bool,

        /// Re-run the query every N seconds while following
        #[arg(long, value_name = "SECS", requires = "follow")]
        refresh: Option<u64>,
    },

    /// Check datasource health
    Health {
        /// Datasource uid or name
        datasource: Option<String>,
    },

    /// Call a datasource resource endpoint
    Resource {
        /// Datasource uid or name
        datasource: String,

        /// Resource path, e.g. api/v1/labels
        path: String,

        /// JSON body; sends a POST instead of a GET
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    let merged = config.merge_with_args(
        cli.server.as_deref(),
        cli.token.as_deref(),
        cli.output.map(OutputFormat::as_str),
        cli.no_color,
    );
    let format = OutputFormat::from_str(&merged.output, true)
        .map_err(|e| anyhow!("Invalid output format '{}': {}", merged.output, e))?;

    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    let backend = Arc::new(create_backend(&merged)?);
    let registry = Arc::new(DataSourceRegistry::from_instances(
        backend
            .list_datasources()
            .await
            .with_context(|| format!("Failed to list datasources from {}", merged.server))?,
    ));

    match &cli.command {
        Commands::Datasources => {
            commands::datasources(&registry, &ctx)?;
        }

        Commands::Query {
            datasource,
            queries,
            exprs,
            from,
            to,
            no_range,
            max_data_points,
            interval_ms,
            follow,
            refresh,
        } => {
            let client = create_client(&backend, &registry, datasource.as_deref(), &merged)?;
            let queries = commands::query::parse_queries(queries, exprs)?;
            if queries.is_empty() {
                return Err(anyhow!("No queries given; use --query or --expr"));
            }
            let args = QueryArgs {
                queries,
                from: (!no_range).then(|| from.clone()),
                to: to.clone(),
                max_data_points: *max_data_points,
                interval_ms: *interval_ms,
                follow: *follow,
                refresh: refresh.map(Duration::from_secs),
            };
            if !commands::query(&client, &args, &ctx).await? {
                std::process::exit(1);
            }
        }

        Commands::Health { datasource } => {
            let client = create_client(&backend, &registry, datasource.as_deref(), &merged)?;
            if !commands::health(&client, &ctx).await? {
                std::process::exit(1);
            }
        }

        Commands::Resource {
            datasource,
            path,
            data,
        } => {
            let client = create_client(&backend, &registry, Some(datasource.as_str()), &merged)?;
            commands::resource(&client, path, data.as_deref(), &ctx).await?;
        }
    }

    Ok(())
}

/// Create the HTTP backend for the merged server settings
fn create_backend(merged: &MergedConfig) -> Result<HttpBackend> {
    match &merged.token {
        Some(token) => HttpBackend::with_bearer_token(&merged.server, token),
        None => HttpBackend::new(&merged.server),
    }
    .context("Failed to create HTTP backend")
}

/// Bind a client to the named datasource, falling back to the configured
/// default and then the server's default
fn create_client(
    backend: &Arc<HttpBackend>,
    registry: &Arc<DataSourceRegistry>,
    datasource: Option<&str>,
    merged: &MergedConfig,
) -> Result<DataSourceClient> {
    let instance = match datasource.or(merged.default_datasource.as_deref()) {
        Some(name) => registry
            .resolve(&DataSourceRef::named(name))
            .with_context(|| format!("Datasource not found: {}", name))?,
        None => registry
            .default_instance()
            .context("No datasource given and the server has no default datasource")?,
    };

    debug!(
        uid = %instance.uid,
        name = %instance.name,
        ds_type = %instance.type_name,
        "Using datasource"
    );

    let resolver: Arc<dyn DataSourceResolver> = registry.clone();
    let transport: Arc<dyn BackendTransport> = backend.clone();
    Ok(DataSourceClient::new(instance, resolver, transport))
}
