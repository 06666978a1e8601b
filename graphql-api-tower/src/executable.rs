//! Main entry point for CLI command to start server.

use std::io::IsTerminal;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use apollo_compiler::Schema;
use clap::Parser;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tracing_subscriber::EnvFilter;

use crate::axum_factory::make_router;
use crate::configuration::Configuration;
use crate::configuration::generate_config_schema;
use crate::options::ExecuteOptions;
use crate::services;
use crate::services::BodyParserLayer;
use crate::services::ErrorHandlerLayer;
use crate::services::ExecuteLayer;

/// Options for the server
#[derive(Parser, Debug)]
#[command(name = "graphql-api-tower", about = "GraphQL API server")]
pub(crate) struct Opt {
    /// Log level (off|error|warn|info|debug|trace).
    #[arg(
        long = "log",
        default_value = "info",
        alias = "log-level",
        env = "GRAPHQL_API_TOWER_LOG"
    )]
    log_level: String,

    /// Configuration file location.
    #[arg(short, long = "config", env = "GRAPHQL_API_TOWER_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// GraphQL schema (SDL) location. Takes precedence over `schema_file`.
    #[arg(short, long = "schema", env = "GRAPHQL_API_TOWER_SCHEMA_PATH")]
    schema_path: Option<PathBuf>,

    /// Prints the configuration schema.
    #[arg(long)]
    print_config_schema: bool,

    /// Display version and exit.
    #[arg(long, short = 'V')]
    version: bool,
}

/// This is the main server entrypoint.
pub fn main() -> Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(nb) = std::env::var("GRAPHQL_API_TOWER_NUM_CORES")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        builder.worker_threads(nb);
    }
    let runtime = builder.build()?;
    runtime.block_on(start(Opt::parse()))
}

async fn start(opt: Opt) -> Result<()> {
    if opt.version {
        println!("{}", std::env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if opt.print_config_schema {
        let schema = generate_config_schema();
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_new(&opt.log_level).context("could not parse log configuration")?,
    );
    if std::io::stdout().is_terminal() {
        builder.try_init()
    } else {
        builder.json().try_init()
    }
    .map_err(|error| anyhow!("could not set up logging: {error}"))?;

    let configuration = match &opt.config_path {
        Some(path) => Configuration::read(path)
            .with_context(|| format!("could not load configuration {}", path.display()))?,
        None => Configuration::default(),
    };
    let schema_path = opt
        .schema_path
        .or_else(|| configuration.schema_file.clone())
        .ok_or_else(|| {
            anyhow!("a GraphQL schema is required, pass --schema or set `schema_file`")
        })?;
    let schema = read_schema(&schema_path)?;

    let mut options = ExecuteOptions::new().schema(schema);
    if let Some(root_value) = configuration.root_value()? {
        options = options.root_value(root_value);
    }
    let error_handler = ErrorHandlerLayer::new();
    let service = stack(&error_handler, options)?;

    let router = make_router(
        &configuration.server.path,
        service,
        &configuration.limits,
        &error_handler,
    );
    let listener = tokio::net::TcpListener::bind(configuration.server.listen)
        .await
        .with_context(|| format!("could not listen on {}", configuration.server.listen))?;
    tracing::info!(
        "GraphQL endpoint exposed at http://{}{}",
        listener.local_addr()?,
        configuration.server.path
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("stopped");
    Ok(())
}

fn read_schema(path: &Path) -> Result<Schema> {
    let sdl = std::fs::read_to_string(path)
        .with_context(|| format!("could not read schema {}", path.display()))?;
    Schema::parse(sdl, path).map_err(|invalid| {
        anyhow!(
            "could not parse schema {}:\n{}",
            path.display(),
            invalid.errors
        )
    })
}

/// Error handler, body parser and execution, in that order.
fn stack(
    error_handler: &ErrorHandlerLayer,
    options: ExecuteOptions,
) -> Result<services::BoxCloneService> {
    let execute = ExecuteLayer::new(options).context("could not set up GraphQL execution")?;
    Ok(ServiceBuilder::new()
        .layer(error_handler.clone())
        .layer(BodyParserLayer::new())
        .layer(execute)
        .service(services::respond())
        .boxed_clone())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "could not listen for shutdown signal");
    }
}
