use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ethica_connect::config::config_schema_json;
use ethica_connect::{
    load_config, Config, ConnectorRegistry, Domain, DomainKind, DynConnector, Employees, Surveys,
    TrainingEvents,
};
use ethica_events::Bus;
use serde_json::Value;

#[derive(Parser)]
#[command(
    name = "ethica-connector",
    version,
    about = "Sync, cache and query external HR compliance sources"
)]
struct Cli {
    /// Connector configuration (TOML)
    #[arg(long, short, env = "ETHICA_CONFIG", default_value = "ethica.toml", global = true)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every configured connector and keep them in sync until Ctrl+C
    Run {
        /// Log every bus event at info level
        #[arg(long, default_value_t = false)]
        events: bool,
    },
    /// Validate the configuration file and print the resolved connectors
    Check,
    /// Connect one connector, run a SELECT against it and print the rows (JSON)
    Query {
        #[arg(long)]
        connector: String,
        sql: String,
    },
    /// Connect one connector and print its analytics report (JSON)
    Analytics {
        #[arg(long)]
        connector: String,
    },
    /// Print the virtual table schema of a domain (JSON)
    Schema {
        #[arg(value_enum)]
        domain: DomainArg,
    },
    /// Print the JSON Schema of the configuration file
    ConfigSchema,
}

#[derive(Clone, Copy, ValueEnum)]
enum DomainArg {
    Employees,
    Surveys,
    Training,
}

impl From<DomainArg> for DomainKind {
    fn from(value: DomainArg) -> Self {
        match value {
            DomainArg::Employees => DomainKind::Employees,
            DomainArg::Surveys => DomainKind::Surveys,
            DomainArg::Training => DomainKind::Training,
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn registry(config: &Config, bus: &Bus) -> Result<ConnectorRegistry> {
    ConnectorRegistry::from_config(config, bus).context("building connectors")
}

async fn with_connector<F, Fut>(config: &Config, id: &str, f: F) -> Result<()>
where
    F: FnOnce(Arc<dyn DynConnector>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let registry = registry(config, &Bus::default())?;
    let Some(connector) = registry.get(id) else {
        bail!(
            "no connector '{id}' (configured: {})",
            registry.ids().join(", ")
        );
    };
    connector.connect().await?;
    let result = f(Arc::clone(&connector)).await;
    connector.disconnect().await?;
    result
}

async fn run(config: Config, log_events: bool) -> Result<()> {
    let bus = Bus::default();
    let registry = registry(&config, &bus)?;
    if registry.is_empty() {
        bail!("no connectors configured");
    }

    let mut rx = bus.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(env) if log_events => {
                    tracing::info!(target: "ethica::events", connector = %env.connector, kind = %env.kind, payload = %env.payload, "event");
                }
                Ok(env) => {
                    tracing::debug!(target: "ethica::events", connector = %env.connector, kind = %env.kind, "event");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(target: "ethica::events", skipped = n, "event watcher lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let failed = registry.connect_all().await;
    if failed.len() == registry.len() {
        bail!("every connector failed to connect");
    }
    tracing::info!(
        connected = registry.len() - failed.len(),
        failed = failed.len(),
        "connectors running; Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("shutting down");
    registry.disconnect_all().await;
    watcher.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    ethica_otel::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema { domain } => {
            let schema = match DomainKind::from(domain) {
                DomainKind::Employees => Employees::schema(),
                DomainKind::Surveys => Surveys::schema(),
                DomainKind::Training => TrainingEvents::schema(),
            };
            print_json(&schema)
        }
        Commands::ConfigSchema => print_json(&config_schema_json()?),
        Commands::Check => {
            let config = load_config(&cli.config)?;
            let summary: Vec<Value> = config
                .connectors
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "domain": c.domain,
                        "endpoint": c.endpoint_url().map(|u| u.to_string()).ok(),
                        "credentials": c.resolve_token().is_ok(),
                        "realtime": c.realtime.enabled,
                    })
                })
                .collect();
            print_json(&summary)
        }
        Commands::Query { connector, sql } => {
            let config = load_config(&cli.config)?;
            with_connector(&config, &connector, |c| async move {
                print_json(&c.execute_sql(&sql).await?)
            })
            .await
        }
        Commands::Analytics { connector } => {
            let config = load_config(&cli.config)?;
            with_connector(&config, &connector, |c| async move {
                print_json(&c.analytics_json())
            })
            .await
        }
        Commands::Run { events } => run(load_config(&cli.config)?, events).await,
    }
}
