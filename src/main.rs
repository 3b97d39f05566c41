//! slidegraph CLI - main entry point
//!
//! Ingest documents into a per-client knowledge graph, cluster it and query it.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use slidegraph::commands::{self, IngestArgs, OutputFormat, QueryArgs};
use slidegraph::{metrics, Config, KnowledgeService};
use tracing::warn;

#[derive(Parser)]
#[command(name = "slidegraph")]
#[command(about = "Document knowledge graphs for slide content retrieval", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to expose Prometheus metrics (e.g., 0.0.0.0:9898)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Storage root (overrides config.yml)
    #[arg(long, env = "SLIDEGRAPH_STORAGE_ROOT")]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest text documents for a client
    Ingest {
        /// Client id
        client: String,

        /// Text files to ingest
        files: Vec<PathBuf>,

        /// Directory to walk for .txt/.md files
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Cluster the client's graph afterwards
        #[arg(long, default_value_t = false)]
        cluster: bool,
    },

    /// Cluster all documents of a client and generate embeddings
    Cluster {
        /// Client id
        client: String,
    },

    /// Query a client's clustered graph
    Query {
        /// Client id
        client: String,

        /// Free-text content request
        text: String,

        /// Results per list (default from config)
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum relevance score (default from config)
        #[arg(long)]
        threshold: Option<f32>,

        /// Output format: text | json
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show graph statistics for a client, or list known clients
    Stats {
        /// Client id (omit to list clients)
        client: Option<String>,

        /// Print JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Delete all knowledge of a client
    Reset {
        /// Client id
        client: String,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Ingest { .. } => "ingest",
            Commands::Cluster { .. } => "cluster",
            Commands::Query { .. } => "query",
            Commands::Stats { .. } => "stats",
            Commands::Reset { .. } => "reset",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env for local development
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("slidegraph=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr.as_deref() {
        match addr.parse::<SocketAddr>() {
            Ok(socket) => metrics::spawn_metrics_server(socket),
            Err(err) => warn!(%addr, "Invalid metrics address: {}", err),
        }
    }

    let mut config = Config::new();
    if let Some(root) = cli.storage {
        config.storage_root = root;
    }
    let service = KnowledgeService::new(config);

    let timer = metrics::CommandTimer::start(cli.command.name());
    let result = execute_command(&service, cli.command).await;
    timer.finish(result.is_ok());

    result
}

async fn execute_command(service: &KnowledgeService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Ingest {
            client,
            files,
            dir,
            cluster,
        } => {
            commands::ingest_run(
                service,
                IngestArgs {
                    client,
                    files,
                    dir,
                    cluster,
                },
            )
            .await?;
        }
        Commands::Cluster { client } => {
            let report = service.cluster_client(&client).await?;
            println!(
                "Clustered {} documents for {}: {} -> {} entities, {} clusters ({:?})",
                report.documents,
                client,
                report.entities_before,
                report.entities_after,
                report.clusters,
                report.method
            );
            if let Some(reason) = report.fallback_reason {
                println!("Clustering fell back to union merge: {}", reason);
            }
        }
        Commands::Query {
            client,
            text,
            top_k,
            threshold,
            format,
        } => {
            commands::query_run(
                service,
                QueryArgs {
                    client,
                    text,
                    top_k,
                    threshold,
                    format: OutputFormat::parse(&format),
                },
            )
            .await?;
        }
        Commands::Stats { client, json } => match client {
            Some(client) => {
                commands::stats_run(service, &client, json).await?;
            }
            None => {
                commands::clients_run(service, json)?;
            }
        },
        Commands::Reset { client } => {
            commands::reset_run(service, &client).await?;
        }
    }

    Ok(())
}
