#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use compliance_research::config::ResearchConfig;
use compliance_research::gateway::{GatewayConfig, ProviderGateway, TracingUsageSink};
use compliance_research::research::{EventSink, ResearchDriver, SynthesisMode};
use compliance_research::sources::SourceDescriptor;
use compliance_research::store::ConversationStore;

#[derive(Parser)]
#[command(
    name = "compliance-research",
    version,
    about = "Research pipeline for compliance questions"
)]
struct Cli {
    /// SQLite file holding turns, requests and query logs
    #[arg(long, global = true, env = "RESEARCH_STORE_PATH")]
    store: Option<PathBuf>,
    /// Use one model for routing, planning and synthesis
    #[arg(long, global = true)]
    model: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one message through the pipeline and print the final result as JSON
    Ask {
        #[arg(long)]
        session: String,
        /// JSON array of source descriptors
        #[arg(long)]
        catalog: Option<PathBuf>,
        message: String,
    },
    /// Like `ask`, but print every progress event as a server-sent-event frame
    Stream {
        #[arg(long)]
        session: String,
        #[arg(long)]
        catalog: Option<PathBuf>,
        message: String,
    },
    /// Stop a turn, or every open turn of a session
    Cancel {
        #[arg(long, conflicts_with = "session", required_unless_present = "session")]
        turn: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value = "Cancelled by user")]
        reason: String,
    },
    /// Print the turns of a session
    History {
        #[arg(long)]
        session: String,
    },
    /// Print research requests of a session with their query logs
    Requests {
        #[arg(long)]
        session: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();

    let mut config = ResearchConfig::from_env()?;
    if let Some(path) = cli.store {
        config.store_path = path;
    }
    if let Some(model) = cli.model {
        config.pipeline = config.pipeline.with_models(model);
    }
    let store: Arc<dyn ConversationStore> = Arc::new(config.open_store()?);

    match cli.command {
        Commands::Ask {
            session,
            catalog,
            message,
        } => {
            let catalog = load_catalog(catalog.as_deref())?;
            let driver = build_driver(&config, Arc::clone(&store))?;
            let outcome = driver
                .ask(
                    &session,
                    &message,
                    &catalog,
                    SynthesisMode::Batch,
                    &EventSink::none(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Stream {
            session,
            catalog,
            message,
        } => {
            let catalog = load_catalog(catalog.as_deref())?;
            let driver = build_driver(&config, Arc::clone(&store))?;
            let (sink, mut rx) = EventSink::channel(64);

            let driver = &driver;
            let catalog = &catalog;
            let run = async move {
                let result = driver
                    .ask(&session, &message, catalog, SynthesisMode::Streaming, &sink)
                    .await;
                drop(sink);
                result
            };
            let print = async {
                let mut out = io::stdout().lock();
                while let Some(event) = rx.recv().await {
                    if out.write_all(event.to_sse().as_bytes()).is_err() || out.flush().is_err() {
                        break;
                    }
                }
            };
            let (result, ()) = tokio::join!(run, print);
            result?;
        }
        Commands::Cancel {
            turn,
            session,
            reason,
        } => match (turn, session) {
            (Some(turn), _) => {
                let flipped = store.mark_cancelled(&turn, &reason).await?;
                if flipped {
                    println!("turn {turn} cancelled");
                } else {
                    println!("turn {turn} was already cancelled");
                }
            }
            (None, Some(session)) => {
                let count = store.cancel_session(&session, &reason).await?;
                println!("{count} turns cancelled in session {session}");
            }
            (None, None) => return Err("cancel requires --turn or --session".into()),
        },
        Commands::History { session } => {
            let turns = store.turns_for_session(&session).await?;
            println!("{}", serde_json::to_string_pretty(&turns)?);
        }
        Commands::Requests { session } => {
            let requests = store.research_requests_for_session(&session).await?;
            let mut rows = Vec::with_capacity(requests.len());
            for request in requests {
                let logs = store.query_logs_for_request(&request.id).await?;
                rows.push(serde_json::json!({ "request": request, "query_logs": logs }));
            }
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

fn build_driver(
    config: &ResearchConfig,
    store: Arc<dyn ConversationStore>,
) -> Result<ResearchDriver, Box<dyn std::error::Error>> {
    let gateway = ProviderGateway::with_config(
        config.chat_adapter()?,
        Arc::new(TracingUsageSink),
        GatewayConfig::default(),
    );
    let search = config.search_adapter()?;
    Ok(ResearchDriver::new(
        Arc::new(gateway),
        Arc::new(search),
        store,
        config.pipeline.clone(),
    ))
}

fn load_catalog(path: Option<&Path>) -> Result<Vec<SourceDescriptor>, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read catalog {}: {e}", path.display()))?;
    let catalog: Vec<SourceDescriptor> = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid catalog {}: {e}", path.display()))?;
    Ok(catalog)
}
