use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use knowbase::chat::ChatRequest;
use knowbase::config::{self, Config};
use knowbase::index::{IndexStore, MemoryIndex};
use knowbase::ingest::ingest_dir;
use knowbase::models::{HistoryMessage, Role};
use knowbase::search::SearchMode;
use knowbase::server::{run_server, AppState};

#[derive(Parser)]
#[command(name = "kb")]
#[command(about = "Personal knowledge-base assistant: hybrid search and RAG chat over notes")]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = "./config/knowbase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Notes directory to index before serving
        #[arg(long)]
        notes: Option<PathBuf>,
    },
    /// Search indexed notes
    Search {
        /// Search query
        query: String,
        /// Search mode: keyword, semantic, or mixed
        #[arg(long, default_value = "mixed")]
        mode: String,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
        /// Notes directory to index first
        #[arg(long)]
        notes: Option<PathBuf>,
    },
    /// Ask a question against indexed notes
    Chat {
        /// The question to answer
        question: String,
        /// Notes directory to index first
        #[arg(long)]
        notes: Option<PathBuf>,
        /// Skip self-evaluation and supplements
        #[arg(long)]
        no_analysis: bool,
    },
    /// Suggest tags for a note
    Tags {
        /// Note title (or filename)
        #[arg(long)]
        title: String,
        /// Note content
        #[arg(long, default_value = "")]
        content: String,
        /// Maximum number of tags
        #[arg(long)]
        max_tags: Option<usize>,
    },
    /// Show AI availability and index stats
    Status {
        /// Force a fresh availability probe
        #[arg(long)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve { notes } => {
            let state = build_state(config)?;
            if let Some(dir) = notes {
                ingest(&state.index, &dir).await?;
            }
            run_server(state).await?;
        }

        Commands::Search {
            query,
            mode,
            limit,
            notes,
        } => {
            let state = build_state(config)?;
            if let Some(dir) = notes {
                ingest(&state.index, &dir).await?;
            }

            let mode: SearchMode = mode.parse().map_err(anyhow::Error::from)?;
            let limit = limit.unwrap_or(state.config.retrieval.default_limit);
            let response = state.controller.search(&query, mode, limit).await?;

            if response.degraded {
                if let Some(reason) = &response.degradation_reason {
                    println!("(degraded: {})", reason);
                }
            }
            if response.results.is_empty() {
                println!("No results.");
            }
            for r in &response.results {
                println!("{:.3}  {}  {}", r.score, r.path, r.title);
                if !r.snippet.is_empty() {
                    println!("       {}", r.snippet);
                }
            }
        }

        Commands::Chat {
            question,
            notes,
            no_analysis,
        } => {
            let state = build_state(config)?;
            if let Some(dir) = notes {
                ingest(&state.index, &dir).await?;
            }

            let request = ChatRequest {
                messages: vec![HistoryMessage {
                    role: Role::User,
                    content: question,
                }],
                stream: false,
                search_limit: None,
                max_context_length: None,
                enable_tools: true,
                use_intent_analysis: !no_analysis,
            };

            let (message, related) = state.orchestrator.run_aggregate(&request).await?;
            println!("{}", message.content);
            for supplement in &message.supplements {
                println!("\n--- supplement ---\n{}", supplement.content);
            }
            if !related.is_empty() {
                println!("\nRelated notes:");
                for doc in &related {
                    println!("  {:.3}  {}", doc.similarity, doc.path);
                }
            }
        }

        Commands::Tags {
            title,
            content,
            max_tags,
        } => {
            let state = build_state(config)?;
            let response = state.controller.suggest_tags(&title, &content, max_tags).await;
            if response.degraded {
                if let Some(reason) = &response.degradation_reason {
                    println!("(degraded: {})", reason);
                }
            }
            println!("{}", response.tags.join(", "));
        }

        Commands::Status { refresh } => {
            let state = build_state(config)?;
            let available = state.monitor.is_available(refresh).await;
            let ai = state.monitor.state().await;
            let documents = state.index.document_count().await?;

            println!("AI enabled:    {}", ai.enabled);
            println!("AI available:  {}", available);
            match ai.last_checked {
                Some(ts) => println!("Last checked:  {}", ts.to_rfc3339()),
                None => println!("Last checked:  never"),
            }
            println!("Documents:     {}", documents);
        }
    }

    Ok(())
}

/// Read the config file if present; commands work against defaults when
/// it is absent.
fn load_config_or_default(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

fn build_state(config: Config) -> Result<AppState> {
    let index: Arc<dyn IndexStore> = Arc::new(MemoryIndex::new(config.chunking.max_tokens));
    AppState::build(Arc::new(config), index)
}

async fn ingest(index: &Arc<dyn IndexStore>, dir: &PathBuf) -> Result<()> {
    let summary = ingest_dir(index, dir).await?;
    println!(
        "Indexed {} notes ({} unchanged, {} skipped) from {}",
        summary.indexed,
        summary.unchanged,
        summary.skipped,
        dir.display()
    );
    Ok(())
}
