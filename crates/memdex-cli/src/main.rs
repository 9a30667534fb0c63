//! `memdex` command-line interface.

use clap::{Parser, Subcommand};
use memdex_memory::{MemoryConfig, MemoryService};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "memdex.toml";

#[derive(Parser, Debug)]
#[command(name = "memdex", about = "memdex: local hybrid search over memory files")]
struct Cli {
    /// Path to config file (default: ./memdex.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Memory root directory (overrides config)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Project identifier selecting the store (overrides config)
    #[arg(long, global = true)]
    project: Option<String>,

    /// Emit JSON output and JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every memory file with the index
    Index,
    /// Hybrid search over indexed chunks
    Search {
        query: String,
        /// Maximum number of results
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Show one chunk by id
    Get { id: String },
    /// List the chunks of one file
    Chunks { path: String },
    /// Write a memory file and index it
    Write {
        /// Path relative to the memory root
        path: String,
        /// Content to write, or `-` to read stdin
        content: String,
        /// Append instead of overwriting
        #[arg(long)]
        append: bool,
    },
    /// Show index statistics and capabilities
    Status,
    /// Index, then keep the index in sync until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(&cli)?;
    let service = MemoryService::open(config).await?;
    let result = run(&cli, &service).await;
    service.shutdown().await?;
    result
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read the config file (explicit path must exist, the default may be
/// absent) and apply command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<MemoryConfig> {
    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => read_config(Path::new(DEFAULT_CONFIG))?,
        None => MemoryConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.memory_root = root.clone();
    }
    if let Some(project) = &cli.project {
        config.project = project.clone();
    }
    Ok(config)
}

fn read_config(path: &Path) -> anyhow::Result<MemoryConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
    })?;
    let config: MemoryConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path.display(), e))?;
    Ok(config)
}

/// Startup full pass, so reads never serve files deleted or changed while
/// nothing was running. `index` and `watch` run and report their own pass.
async fn reconcile_on_startup(cli: &Cli, service: &MemoryService) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::Index | Commands::Watch) {
        return Ok(());
    }
    let report = service.index_all().await?;
    debug!(
        indexed = report.files_indexed,
        removed = report.files_removed,
        "startup reconcile done"
    );
    Ok(())
}

async fn run(cli: &Cli, service: &MemoryService) -> anyhow::Result<()> {
    reconcile_on_startup(cli, service).await?;
    match &cli.command {
        Commands::Index => {
            let report = service.index_all().await?;
            emit(cli.json, &report, || {
                format!(
                    "indexed {} file(s), {} unchanged, {} removed, {} skipped, \
                     {} chunk(s) written, {} error(s)",
                    report.files_indexed,
                    report.files_unchanged,
                    report.files_removed,
                    report.files_skipped,
                    report.chunks_written,
                    report.errors
                )
            })?;
        }
        Commands::Search { query, limit } => {
            let results = service.search(query, *limit).await?;
            emit(cli.json, &results, || {
                if results.is_empty() {
                    return "No results.".to_string();
                }
                results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        format!(
                            "{}. {}:{}-{} (score {:.4}, id {})\n{}\n",
                            i + 1,
                            r.path,
                            r.start_line,
                            r.end_line,
                            r.score,
                            r.id,
                            indent(&r.text)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Commands::Get { id } => {
            let chunk = service
                .get_chunk(id)?
                .ok_or_else(|| anyhow::anyhow!("No chunk with id '{id}'"))?;
            emit(cli.json, &chunk, || {
                format!(
                    "{}:{}-{}\n{}",
                    chunk.path, chunk.start_line, chunk.end_line, chunk.text
                )
            })?;
        }
        Commands::Chunks { path } => {
            let chunks = service.get_file_chunks(path)?;
            emit(cli.json, &chunks, || {
                if chunks.is_empty() {
                    return format!("No chunks indexed for '{path}'.");
                }
                chunks
                    .iter()
                    .map(|c| format!("{} lines {}-{}", c.id, c.start_line, c.end_line))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Commands::Write {
            path,
            content,
            append,
        } => {
            let content = if content == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                content.clone()
            };
            let report = service.write(path, &content, *append).await?;
            emit(cli.json, &report, || {
                format!(
                    "wrote {} byte(s) to {} ({:?})",
                    report.bytes_written, report.path, report.outcome
                )
            })?;
        }
        Commands::Status => {
            let status = service.status().await?;
            emit(cli.json, &status, || {
                format!(
                    "root:       {}\n\
                     store:      {}\n\
                     files:      {}\n\
                     chunks:     {}\n\
                     db size:    {} bytes\n\
                     lexical:    {}\n\
                     vector:     {}\n\
                     embeddings: {}",
                    status.memory_root.display(),
                    status
                        .store_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    status.files,
                    status.chunks,
                    status.db_size_bytes,
                    on_off(status.lexical_enabled),
                    on_off(status.vector_enabled),
                    status.embedding_model.as_deref().unwrap_or("unavailable"),
                )
            })?;
        }
        Commands::Watch => {
            let report = service.index_all().await?;
            info!(
                indexed = report.files_indexed,
                removed = report.files_removed,
                "initial reconcile done"
            );
            service.watch().await?;
            info!("watching for changes, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
        }
    }
    Ok(())
}

/// Print `value` as JSON, or the human-readable rendering.
fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|l| format!("    {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
