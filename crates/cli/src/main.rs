//! codectx CLI - semantic code search over a local vector index

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use codectx::{IndexEngine, IndexOptions, IndexProgress, SearchParams, SimilarParams};

mod logging;

#[derive(Parser)]
#[command(name = "codectx")]
#[command(about = "Index a codebase into a local vector store and search it semantically")]
#[command(after_help = "\
QUICK START:
  codectx index                   # Build the index for the current project
  codectx search \"parse config\"   # Hybrid semantic + keyword search
  codectx status                  # Inspect index health")]
struct Cli {
  /// Project root (default: current directory)
  #[arg(short, long, global = true)]
  project: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Index the codebase (incremental unless --force)
  Index {
    /// Discard the existing index and re-embed everything
    #[arg(long)]
    force: bool,
  },
  /// Search indexed code
  Search {
    query: String,
    #[arg(short, long, default_value = "10")]
    limit: usize,
    /// Filter by path glob; prefix with ! to negate
    #[arg(long)]
    path: Option<String>,
    /// Filter by language (repeatable)
    #[arg(long)]
    lang: Vec<String>,
  },
  /// Find code similar to a snippet or file range
  Similar {
    /// Inline code snippet to match
    #[arg(long, conflicts_with = "file")]
    code: Option<String>,
    /// File to take the probe from (with --start/--end)
    #[arg(long, requires = "start", requires = "end")]
    file: Option<String>,
    #[arg(long)]
    start: Option<u32>,
    #[arg(long)]
    end: Option<u32>,
    #[arg(short, long, default_value = "10")]
    limit: usize,
    /// Minimum similarity in [0, 1]
    #[arg(long)]
    threshold: Option<f32>,
  },
  /// Show index status and health
  Status,
  /// Check whether the index lags the filesystem
  Stale,
  /// Drop the index and clear caches
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  logging::init();
  let cli = Cli::parse();

  let root = match cli.project {
    Some(path) => path,
    None => std::env::current_dir()?,
  };
  let engine = IndexEngine::initialize(&root).await?;

  match cli.command {
    Commands::Index { force } => cmd_index(&engine, force).await?,
    Commands::Search {
      query,
      limit,
      path,
      lang,
    } => cmd_search(&engine, query, limit, path, lang).await?,
    Commands::Similar {
      code,
      file,
      start,
      end,
      limit,
      threshold,
    } => cmd_similar(&engine, code, file, start, end, limit, threshold).await?,
    Commands::Status => cmd_status(&engine).await,
    Commands::Stale => cmd_stale(&engine).await?,
    Commands::Clear => cmd_clear(&engine).await?,
  }

  Ok(())
}

async fn cmd_index(engine: &IndexEngine, force: bool) -> Result<()> {
  let (tx, mut rx) = tokio::sync::mpsc::channel::<IndexProgress>(64);
  let printer = tokio::spawn(async move {
    while let Some(progress) = rx.recv().await {
      let eta = progress
        .eta_seconds
        .map(|s| format!(" (~{}s left)", s.ceil() as u64))
        .unwrap_or_default();
      eprintln!(
        "[{}] {}/{} {}{}",
        progress.phase, progress.current, progress.total, progress.message, eta
      );
    }
  });

  let options = IndexOptions {
    force_reindex: force,
    ..Default::default()
  };
  let stats = engine.index_codebase(&options, Some(tx)).await?;
  let _ = printer.await;

  println!(
    "Indexed {} files into {} chunks ({})",
    stats.files_indexed,
    stats.chunks_created,
    if stats.incremental { "incremental" } else { "full" }
  );
  Ok(())
}

async fn cmd_search(
  engine: &IndexEngine,
  query: String,
  limit: usize,
  path: Option<String>,
  lang: Vec<String>,
) -> Result<()> {
  let params = SearchParams {
    query,
    limit: Some(limit),
    path_pattern: path,
    languages: if lang.is_empty() { None } else { Some(lang) },
  };
  let results = engine.search(&params).await?;

  if results.is_empty() {
    println!("No results.");
    return Ok(());
  }

  for chunk in results {
    let symbol = match (&chunk.symbol_kind, &chunk.symbol_name) {
      (Some(kind), Some(name)) => format!(" [{} {}]", kind, name),
      _ => String::new(),
    };
    println!("{}:{}-{}{}", chunk.filepath, chunk.start_line, chunk.end_line, symbol);
    for line in chunk.content.lines().take(4) {
      println!("    {}", line);
    }
    println!();
  }
  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_similar(
  engine: &IndexEngine,
  code: Option<String>,
  file: Option<String>,
  start: Option<u32>,
  end: Option<u32>,
  limit: usize,
  threshold: Option<f32>,
) -> Result<()> {
  let params = SimilarParams {
    code,
    filepath: file,
    start_line: start,
    end_line: end,
    limit: Some(limit),
    threshold,
    exclude_self: true,
  };
  let hits = engine.search_similar(&params).await?;

  if hits.is_empty() {
    println!("No similar code found.");
    return Ok(());
  }

  for hit in hits {
    println!(
      "{:.3}  {}:{}-{}",
      hit.similarity, hit.chunk.filepath, hit.chunk.start_line, hit.chunk.end_line
    );
  }
  Ok(())
}

async fn cmd_status(engine: &IndexEngine) {
  let status = engine.get_status().await;

  if !status.indexed {
    println!("Not indexed. Run `codectx index` first.");
    return;
  }

  println!("Indexed:   yes");
  println!("Files:     {}", status.file_count);
  println!("Chunks:    {}", status.chunk_count);
  if let Some(updated) = status.last_updated {
    println!("Updated:   {}", updated.to_rfc3339());
  }
  if let Some(backend) = &status.embedding_backend {
    println!("Backend:   {}", backend);
  }
  println!("Store:     {}", status.index_path);
  if status.corrupted {
    println!(
      "CORRUPTED: {}",
      status.corruption_reason.as_deref().unwrap_or("unknown reason")
    );
  }
}

async fn cmd_stale(engine: &IndexEngine) -> Result<()> {
  let report = engine.check_if_stale().await?;
  if report.stale {
    println!("Stale: {}", report.reason.as_deref().unwrap_or("unknown reason"));
  } else {
    println!("Index is up to date.");
  }
  Ok(())
}

async fn cmd_clear(engine: &IndexEngine) -> Result<()> {
  engine.clear_index().await?;
  println!("Index cleared.");
  Ok(())
}
