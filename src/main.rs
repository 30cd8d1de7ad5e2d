use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use moodring::batch::mapping::{merge_mapping_files, JobMapping, MergeOutcome};
use moodring::db::models::NewSong;
use std::path::PathBuf;

const DEFAULT_PRIMARY_MAPPING: &str = "batch_mapping.json";
const DEFAULT_RETRY_MAPPING: &str = "batch_mapping_retry.json";

#[derive(Parser)]
#[command(name = "moodring", version, about = "Reconcile AI-generated song metadata with the catalog")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or update songs from a catalog export (JSON array)
    Import {
        /// Catalog file: [{"external_id", "title", "artist", "locator"}, ...]
        path: PathBuf,
    },

    /// Merge the retry job mapping into the primary mapping (retry wins)
    MergeMappings {
        /// Primary mapping file (defaults to config, then batch_mapping.json)
        #[arg(long)]
        primary: Option<PathBuf>,

        /// Retry mapping file (defaults to config, then batch_mapping_retry.json)
        #[arg(long)]
        retry: Option<PathBuf>,
    },

    /// Parse, repair and store a batch output file
    Ingest {
        /// Batch output file (JSONL)
        batch: PathBuf,

        /// Job mapping file (defaults to config, then batch_mapping.json)
        #[arg(long)]
        mapping: Option<PathBuf>,

        /// Merge this retry mapping into the mapping before ingesting
        #[arg(long)]
        merge_retry: Option<PathBuf>,

        /// Failure report path (defaults to config, then <batch>.diagnostics.json)
        #[arg(long)]
        diagnostics: Option<PathBuf>,

        /// Number of parser threads (0 = auto)
        #[arg(short, long, default_value = "0")]
        jobs: usize,

        /// Parse and report without writing to the database
        #[arg(long)]
        dry_run: bool,
    },

    /// Mark every song present in the vector index as COMPLETED
    RepairEmbeddings {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show disagreement between embedding status and the vector index
    Drift,

    /// List analyzed songs still waiting for an embedding
    Pending {
        /// Maximum number of songs to list
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show catalog statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = moodring::config::AppConfig::load();

    let primary_mapping = |flag: Option<PathBuf>| {
        flag.or(config.batch.primary_mapping.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PRIMARY_MAPPING))
    };

    // Resolve database path: CLI > config > XDG default
    let db_path = cli.db_path
        .or(config.db_path.clone())
        .unwrap_or_else(moodring::config::default_db_path);

    // Opened per command so mapping merges never create a database
    let open_db = || {
        log::info!("Database: {}", db_path.display());
        moodring::db::Database::open(&db_path).context("Failed to open database")
    };

    match cli.command {
        Commands::Import { path } => {
            let db = open_db()?;
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let songs: Vec<NewSong> = serde_json::from_str(&contents)
                .with_context(|| format!("Invalid catalog file {}", path.display()))?;
            let imported = db.import_songs(&songs).context("Import failed")?;
            println!("Import complete: {} songs", imported);
        }

        Commands::MergeMappings { primary, retry } => {
            let primary = primary_mapping(primary);
            let retry = retry
                .or(config.batch.retry_mapping.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RETRY_MAPPING));
            let outcome = merge_mapping_files(&primary, &retry).context("Mapping merge failed")?;
            print_merge_outcome(&outcome);
        }

        Commands::Ingest { batch, mapping, merge_retry, diagnostics, jobs, dry_run } => {
            let db = open_db()?;
            let mapping_path = primary_mapping(mapping);

            if let Some(retry) = merge_retry {
                if dry_run {
                    println!("DRY RUN: skipping merge of {}", retry.display());
                } else {
                    let outcome = merge_mapping_files(&mapping_path, &retry)
                        .context("Mapping merge failed")?;
                    print_merge_outcome(&outcome);
                }
            }

            let mapping = JobMapping::load(&mapping_path)
                .with_context(|| format!("Failed to load mapping {}", mapping_path.display()))?;
            log::info!("Loaded {} job mappings from {}", mapping.len(), mapping_path.display());

            let diagnostics = diagnostics
                .or(config.batch.diagnostics_path.clone())
                .unwrap_or_else(|| moodring::ingest::default_diagnostics_path(&batch));
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let opts = moodring::ingest::IngestOptions {
                workers,
                dry_run,
                diagnostics_path: Some(&diagnostics),
            };
            let result = moodring::ingest::ingest_batch_file(&db, &batch, &mapping, &opts)
                .context("Ingestion failed")?;

            println!(
                "Ingest complete: {} lines, {} parsed ({} repaired), {} stored, {} failed, {} unmapped",
                result.lines, result.parsed, result.repaired, result.stored, result.failed, result.unmapped
            );
            if result.failed + result.unmapped > 0 {
                println!("Failures written to {}", diagnostics.display());
            }
            if dry_run && result.stored > 0 {
                println!("(dry run, re-run without --dry-run to write changes)");
            }
        }

        Commands::RepairEmbeddings { dry_run } => {
            let db = open_db()?;
            let result = moodring::consistency::repair_embedding_status(&db, dry_run)
                .context("Embedding status repair failed")?;
            if result.dry_run {
                println!("Repair (dry run): {} songs would be marked COMPLETED", result.updated);
            } else {
                println!("Repair complete: {} songs marked COMPLETED", result.updated);
            }
        }

        Commands::Drift => {
            let db = open_db()?;
            let report = moodring::consistency::drift_report(&db)
                .context("Failed to compute drift")?;
            println!("Vectors indexed:               {}", report.vectors);
            println!("Indexed, not marked COMPLETED: {}", report.unmarked_indexed);
            println!("COMPLETED, no vector:          {}", report.completed_without_vector);
            if report.unmarked_indexed > 0 {
                println!();
                println!("Run `moodring repair-embeddings` to fix.");
            }
        }

        Commands::Pending { limit } => {
            let db = open_db()?;
            let pending = db.songs_pending_embedding(limit)
                .context("Query failed")?;
            if pending.is_empty() {
                println!("No songs waiting for an embedding.");
                return Ok(());
            }
            println!("{:>6}  {:<25} {:<30}", "ID", "Artist", "Title");
            println!("{}", "-".repeat(63));
            for song in &pending {
                println!(
                    "{:>6}  {:<25} {:<30}",
                    song.song_id,
                    truncate(&song.artist, 25),
                    truncate(&song.title, 30)
                );
            }
        }

        Commands::Stats => {
            let db = open_db()?;
            let stats = db.stats().context("Failed to get stats")?;
            println!("Catalog Statistics");
            println!("==================");
            println!("Total songs:      {}", stats.total_songs);
            println!("Analyzed songs:   {}", stats.analyzed_songs);
            println!("Vectors:          {}", stats.vectors);
            println!();

            if !stats.statuses.is_empty() {
                println!("Embedding status:");
                for (status, count) in &stats.statuses {
                    println!("  {:<10} {}", status, count);
                }
            }
        }
    }

    Ok(())
}

fn print_merge_outcome(outcome: &MergeOutcome) {
    match outcome {
        MergeOutcome::Merged { primary_entries, retry_entries, overridden, total } => println!(
            "Merge complete: {} primary + {} retry entries, {} overridden, {} total",
            primary_entries, retry_entries, overridden, total
        ),
        MergeOutcome::Skipped { missing } => {
            for path in missing {
                println!("Mapping file not found: {}", path.display());
            }
            println!("Merge skipped");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
