use crate::batch::diagnostics::{DiagnosticEntry, DiagnosticsReport};
use crate::batch::mapping::JobMapping;
use crate::batch::response::{parse_response_line, ParsedResponse};
use crate::batch::ParseFailure;
use crate::db::models::SongAnalysis;
use crate::db::Database;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to write diagnostics to {}: {source}", path.display())]
    Diagnostics {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct IngestOptions<'a> {
    /// Parser threads. 0 = rayon default.
    pub workers: usize,
    /// Parse and report, but leave the store untouched.
    pub dry_run: bool,
    pub diagnostics_path: Option<&'a Path>,
}

pub struct IngestResult {
    /// Non-blank lines read.
    pub lines: usize,
    /// Lines that yielded valid metadata (directly or after repair).
    pub parsed: usize,
    pub repaired: usize,
    /// Lines that could not be used at all.
    pub failed: usize,
    /// Song references that could not be resolved to a stored song.
    pub unmapped: usize,
    /// Songs written (or, in a dry run, that would be written).
    pub stored: usize,
}

/// Where a pass writes its failure report when none is configured:
/// `batch_output.jsonl` → `batch_output.diagnostics.json`, next to the batch file.
pub fn default_diagnostics_path(batch_path: &Path) -> PathBuf {
    batch_path.with_extension("diagnostics.json")
}

/// Parse result for one batch output line.
pub struct LineOutcome {
    /// 1-based line number in the source file.
    pub line_no: usize,
    pub result: Result<ParsedResponse, ParseFailure>,
}

/// Parse every non-blank line of a batch output file in parallel.
///
/// Lines are independent, so a failure on one never affects another; outcomes
/// come back in file order.
pub fn parse_batch_text(text: &str, pb: &ProgressBar) -> Vec<LineOutcome> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l))
        .collect();

    lines
        .par_iter()
        .map(|&(line_no, line)| {
            let result = parse_response_line(line);
            pb.inc(1);
            LineOutcome { line_no, result }
        })
        .collect()
}

/// Ingest one batch output file: parse/repair every line, resolve each result
/// through the job mapping, and store all successes in a single transaction.
///
/// Per-line problems are counted and written to the diagnostics file; only
/// I/O and store failures abort the pass.
pub fn ingest_batch_file(
    db: &Database,
    batch_path: &Path,
    mapping: &JobMapping,
    opts: &IngestOptions,
) -> Result<IngestResult, IngestError> {
    let text = std::fs::read_to_string(batch_path).map_err(|e| IngestError::Io {
        path: batch_path.to_path_buf(),
        source: e,
    })?;

    let line_count = text.lines().filter(|l| !l.trim().is_empty()).count();
    log::info!(
        "Parsing {} lines from {} with {} workers",
        line_count,
        batch_path.display(),
        opts.workers
    );

    let pb = ProgressBar::new(line_count as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} lines ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers)
        .build()?;
    let outcomes = pool.install(|| parse_batch_text(&text, &pb));
    pb.finish_and_clear();

    let mut result = IngestResult {
        lines: outcomes.len(),
        parsed: 0,
        repaired: 0,
        failed: 0,
        unmapped: 0,
        stored: 0,
    };
    let mut diagnostics = Vec::new();
    let mut to_store: Vec<(i64, SongAnalysis)> = Vec::new();

    for outcome in outcomes {
        let parsed = match outcome.result {
            Ok(parsed) => parsed,
            Err(failure) => {
                log::warn!("Line {}: {}", outcome.line_no, failure);
                diagnostics.push(DiagnosticEntry::from_failure(outcome.line_no, &failure));
                result.failed += 1;
                continue;
            }
        };

        let songs = match mapping.resolve(&parsed.custom_id) {
            Ok(descriptor) => descriptor.songs(),
            Err(e) => {
                log::warn!("Line {}: {}", outcome.line_no, e);
                diagnostics.push(DiagnosticEntry::unmapped(outcome.line_no, &parsed.custom_id, e.to_string()));
                result.unmapped += parsed.analyses.len();
                continue;
            }
        };

        if songs.len() != parsed.analyses.len() {
            let failure = ParseFailure::SchemaViolation {
                custom_id: parsed.custom_id.clone(),
                reason: format!(
                    "job targets {} songs but response has {} analyses",
                    songs.len(),
                    parsed.analyses.len()
                ),
            };
            log::warn!("Line {}: {}", outcome.line_no, failure);
            diagnostics.push(DiagnosticEntry::from_failure(outcome.line_no, &failure));
            result.failed += 1;
            continue;
        }

        result.parsed += 1;
        if parsed.was_repaired() {
            log::info!(
                "Line {}: {} repaired by {}",
                outcome.line_no,
                parsed.custom_id,
                parsed.repaired_by.join(" > ")
            );
            result.repaired += 1;
        }

        for (song, analysis) in songs.iter().zip(parsed.analyses) {
            match db.find_song_id(song)? {
                Some(song_id) => to_store.push((song_id, analysis)),
                None => {
                    let message = format!("song {song} not found in catalog");
                    log::warn!("Line {}: {}: {}", outcome.line_no, parsed.custom_id, message);
                    diagnostics.push(DiagnosticEntry::unmapped(outcome.line_no, &parsed.custom_id, message));
                    result.unmapped += 1;
                }
            }
        }
    }

    result.stored = to_store.len();
    if opts.dry_run {
        log::info!("Dry run: {} analyses not written", to_store.len());
    } else if !to_store.is_empty() {
        let analyzed_at = chrono::Utc::now().to_rfc3339();
        db.store_analyses(&to_store, &analyzed_at)?;
        log::info!("Stored {} analyses", to_store.len());
    }

    if let Some(path) = opts.diagnostics_path {
        DiagnosticsReport::new(batch_path, diagnostics)
            .write(path)
            .map_err(|e| IngestError::Diagnostics {
                path: path.to_path_buf(),
                source: e,
            })?;
        log::info!("Diagnostics written to {}", path.display());
    }

    Ok(result)
}
