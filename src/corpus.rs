use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::pgn::{self, NormalizedGameRecord};
use crate::sink::{lost_records, RecordSink, WritePolicy};

pub const DEFAULT_SUFFIX: &str = ".pgn";

/// Order in which corpus files are visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ListingOrder {
    /// Lexicographic by file name; reproducible across platforms.
    #[default]
    Sorted,
    /// Whatever the directory listing returns.
    Native,
}

/// List the corpus files of `dir` whose names end with `suffix`.
pub fn scan_corpus(dir: &Path, suffix: &str, order: ListingOrder) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(suffix) {
            continue;
        }
        // Follows symlinks; directories named *.pgn are not corpus files.
        if entry.path().is_dir() {
            continue;
        }
        files.push(entry.path());
    }

    if order == ListingOrder::Sorted {
        files.sort_by(|a, b| {
            let a = a.file_name().map(OsStr::as_encoded_bytes);
            let b = b.file_name().map(OsStr::as_encoded_bytes);
            a.cmp(&b)
        });
    }
    Ok(files)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CorpusStats {
    pub files: usize,
    pub failed_files: usize,
    pub games: usize,
    pub written: usize,
    pub write_errors: usize,
}

impl CorpusStats {
    pub fn print(&self) {
        println!(
            "Extracted {} games from {} files ({} unreadable); wrote {} records ({} write errors).",
            self.games, self.files, self.failed_files, self.written, self.write_errors,
        );
    }

    /// Move records rolled back by a failed commit from written to errors.
    fn discard(&mut self, lost: usize) {
        let lost = lost.min(self.written);
        self.written -= lost;
        self.write_errors += lost;
    }
}

/// Drives every corpus file through segmentation and extraction into a sink.
pub struct CorpusWriter {
    pub policy: WritePolicy,
    /// Files processed concurrently; 1 keeps the pass fully streaming.
    pub jobs: usize,
    pub progress: bool,
}

impl Default for CorpusWriter {
    fn default() -> Self {
        Self {
            policy: WritePolicy::FailFast,
            jobs: 1,
            progress: false,
        }
    }
}

impl CorpusWriter {
    pub fn write_all<S: RecordSink + ?Sized>(
        &self,
        files: &[PathBuf],
        sink: &mut S,
    ) -> Result<CorpusStats> {
        let pb = self.progress_bar(files.len());
        let mut stats = CorpusStats::default();

        if self.jobs <= 1 {
            for path in files {
                self.stream_file(path, sink, &mut stats)?;
                pb.inc(1);
            }
        } else {
            for chunk in files.chunks(self.jobs) {
                let results: Vec<_> = chunk.par_iter().map(|p| read_file(p)).collect();
                for (path, result) in chunk.iter().zip(results) {
                    stats.files += 1;
                    let (records, read_error) = result;
                    if let Some(e) = read_error {
                        warn!("Skipping rest of {}: {:#}", path.display(), e);
                        stats.failed_files += 1;
                    }
                    stats.games += records.len();
                    for record in &records {
                        self.write_one(sink, record, path, &mut stats)?;
                    }
                    pb.inc(1);
                }
            }
        }

        pb.finish_and_clear();
        if let Err(e) = sink.finish() {
            let lost = lost_records(&e);
            if self.policy == WritePolicy::FailFast || lost == 0 {
                return Err(e);
            }
            warn!("Final flush lost {} records: {:#}", lost, e);
            stats.discard(lost);
        }
        info!(
            "Corpus pass done: {} files, {} games, {} written",
            stats.files, stats.games, stats.written
        );
        Ok(stats)
    }

    fn stream_file<S: RecordSink + ?Sized>(
        &self,
        path: &Path,
        sink: &mut S,
        stats: &mut CorpusStats,
    ) -> Result<()> {
        stats.files += 1;
        let records = match pgn::open_records(path) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping {}: {:#}", path.display(), e);
                stats.failed_files += 1;
                return Ok(());
            }
        };

        let mut games = 0usize;
        for record in records {
            match record {
                Ok(record) => {
                    games += 1;
                    stats.games += 1;
                    self.write_one(sink, &record, path, stats)?;
                }
                Err(e) => {
                    warn!("Read error in {} after {} games: {}", path.display(), games, e);
                    stats.failed_files += 1;
                    break;
                }
            }
        }
        debug!("{}: {} games", path.display(), games);
        Ok(())
    }

    fn write_one<S: RecordSink + ?Sized>(
        &self,
        sink: &mut S,
        record: &NormalizedGameRecord,
        path: &Path,
        stats: &mut CorpusStats,
    ) -> Result<()> {
        let Err(e) = sink.write_record(record) else {
            stats.written += 1;
            return Ok(());
        };
        stats.discard(lost_records(&e));
        if self.policy == WritePolicy::FailFast {
            return Err(e.context(format!("Failed to write a game from {}", path.display())));
        }
        warn!("Failed to write a game from {}: {:#}", path.display(), e);
        stats.write_errors += 1;
        Ok(())
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({per_sec})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

/// Buffer one file's records. A read error keeps the records seen before it.
fn read_file(path: &Path) -> (Vec<NormalizedGameRecord>, Option<anyhow::Error>) {
    let records = match pgn::open_records(path) {
        Ok(r) => r,
        Err(e) => return (Vec::new(), Some(e)),
    };
    let mut out = Vec::new();
    for record in records {
        match record {
            Ok(r) => out.push(r),
            Err(e) => return (out, Some(e.into())),
        }
    }
    (out, None)
}

// ── Tests ──
