mod corpus;
mod db;
mod fetcher;
mod pgn;
mod sample;
mod sink;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use corpus::{CorpusWriter, ListingOrder};
use sink::{CsvSink, WritePolicy};

#[derive(Parser)]
#[command(name = "pgn_san", about = "PGN corpus to single-line SAN move records")]
struct Cli {
    /// SQLite database holding the move table
    #[arg(long, global = true, env = "PGN_SAN_DB", default_value = db::DEFAULT_DB_PATH)]
    db: PathBuf,
    /// Table receiving one row per game
    #[arg(long, global = true, env = "PGN_SAN_TABLE", default_value = db::DEFAULT_TABLE)]
    table: String,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that walks a corpus directory.
#[derive(Args)]
struct CorpusArgs {
    /// Directory containing the downloaded corpus files
    #[arg(short, long)]
    dir: PathBuf,
    /// Only files whose name ends with this suffix are read
    #[arg(long, default_value = corpus::DEFAULT_SUFFIX)]
    suffix: String,
    /// File visiting order
    #[arg(long, value_enum, default_value_t = ListingOrder::Sorted)]
    order: ListingOrder,
    /// Files parsed in parallel (output order is unchanged)
    #[arg(short, long, default_value = "1")]
    jobs: usize,
    /// Log and skip records that fail to write instead of aborting
    #[arg(long)]
    keep_going: bool,
}

impl CorpusArgs {
    fn writer(&self) -> CorpusWriter {
        CorpusWriter {
            policy: WritePolicy::from_keep_going(self.keep_going),
            jobs: self.jobs.max(1),
            progress: true,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download every corpus file linked from a listing page
    Fetch {
        /// Listing page URL
        #[arg(short, long)]
        url: String,
        /// Destination directory
        #[arg(short, long)]
        dest: PathBuf,
        #[arg(long, default_value = corpus::DEFAULT_SUFFIX)]
        suffix: String,
        /// Re-download files already recorded in the manifest
        #[arg(long)]
        force: bool,
        /// Concurrent downloads
        #[arg(short, long, default_value_t = fetcher::DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
    /// Extract move records from a corpus directory into a CSV file
    Extract {
        #[command(flatten)]
        corpus: CorpusArgs,
        /// Output CSV path
        #[arg(short, long)]
        out: PathBuf,
        /// Do not write the `moves` header row
        #[arg(long)]
        no_header: bool,
    },
    /// Extract move records from a corpus directory straight into the table
    Run {
        #[command(flatten)]
        corpus: CorpusArgs,
    },
    /// Bulk-load the first column of a CSV file into the table
    Load {
        /// Input CSV path
        #[arg(short, long)]
        csv: PathBuf,
        /// The CSV has no header row
        #[arg(long)]
        no_header: bool,
        #[arg(long)]
        keep_going: bool,
    },
    /// Copy the header and the first N rows of a CSV file
    Sample {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short = 'n', long, default_value_t = sample::DEFAULT_LIMIT)]
        limit: usize,
        /// The CSV has no header row
        #[arg(long)]
        no_header: bool,
    },
    /// Show the row count and the first records of the table
    Stats {
        /// Records to display
        #[arg(short = 'n', long, default_value = "5")]
        show: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    db::validate_table(&cli.table)?;

    let result = match cli.command {
        Commands::Fetch {
            url,
            dest,
            suffix,
            force,
            concurrency,
        } => {
            let opts = fetcher::FetchOptions {
                dest,
                suffix,
                concurrency,
                force,
            };
            let stats = fetcher::fetch_corpus(&url, &opts).await?;
            println!(
                "Done: {} files ({} downloaded, {} already present, {} errors) in {}",
                stats.total,
                stats.ok,
                stats.skipped,
                stats.errors,
                opts.dest.display()
            );
            Ok(())
        }
        Commands::Extract {
            corpus: args,
            out,
            no_header,
        } => {
            let files = corpus::scan_corpus(&args.dir, &args.suffix, args.order)?;
            if files.is_empty() {
                println!("No *{} files in {}.", args.suffix, args.dir.display());
                return Ok(());
            }
            println!("Extracting {} files to {}...", files.len(), out.display());
            let mut sink = CsvSink::create(&out, !no_header)?;
            let stats = args.writer().write_all(&files, &mut sink)?;
            stats.print();
            Ok(())
        }
        Commands::Run { corpus: args } => {
            let files = corpus::scan_corpus(&args.dir, &args.suffix, args.order)?;
            if files.is_empty() {
                println!("No *{} files in {}.", args.suffix, args.dir.display());
                return Ok(());
            }
            let conn = db::connect(&cli.db)?;
            let mut sink = db::TableSink::new(&conn, &cli.table)?;
            println!(
                "Pipeline: {} files into {}:{}...",
                files.len(),
                cli.db.display(),
                cli.table
            );
            let stats = args.writer().write_all(&files, &mut sink)?;
            stats.print();
            Ok(())
        }
        Commands::Load {
            csv,
            no_header,
            keep_going,
        } => {
            let conn = db::connect(&cli.db)?;
            let input = std::fs::File::open(&csv)
                .with_context(|| format!("Failed to open {}", csv.display()))?;
            let stats = db::load_csv(
                &conn,
                &cli.table,
                input,
                !no_header,
                WritePolicy::from_keep_going(keep_going),
            )?;
            println!(
                "Loaded {} of {} rows into {} ({} errors).",
                stats.loaded, stats.rows, cli.table, stats.errors
            );
            Ok(())
        }
        Commands::Sample {
            input,
            output,
            limit,
            no_header,
        } => {
            let stats = sample::sample_file(&input, &output, limit, !no_header)?;
            println!(
                "Copied {} rows{} to {}",
                stats.rows,
                if stats.header { " plus header" } else { "" },
                output.display()
            );
            Ok(())
        }
        Commands::Stats { show } => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn, &cli.table)?;
            let total = db::count_rows(&conn, &cli.table)?;
            println!("Games in {}: {}", cli.table, total);
            for (id, moves) in db::fetch_head(&conn, &cli.table, show)? {
                println!("{:>8} | {}", id, truncate(&moves, 100));
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Cut `s` after `max` characters, marking the cut with `...`.
fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{:.1}s", d.as_secs_f64()),
        (0, _) => format!("{m}m {s}s"),
        _ => format!("{h}h {m}m {s}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn truncate_long_records() {
        assert_eq!(truncate("1. e4 e5", 20), "1. e4 e5");
        assert_eq!(truncate("1. e4 e5 2. Nf3", 5), "1. e4...");
        assert_eq!(truncate("1. e4 e5", 8), "1. e4 e5");
        // Cuts on character boundaries, not bytes.
        assert_eq!(truncate("1. Sf3 {Réti} Sf6", 11), "1. Sf3 {Rét...");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn cli_parses_extract() {
        let cli = Cli::try_parse_from([
            "pgn_san", "extract", "--dir", "pgns", "--out", "games.csv", "--jobs", "4",
            "--order", "native", "--keep-going",
        ])
        .unwrap();
        match cli.command {
            Commands::Extract { corpus: args, out, no_header } => {
                assert_eq!(args.dir, PathBuf::from("pgns"));
                assert_eq!(args.order, ListingOrder::Native);
                assert_eq!(args.suffix, ".pgn");
                assert_eq!(out, PathBuf::from("games.csv"));
                assert!(!no_header);
                let w = args.writer();
                assert_eq!(w.jobs, 4);
                assert_eq!(w.policy, WritePolicy::SkipAndContinue);
            }
            _ => panic!("expected extract"),
        }
    }

    #[test]
    fn cli_sample_defaults() {
        let cli = Cli::try_parse_from(["pgn_san", "sample", "-i", "a.csv", "-o", "b.csv"]).unwrap();
        match cli.command {
            Commands::Sample { limit, no_header, .. } => {
                assert_eq!(limit, sample::DEFAULT_LIMIT);
                assert!(!no_header);
            }
            _ => panic!("expected sample"),
        }
    }
}
