use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use rusqlite::{Connection, Transaction};
use tracing::{debug, warn};

use crate::pgn::segmenter::decode_lossy;
use crate::pgn::NormalizedGameRecord;
use crate::sink::{lost_records, BatchLost, RecordSink, WritePolicy};

pub const DEFAULT_DB_PATH: &str = "data/chess.sqlite";
pub const DEFAULT_TABLE: &str = "chess_games";

/// Records per transaction before an intermediate commit.
const COMMIT_EVERY: usize = 10_000;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table(table: &str) -> Result<()> {
    if !IDENT_RE.is_match(table) {
        bail!("Invalid table name '{}': expected [A-Za-z_][A-Za-z0-9_]*", table);
    }
    Ok(())
}

pub fn init_schema(conn: &Connection, table: &str) -> Result<()> {
    validate_table(table)?;
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            id    INTEGER PRIMARY KEY,
            moves TEXT NOT NULL
        );
        "
    ))?;
    Ok(())
}

// ── Record sink ──

/// Inserts one row per record into `<table>(moves)`.
///
/// Rows become visible on intermediate commits and on [`RecordSink::finish`];
/// dropping the sink without finishing rolls back the open batch. A failed
/// commit loses the whole batch and says how many rows through [`BatchLost`].
pub struct TableSink<'c> {
    conn: &'c Connection,
    tx: Option<Transaction<'c>>,
    insert_sql: String,
    pending: usize,
}

impl<'c> TableSink<'c> {
    pub fn new(conn: &'c Connection, table: &str) -> Result<Self> {
        init_schema(conn, table)?;
        Ok(Self {
            conn,
            tx: Some(conn.unchecked_transaction()?),
            insert_sql: format!("INSERT INTO {table} (moves) VALUES (?1)"),
            pending: 0,
        })
    }

    /// Commit the open batch. `in_flight` is 1 when the commit runs inside
    /// the `write_record` call whose row is not yet acknowledged.
    fn commit(&mut self, in_flight: usize) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        // A failed COMMIT drops `tx`, which rolls the whole batch back.
        if let Err(e) = tx.commit() {
            let acknowledged = pending.saturating_sub(in_flight);
            warn!("Commit failed, {} rows rolled back: {}", pending, e);
            return Err(anyhow::Error::new(e).context(BatchLost { acknowledged }));
        }
        debug!("Committed {} rows", pending);
        Ok(())
    }
}

impl RecordSink for TableSink<'_> {
    fn write_record(&mut self, record: &NormalizedGameRecord) -> Result<()> {
        if self.tx.is_none() {
            self.tx = Some(self.conn.unchecked_transaction()?);
        }
        if let Some(tx) = &self.tx {
            tx.prepare_cached(&self.insert_sql)?
                .execute(rusqlite::params![record.as_str()])?;
        }
        self.pending += 1;
        if self.pending >= COMMIT_EVERY {
            self.commit(1)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.commit(0)
    }
}

// ── Bulk load ──

pub struct LoadStats {
    pub rows: usize,
    pub loaded: usize,
    pub errors: usize,
}

impl LoadStats {
    /// Move rows rolled back by a failed commit from loaded to errors.
    fn discard(&mut self, lost: usize) {
        let lost = lost.min(self.loaded);
        self.loaded -= lost;
        self.errors += lost;
    }
}

/// Load the first column of every CSV row into the table.
///
/// Invalid UTF-8 in a field is dropped byte-wise rather than failing the row.
pub fn load_csv<R: Read>(
    conn: &Connection,
    table: &str,
    input: R,
    has_header: bool,
    policy: WritePolicy,
) -> Result<LoadStats> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_reader(input);
    let mut sink = TableSink::new(conn, table)?;
    let mut stats = LoadStats {
        rows: 0,
        loaded: 0,
        errors: 0,
    };

    for (i, row) in reader.byte_records().enumerate() {
        let row = row.with_context(|| format!("Malformed CSV row {}", i + 1))?;
        let Some(moves) = row.get(0).map(decode_lossy).filter(|m| !m.is_empty()) else {
            continue;
        };
        stats.rows += 1;
        let record = NormalizedGameRecord::from(moves.as_str());
        if let Err(e) = sink.write_record(&record) {
            stats.discard(lost_records(&e));
            if policy == WritePolicy::FailFast {
                return Err(e.context(format!("Failed to insert CSV row {}", i + 1)));
            }
            warn!("Skipping CSV row {}: {:#}", i + 1, e);
            stats.errors += 1;
        } else {
            stats.loaded += 1;
        }
    }

    if let Err(e) = sink.finish() {
        let lost = lost_records(&e);
        if policy == WritePolicy::FailFast || lost == 0 {
            return Err(e);
        }
        warn!("Final commit failed: {:#}", e);
        stats.discard(lost);
    }
    Ok(stats)
}

// ── Stats ──

pub fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    validate_table(table)?;
    let n: usize = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
    Ok(n)
}

pub fn fetch_head(conn: &Connection, table: &str, limit: usize) -> Result<Vec<(i64, String)>> {
    validate_table(table)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT id, moves FROM {table} ORDER BY id LIMIT {limit}"
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Tests ──
