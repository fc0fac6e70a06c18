use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::pgn::NormalizedGameRecord;

/// Header of the single column written by [`CsvSink`].
pub const CSV_HEADER: &str = "moves";

/// Sequential append-only destination for game records.
///
/// A sink that batches rows reports a failed flush of the batch through a
/// [`BatchLost`] context on the returned error, so callers can stop counting
/// the rolled-back records as written.
pub trait RecordSink {
    /// Append one record as one row.
    fn write_record(&mut self, record: &NormalizedGameRecord) -> Result<()>;

    /// Make every written record durable.
    fn finish(&mut self) -> Result<()>;
}

/// Earlier records, already acknowledged by `write_record`, that a failed
/// commit rolled back. The record of the failing call itself is not included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLost {
    pub acknowledged: usize,
}

impl fmt::Display for BatchLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit failed, {} acknowledged records rolled back", self.acknowledged)
    }
}

/// Number of acknowledged records `err` reports as rolled back.
pub fn lost_records(err: &anyhow::Error) -> usize {
    err.downcast_ref::<BatchLost>().map_or(0, |b| b.acknowledged)
}

/// What to do when a single record cannot be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WritePolicy {
    /// Return the first write error to the caller.
    #[default]
    FailFast,
    /// Log the failure, count it and carry on with the next record.
    SkipAndContinue,
}

impl WritePolicy {
    pub fn from_keep_going(keep_going: bool) -> Self {
        if keep_going {
            Self::SkipAndContinue
        } else {
            Self::FailFast
        }
    }
}

impl RecordSink for Vec<String> {
    fn write_record(&mut self, record: &NormalizedGameRecord) -> Result<()> {
        self.push(record.as_str().to_string());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Delimited text file with one record per row in a single column.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    pub fn create(path: &Path, with_header: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Self::new(file, with_header)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W, with_header: bool) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(inner);
        if with_header {
            writer.write_record([CSV_HEADER])?;
        }
        Ok(Self { writer })
    }

    #[cfg(test)]
    fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush CSV writer: {}", e.error()))
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn write_record(&mut self, record: &NormalizedGameRecord) -> Result<()> {
        self.writer.write_record([record.as_str()])?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush CSV output")?;
        Ok(())
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgn::extract::extract_records;
    use std::io::Cursor;

    fn recs(text: &str) -> Vec<NormalizedGameRecord> {
        extract_records(Cursor::new(text.as_bytes()))
            .collect::<std::io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn csv_one_row_per_record_with_header() {
        let mut sink = CsvSink::new(Vec::new(), true).unwrap();
        for r in recs("1. e4 e5\n2. Nf3 Nc6\n1. d4 d5\n") {
            sink.write_record(&r).unwrap();
        }
        sink.finish().unwrap();
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out, "moves\n1. e4 e5 2. Nf3 Nc6\n1. d4 d5\n");
    }

    #[test]
    fn csv_without_header_quotes_when_needed() {
        let mut sink = CsvSink::new(Vec::new(), false).unwrap();
        for r in recs("1. e4 {Kasparov, \"best\"} e5\n") {
            sink.write_record(&r).unwrap();
        }
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out, "\"1. e4 {Kasparov, \"\"best\"\"} e5\"\n");
    }

    #[test]
    fn csv_create_makes_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/nested/games.csv");
        let mut sink = CsvSink::create(&path, true).unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "moves\n");
    }

    #[test]
    fn vec_sink_collects() {
        let mut sink: Vec<String> = Vec::new();
        for r in recs("1. e4\n1. d4\n") {
            sink.write_record(&r).unwrap();
        }
        assert_eq!(sink, vec!["1. e4", "1. d4"]);
    }

    #[test]
    fn batch_lost_is_found_through_context() {
        let err = anyhow::anyhow!("FOREIGN KEY constraint failed")
            .context(BatchLost { acknowledged: 7 });
        assert_eq!(lost_records(&err), 7);
        assert_eq!(lost_records(&anyhow::anyhow!("disk full")), 0);
    }

    #[test]
    fn keep_going_maps_to_policy() {
        assert_eq!(WritePolicy::from_keep_going(true), WritePolicy::SkipAndContinue);
        assert_eq!(WritePolicy::from_keep_going(false), WritePolicy::FailFast);
        assert_eq!(WritePolicy::default(), WritePolicy::FailFast);
    }
}
