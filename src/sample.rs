use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_LIMIT: usize = 30_000;

pub struct SampleStats {
    pub header: bool,
    pub rows: usize,
}

/// Copy the header (when declared) and at most `limit` data rows.
/// Short inputs simply end the copy early.
pub fn copy_head<R: Read, W: Write>(
    input: R,
    output: W,
    limit: usize,
    has_header: bool,
) -> Result<SampleStats> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(output);

    let mut records = reader.byte_records();
    let mut stats = SampleStats {
        header: false,
        rows: 0,
    };

    if has_header {
        if let Some(header) = records.next() {
            writer.write_byte_record(&header.context("Malformed CSV header")?)?;
            stats.header = true;
        }
    }

    for record in records.take(limit) {
        let record = record.with_context(|| format!("Malformed CSV row {}", stats.rows + 1))?;
        writer.write_byte_record(&record)?;
        stats.rows += 1;
    }

    writer.flush()?;
    Ok(stats)
}

pub fn sample_file(input: &Path, output: &Path, limit: usize, has_header: bool) -> Result<SampleStats> {
    let infile =
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let outfile =
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    copy_head(infile, outfile, limit, has_header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fifty(header: bool) -> String {
        let mut s = String::new();
        if header {
            s.push_str("moves\n");
        }
        for i in 0..50 {
            s.push_str(&format!("1. e4 e{}\n", i));
        }
        s
    }

    fn run(input: &str, limit: usize, header: bool) -> (String, SampleStats) {
        let mut out = Vec::new();
        let stats = copy_head(Cursor::new(input), &mut out, limit, header).unwrap();
        (String::from_utf8(out).unwrap(), stats)
    }

    #[test]
    fn limit_larger_than_input_copies_everything() {
        let input = fifty(true);
        let (out, stats) = run(&input, 100_000, true);
        assert_eq!(out, input);
        assert_eq!(stats.rows, 50);
        assert!(stats.header);
    }

    #[test]
    fn small_limit_keeps_first_rows_and_header() {
        let (out, stats) = run(&fifty(true), 2, true);
        assert_eq!(out, "moves\n1. e4 e0\n1. e4 e1\n");
        assert_eq!(stats.rows, 2);
    }

    #[test]
    fn headerless_input() {
        let (out, stats) = run(&fifty(false), 2, false);
        assert_eq!(out, "1. e4 e0\n1. e4 e1\n");
        assert!(!stats.header);
    }

    #[test]
    fn empty_input() {
        let (out, stats) = run("", 10, true);
        assert!(out.is_empty());
        assert!(!stats.header);
        assert_eq!(stats.rows, 0);
    }

    #[test]
    fn quoted_fields_survive() {
        let input = "moves\n\"1. e4 {a, b} e5\"\n";
        let (out, _) = run(input, 5, true);
        assert_eq!(out, input);
    }

    #[test]
    fn sample_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("all.csv");
        let dst = dir.path().join("head.csv");
        std::fs::write(&src, fifty(true)).unwrap();
        let stats = sample_file(&src, &dst, 3, true).unwrap();
        assert_eq!(stats.rows, 3);
        assert_eq!(std::fs::read_to_string(&dst).unwrap().lines().count(), 4);
    }

    #[test]
    fn invalid_utf8_rows_are_copied_verbatim() {
        let input: &[u8] = b"moves\n1. e4 \xff e5\n1. d4\n";
        let mut out = Vec::new();
        let stats = copy_head(input, &mut out, 1, true).unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(out, b"moves\n1. e4 \xff e5\n");
    }
}
