use std::fmt;
use std::io::{self, BufRead};

use super::segmenter::{Games, RawGameBlock};

/// One game's movetext flattened to a single line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedGameRecord(String);

impl NormalizedGameRecord {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedGameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wraps text that is already a flattened record, e.g. a row read back from CSV.
impl From<&str> for NormalizedGameRecord {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NormalizedGameRecord {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Join a block's lines with single spaces. Tokens are kept verbatim.
pub fn normalize(block: &RawGameBlock) -> NormalizedGameRecord {
    NormalizedGameRecord(block.lines().join(" "))
}

/// Segment and normalize a whole stream, yielding records in file order.
pub fn extract_records<R: BufRead>(
    reader: R,
) -> impl Iterator<Item = io::Result<NormalizedGameRecord>> {
    Games::new(reader).map(|block| block.map(|b| normalize(&b)))
}
