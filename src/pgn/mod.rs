pub mod extract;
pub mod segmenter;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};

use extract::extract_records;
pub use extract::NormalizedGameRecord;

/// Two-pass pipeline over one corpus file: lines → game blocks → records.
pub fn open_records(
    path: &Path,
) -> Result<impl Iterator<Item = std::io::Result<NormalizedGameRecord>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(extract_records(BufReader::new(file)))
}
