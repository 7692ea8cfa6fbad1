//! Input array ingest for the CLI.
//!
//! Two formats, distinguished by extension: `.psllh` holds ASCII doubles,
//! one per line; `.binpsllh` is a raw little-endian f64 stream.

use crate::error::{CanopyError, Result};
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Read an ASCII `.psllh` file: one double per line, blank lines ignored.
pub fn read_psllh(path: &Path) -> Result<Vec<f64>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut values = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = trimmed
            .parse::<f64>()
            .map_err(|e| CanopyError::Parse {
                path: path.display().to_string(),
                line: line_no + 1,
                reason: e.to_string(),
            })?;
        values.push(value);
    }
    Ok(values)
}

/// Read a binary `.binpsllh` file: densely packed little-endian f64.
pub fn read_binpsllh(path: &Path) -> Result<Vec<f64>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(CanopyError::DecodeFailed(format!(
            "{}: length {} is not a multiple of 8",
            path.display(),
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("chunk length fixed")))
        .collect())
}
