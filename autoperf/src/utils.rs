//! Utility Functions Module
//!
//! Helpers shared by the runner and the campaign: stable identifiers, local
//! artifact discovery and the CSV sanity check used after every download.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use autoperf_common::constants::ARTIFACT_EXTENSION;

/// Hex digits kept from the blake3 digest.
const ID_HEX_LEN: usize = 32;

/// Hashes `parts` into a short hex identifier that is identical across
/// processes and platforms.
///
/// Each part is length-prefixed so that `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn stable_hash(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let hex = hasher.finalize().to_hex();
    hex[..ID_HEX_LEN].to_string()
}

/// Expands a leading `~` to `$HOME`.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

fn is_artifact(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(ARTIFACT_EXTENSION))
}

/// CSV files directly inside `dir`, sorted by name. A missing directory has
/// none.
pub fn list_csv_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if is_artifact(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Deletes the CSV files directly inside `dir`, returning how many went.
pub fn remove_csv_files(dir: &Path) -> io::Result<usize> {
    let files = list_csv_files(dir)?;
    for file in &files {
        fs::remove_file(file)?;
    }
    Ok(files.len())
}

/// Reads up to `max_rows` data records from a CSV and returns how many parsed.
///
/// The first line is the header. A file with no data record after it, or one
/// that fails to parse within the first `max_rows` records, is rejected.
pub fn verify_csv(path: &Path, max_rows: usize) -> Result<usize, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("cannot open {}: {e}", path.display()))?;

    let mut rows = 0;
    for record in reader.records().take(max_rows) {
        record.map_err(|e| format!("cannot parse {}: {e}", path.display()))?;
        rows += 1;
    }

    if rows == 0 {
        return Err(format!("{} is empty: no data rows", path.display()));
    }
    Ok(rows)
}
