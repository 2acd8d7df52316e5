//! Experiment Status Store
//!
//! An append-only log of attempt records, stored as gzip-compressed
//! newline-delimited JSON. Each append rewrites the whole file through a
//! sibling temporary file and a rename, so a crash leaves either the old log
//! or the new one. There is a single writer and no locking.

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::debug;

use crate::types::{AttemptRecord, AutoperfError, AutoperfResult};

/// File name of the store inside a campaign directory.
pub const ESS_FILE_NAME: &str = "ess.jsonl.gz";

#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The store kept in `campaign_dir`.
    pub fn in_dir(campaign_dir: &Path) -> Self {
        Self::new(campaign_dir.join(ESS_FILE_NAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn store_error(&self, what: &str, e: impl std::fmt::Display) -> AutoperfError {
        AutoperfError::Store(format!("{what} {}: {e}", self.path.display()))
    }

    /// Raw JSON rows, oldest first. A missing file is an empty store.
    fn read_rows(&self) -> AutoperfResult<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.store_error("cannot open", e)),
        };

        let mut rows = Vec::new();
        for line in BufReader::new(GzDecoder::new(file)).lines() {
            let line = line.map_err(|e| self.store_error("cannot read", e))?;
            if !line.trim().is_empty() {
                rows.push(line);
            }
        }
        Ok(rows)
    }

    /// Replays every stored attempt in the order it was written.
    pub fn load(&self) -> AutoperfResult<Vec<AttemptRecord>> {
        let rows = self.read_rows()?;
        let records = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                serde_json::from_str(row)
                    .map_err(|e| self.store_error(&format!("bad row {} in", i + 1), e))
            })
            .collect::<AutoperfResult<Vec<AttemptRecord>>>()?;
        debug!("loaded {} record(s) from {}", records.len(), self.path.display());
        Ok(records)
    }

    /// Appends one record and makes it durable before returning.
    pub fn append(&self, record: &AttemptRecord) -> AutoperfResult<()> {
        let mut rows = self.read_rows()?;
        rows.push(serde_json::to_string(record)?);

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.tmp_path();
        let writer = BufWriter::new(File::create(&tmp)?);
        let mut encoder = GzEncoder::new(writer, Compression::default());
        for row in &rows {
            encoder.write_all(row.as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        let file = encoder
            .finish()?
            .into_inner()
            .map_err(|e| self.store_error("cannot flush", e.error()))?;
        file.sync_all()?;

        fs::rename(&tmp, &self.path).map_err(|e| self.store_error("cannot replace", e))?;
        debug!("{} now holds {} record(s)", self.path.display(), rows.len());
        Ok(())
    }
}
