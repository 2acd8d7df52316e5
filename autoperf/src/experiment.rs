//! A single QoS configuration bound to the campaign's machines

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use autoperf_common::Qos;
use serde::{Deserialize, Serialize};

use crate::{machine::Machine, utils::stable_hash};

/// Identity of an experiment that survives process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    #[must_use]
    pub fn new(index: usize, name: &str) -> Self {
        Self(stable_hash(&[index.to_string().as_bytes(), name.as_bytes()]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    index: usize,
    name: String,
    id: ExperimentId,
    pub qos: Qos,
    pub machines: Vec<Machine>,
    /// Bandwidth cap label applied to the fleet for this sweep, if any.
    pub bw_rate: Option<String>,
    data_root: PathBuf,
}

impl Experiment {
    pub fn new(
        index: usize,
        qos: Qos,
        machines: Vec<Machine>,
        bw_rate: Option<String>,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        let name: String = qos.name().split_whitespace().collect();
        let id = ExperimentId::new(index, &name);
        Self {
            index,
            name,
            id,
            qos,
            machines,
            bw_rate,
            data_root: data_root.into(),
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn id(&self) -> &ExperimentId {
        &self.id
    }

    /// Where this experiment's CSVs are collected; not created.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.data_root.join(&self.name)
    }

    /// Creates the output directory on first use.
    pub fn output_dirpath(&self) -> io::Result<PathBuf> {
        let path = self.output_path();
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Budget for the whole remote run: test duration plus `buffer`.
    #[must_use]
    pub fn timeout(&self, buffer: Duration) -> Duration {
        Duration::from_secs(self.qos.duration_secs) + buffer
    }

    #[must_use]
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}
