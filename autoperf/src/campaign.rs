//! Campaign Module
//!
//! A campaign owns one named sweep: the experiments generated from its QoS
//! axes, the attempt records replayed from and appended to its status store,
//! and the policies that decide what to run next.
//!
//! ## Generation
//!
//! - explicit `experiment_names` win over generation
//! - `pcg`: the full cross product, last axis varying fastest
//! - `rcg`: independent per-axis draws until enough distinct names exist;
//!   names already present in the store are adopted first so that a resumed
//!   campaign keeps its earlier picks
//!
//! ## Policy
//!
//! An experiment with a zero-error attempt is never run again, and one with
//! `max_retries` recorded attempts is left as permanently failed. Before each
//! new experiment the circuit breaker looks at the last `max_failures`
//! distinct experiments; if every one of them only ever failed, the campaign
//! halts.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    path::PathBuf,
};

use autoperf_common::Qos;
use log::{debug, info, warn};
use rand::{distr::uniform::SampleUniform, seq::IndexedRandom, Rng};

use crate::{
    config::{CampaignConfig, GenType, QosSettings, RunnerSettings},
    ess::StatusStore,
    experiment::{Experiment, ExperimentId},
    machine::Machine,
    types::{AttemptRecord, AutoperfError, AutoperfResult},
};

/// What to do with an experiment given the recorded attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Run { attempt: u32 },
    SkipSucceeded,
    SkipExhausted,
}

/// Counts reported at the end of a campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignSummary {
    pub experiments: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    pub attempts: usize,
    /// Attempts made by this process, as opposed to replayed ones.
    pub new_attempts: usize,
    pub halted: bool,
}

impl fmt::Display for CampaignSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} experiments succeeded, {} exhausted, {} attempts ({} new){}",
            self.succeeded,
            self.experiments,
            self.exhausted,
            self.attempts,
            self.new_attempts,
            if self.halted { ", halted by circuit breaker" } else { "" }
        )
    }
}

/// Every combination of the axes, in axis order with the last axis fastest.
#[must_use]
pub fn pcg_combinations(s: &QosSettings) -> Vec<Qos> {
    let lens = [
        s.duration_secs.len(),
        s.datalen_bytes.len(),
        s.pub_count.len(),
        s.sub_count.len(),
        s.use_reliable.len(),
        s.use_multicast.len(),
        s.durability.len(),
        s.latency_count.len(),
    ];
    if lens.contains(&0) {
        return Vec::new();
    }
    let total: usize = lens.iter().product();

    let mut out = Vec::with_capacity(total);
    for k in 0..total {
        let mut rem = k;
        let mut idx = [0usize; 8];
        for axis in (0..lens.len()).rev() {
            idx[axis] = rem % lens[axis];
            rem /= lens[axis];
        }
        out.push(Qos {
            duration_secs: s.duration_secs[idx[0]],
            datalen_bytes: s.datalen_bytes[idx[1]],
            pub_count: s.pub_count[idx[2]],
            sub_count: s.sub_count[idx[3]],
            use_reliable: s.use_reliable[idx[4]],
            use_multicast: s.use_multicast[idx[5]],
            durability: s.durability[idx[6]],
            latency_count: s.latency_count[idx[7]],
        });
    }
    out
}

/// Draws from a numeric axis: a two-value axis is an inclusive range.
fn sample_numeric<T, R>(values: &[T], rng: &mut R) -> Option<T>
where
    T: Copy + PartialOrd + SampleUniform,
    R: Rng + ?Sized,
{
    match values {
        [a, b] => {
            let (lo, hi) = if a <= b { (*a, *b) } else { (*b, *a) };
            Some(rng.random_range(lo..=hi))
        }
        _ => values.choose(rng).copied(),
    }
}

/// One random QoS drawn axis by axis. `None` only for an empty axis.
pub fn sample_qos<R: Rng + ?Sized>(s: &QosSettings, rng: &mut R) -> Option<Qos> {
    Some(Qos {
        duration_secs: sample_numeric(&s.duration_secs, rng)?,
        datalen_bytes: sample_numeric(&s.datalen_bytes, rng)?,
        pub_count: sample_numeric(&s.pub_count, rng)?,
        sub_count: sample_numeric(&s.sub_count, rng)?,
        use_reliable: *s.use_reliable.choose(rng)?,
        use_multicast: *s.use_multicast.choose(rng)?,
        durability: sample_numeric(&s.durability, rng)?,
        latency_count: sample_numeric(&s.latency_count, rng)?,
    })
}

#[derive(Debug)]
pub struct Campaign {
    config: CampaignConfig,
    machines: Vec<Machine>,
    experiments: Vec<Experiment>,
    results: Vec<AttemptRecord>,
    store: StatusStore,
}

impl Campaign {
    #[must_use]
    pub fn new(config: CampaignConfig) -> Self {
        let machines = config
            .slave_machines
            .iter()
            .map(|m| m.to_machine())
            .collect();
        let store = StatusStore::in_dir(&config.campaign_dir());
        Self {
            config,
            machines,
            experiments: Vec::new(),
            results: Vec::new(),
            store,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.campaign_name
    }

    #[must_use]
    pub const fn config(&self) -> &CampaignConfig {
        &self.config
    }

    #[must_use]
    pub const fn runner_settings(&self) -> &RunnerSettings {
        &self.config.runner
    }

    #[must_use]
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    #[must_use]
    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    #[must_use]
    pub fn results(&self) -> &[AttemptRecord] {
        &self.results
    }

    #[must_use]
    pub const fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Where experiment output directories are created.
    #[must_use]
    pub fn data_root(&self) -> PathBuf {
        self.config.campaign_dir().join("data")
    }

    /// Replaces `results` with what the status store holds.
    pub fn load_results(&mut self) -> AutoperfResult<usize> {
        self.results = self.store.load()?;
        self.resolve_result_ids();
        if !self.results.is_empty() {
            info!(
                "[{}] resumed {} recorded attempt(s) from {}",
                self.name(),
                self.results.len(),
                self.store.path().display()
            );
        }
        Ok(self.results.len())
    }

    /// Builds the experiment list on first call; later calls return it as is.
    pub fn generate_experiments<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> AutoperfResult<&[Experiment]> {
        if !self.experiments.is_empty() {
            return Ok(&self.experiments);
        }

        let qos_list = if self.config.experiment_names.is_empty() {
            match self.config.gen_type {
                GenType::Pcg => pcg_combinations(&self.config.qos_settings),
                GenType::Rcg => self.rcg_combinations(rng)?,
            }
        } else {
            self.named_combinations()?
        };

        let data_root = self.data_root();
        self.experiments = qos_list
            .into_iter()
            .enumerate()
            .map(|(index, qos)| {
                Experiment::new(
                    index,
                    qos,
                    self.machines.clone(),
                    self.config.bw_rate.clone(),
                    &data_root,
                )
            })
            .collect();
        self.resolve_result_ids();

        info!(
            "[{}] {} experiment(s) generated ({:?})",
            self.name(),
            self.experiments.len(),
            self.config.gen_type
        );
        Ok(&self.experiments)
    }

    fn named_combinations(&self) -> AutoperfResult<Vec<Qos>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in &self.config.experiment_names {
            let qos: Qos = name.parse()?;
            if seen.insert(qos) {
                out.push(qos);
            } else {
                warn!("[{}] experiment {name} listed twice", self.name());
            }
        }
        Ok(out)
    }

    fn rcg_combinations<R: Rng + ?Sized>(&self, rng: &mut R) -> AutoperfResult<Vec<Qos>> {
        let settings = &self.config.qos_settings;
        let total = self.config.total_experiments.ok_or_else(|| {
            AutoperfError::Configuration(format!("{}: rcg needs total_experiments", self.name()))
        })?;
        if total as u128 > settings.sample_space_size() {
            return Err(AutoperfError::Configuration(format!(
                "{}: total_experiments={total} exceeds the sampling space",
                self.name()
            )));
        }

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(total);

        for record in &self.results {
            if out.len() == total {
                break;
            }
            match record.experiment_name.parse::<Qos>() {
                Ok(qos) if seen.insert(qos) => out.push(qos),
                Ok(_) => {}
                Err(e) => warn!("[{}] ignoring stored name: {e}", self.name()),
            }
        }
        if !out.is_empty() {
            debug!("[{}] adopted {} earlier pick(s)", self.name(), out.len());
        }

        while out.len() < total {
            let qos = sample_qos(settings, rng).ok_or_else(|| {
                AutoperfError::Configuration(format!("{}: empty QoS axis", self.name()))
            })?;
            if seen.insert(qos) {
                out.push(qos);
            }
        }
        Ok(out)
    }

    /// Attaches experiment ids to results by experiment name.
    pub fn resolve_result_ids(&mut self) {
        let ids: HashMap<&str, &ExperimentId> = self
            .experiments
            .iter()
            .map(|e| (e.name(), e.id()))
            .collect();
        for record in &mut self.results {
            record.experiment_id = ids.get(record.experiment_name.as_str()).map(|&id| id.clone());
        }
    }

    fn attempts_of<'a>(&'a self, id: &'a ExperimentId) -> impl Iterator<Item = &'a AttemptRecord> {
        self.results
            .iter()
            .filter(move |r| r.experiment_id.as_ref() == Some(id))
    }

    #[must_use]
    pub fn attempt_count(&self, id: &ExperimentId) -> u32 {
        self.attempts_of(id).count() as u32
    }

    #[must_use]
    pub fn has_succeeded(&self, id: &ExperimentId) -> bool {
        self.attempts_of(id).any(AttemptRecord::succeeded)
    }

    /// Retry/skip decision for `experiment`.
    #[must_use]
    pub fn next_action(&self, experiment: &Experiment) -> NextAction {
        if self.has_succeeded(experiment.id()) {
            return NextAction::SkipSucceeded;
        }
        let attempts = self.attempt_count(experiment.id());
        if attempts >= self.config.max_retries {
            NextAction::SkipExhausted
        } else {
            NextAction::Run {
                attempt: attempts + 1,
            }
        }
    }

    /// Circuit breaker: whether the last `max_failures` distinct experiments
    /// all failed every attempt they had.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        let window = self.config.max_failures as usize;
        if window == 0 {
            return false;
        }

        let mut recent: Vec<&str> = Vec::with_capacity(window);
        for record in self.results.iter().rev() {
            let name = record.experiment_name.as_str();
            if !recent.contains(&name) {
                recent.push(name);
                if recent.len() == window {
                    break;
                }
            }
        }
        if recent.len() < window {
            return false;
        }

        recent.iter().all(|&name| {
            self.results
                .iter()
                .filter(|r| r.experiment_name == name)
                .all(|r| !r.succeeded())
        })
    }

    /// Persists `record` and then adds it to `results`.
    pub fn record(&mut self, mut record: AttemptRecord) -> AutoperfResult<()> {
        self.store.append(&record)?;
        if record.experiment_id.is_none() {
            record.experiment_id = self
                .experiments
                .iter()
                .find(|e| e.name() == record.experiment_name)
                .map(|e| e.id().clone());
        }
        self.results.push(record);
        Ok(())
    }

    /// Error records per machine IP across every attempt.
    #[must_use]
    pub fn failure_ip_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for err in self.results.iter().flat_map(|r| &r.errors) {
            if let Some(ip) = &err.ip {
                *counts.entry(ip.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    #[must_use]
    pub fn summary(&self) -> CampaignSummary {
        let mut summary = CampaignSummary {
            experiments: self.experiments.len(),
            attempts: self.results.len(),
            ..CampaignSummary::default()
        };
        for exp in &self.experiments {
            match self.next_action(exp) {
                NextAction::SkipSucceeded => summary.succeeded += 1,
                NextAction::SkipExhausted => summary.exhausted += 1,
                NextAction::Run { .. } => {}
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        config::tests::campaign_config,
        types::{ErrorRecord, Stage},
    };

    fn campaign(dir: &std::path::Path) -> Campaign {
        let mut cfg = campaign_config();
        cfg.output_dir = dir.to_path_buf();
        Campaign::new(cfg)
    }

    fn attempt(name: &str, attempt: u32, ok: bool) -> AttemptRecord {
        let now = Utc::now();
        AttemptRecord {
            experiment_id: None,
            experiment_name: name.to_string(),
            attempt,
            machines: vec!["pi-1".to_string()],
            errors: if ok {
                Vec::new()
            } else {
                vec![ErrorRecord::new(Stage::Ping, "unreachable").on_host("pi-1", "10.0.0.1")]
            },
            start_time: now,
            end_time: now,
        }
    }

    #[test]
    fn test_pcg_is_deterministic_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = campaign(dir.path());
        let mut b = campaign(dir.path());
        let mut rng = StdRng::seed_from_u64(1);

        let names_a: Vec<_> = a
            .generate_experiments(&mut rng)
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        let names_b: Vec<_> = b
            .generate_experiments(&mut StdRng::seed_from_u64(99))
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();

        assert_eq!(names_a, names_b);
        assert_eq!(names_a.len(), 8);
        assert_eq!(names_a[0], "30SEC_100B_1P_1S_REL_UC_0DUR_100LC");
        assert_eq!(names_a[1], "30SEC_100B_1P_1S_BE_UC_0DUR_100LC");
        assert_eq!(names_a[2], "30SEC_100B_1P_2S_REL_UC_0DUR_100LC");
        assert_eq!(names_a[7], "30SEC_1000B_1P_2S_BE_UC_0DUR_100LC");

        let ids: HashSet<_> = a.experiments().iter().map(|e| e.id().clone()).collect();
        assert_eq!(ids.len(), 8);
        for (i, e) in a.experiments().iter().enumerate() {
            assert_eq!(e.index(), i);
            assert_eq!(e.id(), b.experiments()[i].id());
            assert_eq!(e.machines.len(), 2);
        }
    }

    #[test]
    fn test_generate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = campaign(dir.path());
        let mut rng = StdRng::seed_from_u64(1);
        let first: Vec<_> = c
            .generate_experiments(&mut rng)
            .unwrap()
            .iter()
            .map(|e| e.id().clone())
            .collect();
        let second: Vec<_> = c
            .generate_experiments(&mut rng)
            .unwrap()
            .iter()
            .map(|e| e.id().clone())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rcg_uniqueness_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = campaign_config();
        cfg.output_dir = dir.path().to_path_buf();
        cfg.gen_type = GenType::Rcg;
        cfg.total_experiments = Some(25);
        cfg.qos_settings.duration_secs = vec![10, 20];
        let mut c = Campaign::new(cfg.clone());

        let exps = c
            .generate_experiments(&mut StdRng::seed_from_u64(7))
            .unwrap();
        assert_eq!(exps.len(), 25);
        let names: HashSet<_> = exps.iter().map(|e| e.name()).collect();
        assert_eq!(names.len(), 25);
        for e in exps {
            assert!((10..=20).contains(&e.qos.duration_secs));
            assert!((100..=1000).contains(&e.qos.datalen_bytes));
            assert!([1, 2].contains(&e.qos.sub_count));
        }

        // the whole space is reachable when asked for
        cfg.qos_settings = crate::config::tests::qos_settings();
        cfg.qos_settings.datalen_bytes = vec![100, 200, 300];
        cfg.total_experiments = Some(12);
        let mut full = Campaign::new(cfg);
        assert_eq!(
            full.generate_experiments(&mut StdRng::seed_from_u64(3))
                .unwrap()
                .len(),
            12
        );
    }

    #[test]
    fn test_rcg_resumption_keeps_earlier_picks() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = campaign_config();
        cfg.output_dir = dir.path().to_path_buf();
        cfg.gen_type = GenType::Rcg;
        cfg.total_experiments = Some(4);

        let mut first = Campaign::new(cfg.clone());
        first.load_results().unwrap();
        let picked: Vec<_> = first
            .generate_experiments(&mut StdRng::seed_from_u64(11))
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        for name in &picked[..2] {
            first.record(attempt(name, 1, false)).unwrap();
        }

        let mut resumed = Campaign::new(cfg);
        resumed.load_results().unwrap();
        let again: Vec<_> = resumed
            .generate_experiments(&mut StdRng::seed_from_u64(12345))
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(again.len(), 4);
        assert_eq!(again[..2], picked[..2]);
        assert_eq!(resumed.attempt_count(resumed.experiments()[0].id()), 1);
    }

    #[test]
    fn test_resumption_skips_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = campaign(dir.path());
        c.generate_experiments(&mut StdRng::seed_from_u64(1)).unwrap();
        let done = c.experiments()[0].name().to_string();
        c.record(attempt(&done, 1, false)).unwrap();
        c.record(attempt(&done, 2, true)).unwrap();

        let mut resumed = campaign(dir.path());
        assert_eq!(resumed.load_results().unwrap(), 2);
        resumed
            .generate_experiments(&mut StdRng::seed_from_u64(1))
            .unwrap();
        let first = &resumed.experiments()[0];
        let second = &resumed.experiments()[1];
        assert_eq!(resumed.next_action(first), NextAction::SkipSucceeded);
        assert_eq!(resumed.next_action(second), NextAction::Run { attempt: 1 });
        assert_eq!(resumed.attempt_count(first.id()), 2);
        assert!(resumed.results().iter().all(|r| r.experiment_id.is_some()));
    }

    #[test]
    fn test_retry_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = campaign(dir.path());
        c.generate_experiments(&mut StdRng::seed_from_u64(1)).unwrap();
        let exp = c.experiments()[0].clone();

        assert_eq!(c.next_action(&exp), NextAction::Run { attempt: 1 });
        c.record(attempt(exp.name(), 1, false)).unwrap();
        assert_eq!(c.next_action(&exp), NextAction::Run { attempt: 2 });
        c.record(attempt(exp.name(), 2, false)).unwrap();
        // max_retries = 2
        assert_eq!(c.next_action(&exp), NextAction::SkipExhausted);

        let summary = c.summary();
        assert_eq!(summary.exhausted, 1);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.attempts, 2);
    }

    #[test]
    fn test_circuit_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = campaign(dir.path());
        c.generate_experiments(&mut StdRng::seed_from_u64(1)).unwrap();
        let names: Vec<_> = c.experiments().iter().map(|e| e.name().to_string()).collect();

        // max_failures = 3
        c.record(attempt(&names[0], 1, false)).unwrap();
        c.record(attempt(&names[1], 1, false)).unwrap();
        c.record(attempt(&names[1], 2, false)).unwrap();
        assert!(!c.should_abort());

        c.record(attempt(&names[2], 1, false)).unwrap();
        assert!(c.should_abort());

        // one success in the window keeps the campaign going
        c.record(attempt(&names[2], 2, true)).unwrap();
        assert!(!c.should_abort());

        let mut disabled = campaign(dir.path());
        disabled.config.max_failures = 0;
        disabled.load_results().unwrap();
        assert!(!disabled.should_abort());
    }

    #[test]
    fn test_failure_ip_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = campaign(dir.path());
        c.record(attempt("A", 1, false)).unwrap();
        c.record(attempt("A", 2, false)).unwrap();
        c.record(attempt("B", 1, true)).unwrap();
        let counts = c.failure_ip_counts();
        assert_eq!(counts.get("10.0.0.1"), Some(&2));
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_explicit_names_win() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = campaign_config();
        cfg.output_dir = dir.path().to_path_buf();
        cfg.experiment_names = vec![
            "60SEC_64B_2P_3S_BE_MC_1DUR_50LC".to_string(),
            "60SEC_64B_2P_3S_BE_MC_1DUR_50LC".to_string(),
            "5SEC_1B_1P_1S_REL_UC_0DUR_10LC".to_string(),
        ];
        let mut c = Campaign::new(cfg);
        let exps = c.generate_experiments(&mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(exps.len(), 2);
        assert!(exps[0].qos.use_multicast);
        assert_eq!(exps[1].name(), "5SEC_1B_1P_1S_REL_UC_0DUR_10LC");
    }
}
