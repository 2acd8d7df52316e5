//! Campaign configuration files
//!
//! A config file is a JSON array of campaign definitions. Each campaign names
//! the machines to drive and, per QoS axis, the values to sweep over.

use std::{
    collections::HashSet,
    fmt::Display,
    fs,
    hash::Hash,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use autoperf_common::{constants::MAX_DURABILITY, ParticipantType, Qos};
use serde::{Deserialize, Serialize};

use crate::{machine::Machine, utils::expand_tilde};

/// How a campaign turns its QoS axes into experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenType {
    /// Full factorial: every combination of every axis.
    Pcg,
    /// Random sampling of a fixed number of distinct combinations.
    Rcg,
}

/// One entry of `slave_machines`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    pub hostname: String,
    pub participant_type: ParticipantType,
    pub ip: Ipv4Addr,
    pub ssh_key_path: PathBuf,
    pub username: String,
    pub perftest_path: String,
    #[serde(default)]
    pub smart_plug_name: Option<String>,
    #[serde(default)]
    pub smart_plug_ip: Option<Ipv4Addr>,
}

impl MachineConfig {
    #[must_use]
    pub fn to_machine(&self) -> Machine {
        Machine::new(
            self.hostname.clone(),
            self.participant_type,
            self.ip,
            self.ssh_key_path.clone(),
            self.username.clone(),
            self.perftest_path.clone(),
        )
    }
}

/// Values to sweep for each QoS field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QosSettings {
    pub duration_secs: Vec<u64>,
    pub datalen_bytes: Vec<u64>,
    pub pub_count: Vec<u32>,
    pub sub_count: Vec<u32>,
    pub use_reliable: Vec<bool>,
    pub use_multicast: Vec<bool>,
    pub durability: Vec<u8>,
    pub latency_count: Vec<u64>,
}

/// Number of values a numeric axis can produce when sampled: a two-value
/// axis is an inclusive range, anything else is a plain choice.
#[must_use]
pub fn sampled_axis_size(values: &[u64]) -> u128 {
    match values {
        [a, b] => u128::from(a.abs_diff(*b)) + 1,
        _ => values.len() as u128,
    }
}

fn widen<T: Copy + Into<u64>>(values: &[T]) -> Vec<u64> {
    values.iter().map(|&v| v.into()).collect()
}

impl QosSettings {
    /// Size of the full cross product.
    #[must_use]
    pub fn combination_count(&self) -> u128 {
        [
            self.duration_secs.len(),
            self.datalen_bytes.len(),
            self.pub_count.len(),
            self.sub_count.len(),
            self.use_reliable.len(),
            self.use_multicast.len(),
            self.durability.len(),
            self.latency_count.len(),
        ]
        .iter()
        .fold(1u128, |acc, &n| acc.saturating_mul(n as u128))
    }

    /// Number of distinct QoS values random sampling can reach.
    #[must_use]
    pub fn sample_space_size(&self) -> u128 {
        [
            sampled_axis_size(&self.duration_secs),
            sampled_axis_size(&self.datalen_bytes),
            sampled_axis_size(&widen(&self.pub_count)),
            sampled_axis_size(&widen(&self.sub_count)),
            self.use_reliable.len() as u128,
            self.use_multicast.len() as u128,
            sampled_axis_size(&widen(&self.durability)),
            sampled_axis_size(&self.latency_count),
        ]
        .iter()
        .fold(1u128, |acc, &n| acc.saturating_mul(n))
    }

    /// Checks every axis is non-empty, duplicate-free and within range.
    pub fn validate(&self) -> Result<()> {
        check_axis("duration_secs", &self.duration_secs)?;
        check_axis("datalen_bytes", &self.datalen_bytes)?;
        check_axis("pub_count", &self.pub_count)?;
        check_axis("sub_count", &self.sub_count)?;
        check_axis("use_reliable", &self.use_reliable)?;
        check_axis("use_multicast", &self.use_multicast)?;
        check_axis("durability", &self.durability)?;
        check_axis("latency_count", &self.latency_count)?;

        if self.pub_count.contains(&0) {
            anyhow::bail!("qos_settings.pub_count: every run needs at least one publisher");
        }
        if self.sub_count.contains(&0) {
            anyhow::bail!("qos_settings.sub_count: every run needs at least one subscriber");
        }
        if let Some(d) = self.durability.iter().find(|&&d| d > MAX_DURABILITY) {
            anyhow::bail!("qos_settings.durability: {d} is above {MAX_DURABILITY}");
        }
        Ok(())
    }
}

fn check_axis<T: Eq + Hash + Display>(axis: &str, values: &[T]) -> Result<()> {
    if values.is_empty() {
        anyhow::bail!("qos_settings.{axis} must list at least one value");
    }
    let mut seen = HashSet::new();
    for v in values {
        if !seen.insert(v) {
            anyhow::bail!("qos_settings.{axis} lists {v} more than once");
        }
    }
    Ok(())
}

/// Attempt counts and time budgets for experiment attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    pub ping_attempts: u32,
    pub ssh_attempts: u32,
    /// Per-attempt timeout of the first connectivity check.
    pub preflight_timeout_secs: u64,
    /// Per-attempt timeout of the check that follows a restart.
    pub post_restart_timeout_secs: u64,
    /// Pause between the restart and the second check.
    pub post_restart_grace_secs: u64,
    pub restart_timeout_secs: u64,
    /// Bound for short remote commands (cleanup, listing).
    pub command_timeout_secs: u64,
    /// Bound for each file transfer.
    pub transfer_timeout_secs: u64,
    /// Added to the test duration for the first machine's join.
    pub run_timeout_buffer_secs: u64,
    /// Join limit for every machine after the first.
    pub join_buffer_secs: u64,
    /// Rows read from each CSV during verification.
    pub verify_rows: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            ping_attempts: 3,
            ssh_attempts: 3,
            preflight_timeout_secs: 10,
            post_restart_timeout_secs: 20,
            post_restart_grace_secs: 5,
            restart_timeout_secs: 10,
            command_timeout_secs: 30,
            transfer_timeout_secs: 120,
            run_timeout_buffer_secs: 60,
            join_buffer_secs: 60,
            verify_rows: 5,
        }
    }
}

impl RunnerSettings {
    #[must_use]
    pub const fn preflight_timeout(&self) -> Duration {
        Duration::from_secs(self.preflight_timeout_secs)
    }

    #[must_use]
    pub const fn post_restart_timeout(&self) -> Duration {
        Duration::from_secs(self.post_restart_timeout_secs)
    }

    #[must_use]
    pub const fn post_restart_grace(&self) -> Duration {
        Duration::from_secs(self.post_restart_grace_secs)
    }

    #[must_use]
    pub const fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub const fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    #[must_use]
    pub const fn run_timeout_buffer(&self) -> Duration {
        Duration::from_secs(self.run_timeout_buffer_secs)
    }

    #[must_use]
    pub const fn join_buffer(&self) -> Duration {
        Duration::from_secs(self.join_buffer_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_attempts == 0 || self.ssh_attempts == 0 {
            anyhow::bail!("runner: ping_attempts and ssh_attempts must be at least 1");
        }
        if self.verify_rows == 0 {
            anyhow::bail!("runner: verify_rows must be at least 1");
        }
        Ok(())
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// One campaign definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub campaign_name: String,
    pub gen_type: GenType,
    /// Consecutive all-failed experiments that halt the campaign; 0 disables.
    pub max_failures: u32,
    /// Attempts allowed per experiment.
    pub max_retries: u32,
    pub slave_machines: Vec<MachineConfig>,
    pub qos_settings: QosSettings,
    /// Number of distinct experiments to sample (`rcg` only).
    #[serde(default)]
    pub total_experiments: Option<usize>,
    #[serde(default)]
    pub bw_rate: Option<String>,
    /// Explicit QoS names to run instead of generating them.
    #[serde(default)]
    pub experiment_names: Vec<String>,
    /// Skip the reboot and the checks that follow it.
    #[serde(default)]
    pub skip_restart: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub runner: RunnerSettings,
}

impl CampaignConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let name = &self.campaign_name;
        if name.trim().is_empty() {
            anyhow::bail!("campaign_name must not be empty");
        }
        if name.contains(['/', '\\']) {
            anyhow::bail!("campaign_name {name:?} must not contain path separators");
        }
        if self.max_retries < 1 {
            anyhow::bail!("{name}: max_retries must be at least 1");
        }

        self.validate_machines()
            .with_context(|| format!("{name}: invalid slave_machines"))?;
        self.qos_settings
            .validate()
            .with_context(|| format!("{name}: invalid qos_settings"))?;
        self.runner.validate().with_context(|| name.clone())?;

        for qos_name in &self.experiment_names {
            qos_name
                .parse::<Qos>()
                .with_context(|| format!("{name}: invalid experiment name {qos_name:?}"))?;
        }

        if self.gen_type == GenType::Rcg && self.experiment_names.is_empty() {
            let total = self
                .total_experiments
                .with_context(|| format!("{name}: rcg campaigns need total_experiments"))?;
            if total == 0 {
                anyhow::bail!("{name}: total_experiments must be at least 1");
            }
            let space = self.qos_settings.sample_space_size();
            if total as u128 > space {
                anyhow::bail!(
                    "{name}: total_experiments={total} exceeds the {space} distinct QoS combinations available"
                );
            }
        }

        Ok(())
    }

    fn validate_machines(&self) -> Result<()> {
        if self.slave_machines.is_empty() {
            anyhow::bail!("at least one machine is required");
        }

        let mut hostnames = HashSet::new();
        let mut ips = HashSet::new();
        for m in &self.slave_machines {
            if m.hostname.trim().is_empty() || m.username.trim().is_empty() {
                anyhow::bail!("hostname and username must not be empty");
            }
            if m.perftest_path.trim().is_empty() {
                anyhow::bail!("{}: perftest_path must not be empty", m.hostname);
            }
            if !hostnames.insert(m.hostname.as_str()) {
                anyhow::bail!("Duplicate hostname: {}", m.hostname);
            }
            if !ips.insert(m.ip) {
                anyhow::bail!("Duplicate IP address: {}", m.ip);
            }
        }

        if !self
            .slave_machines
            .iter()
            .any(|m| m.participant_type.publishes())
        {
            anyhow::bail!("no machine can run publishers");
        }
        if !self
            .slave_machines
            .iter()
            .any(|m| m.participant_type.subscribes())
        {
            anyhow::bail!("no machine can run subscribers");
        }
        Ok(())
    }

    /// Expands `~` in key paths and checks that each key exists.
    pub fn resolve_key_paths(&mut self) -> Result<()> {
        for m in &mut self.slave_machines {
            m.ssh_key_path = expand_tilde(&m.ssh_key_path);
            if !m.ssh_key_path.is_file() {
                anyhow::bail!(
                    "{}: ssh key {} does not exist",
                    m.hostname,
                    m.ssh_key_path.display()
                );
            }
        }
        Ok(())
    }

    /// Directory holding this campaign's status store and data.
    #[must_use]
    pub fn campaign_dir(&self) -> PathBuf {
        self.output_dir.join(&self.campaign_name)
    }
}

/// Load campaign definitions from a JSON file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<CampaignConfig>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let mut campaigns: Vec<CampaignConfig> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

    if campaigns.is_empty() {
        anyhow::bail!("{} defines no campaigns", path.as_ref().display());
    }

    let mut names = HashSet::new();
    for campaign in &mut campaigns {
        campaign.validate()?;
        campaign.resolve_key_paths()?;
        if !names.insert(campaign.campaign_name.clone()) {
            anyhow::bail!("Duplicate campaign_name: {}", campaign.campaign_name);
        }
    }

    Ok(campaigns)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn qos_settings() -> QosSettings {
        QosSettings {
            duration_secs: vec![30],
            datalen_bytes: vec![100, 1000],
            pub_count: vec![1],
            sub_count: vec![1, 2],
            use_reliable: vec![true, false],
            use_multicast: vec![false],
            durability: vec![0],
            latency_count: vec![100],
        }
    }

    pub(crate) fn machine_config(host: &str, octet: u8, ty: ParticipantType) -> MachineConfig {
        MachineConfig {
            hostname: host.to_string(),
            participant_type: ty,
            ip: Ipv4Addr::new(10, 0, 0, octet),
            ssh_key_path: PathBuf::from("/keys/id_rsa"),
            username: "perf".to_string(),
            perftest_path: "/opt/perftest/perftest_cpp".to_string(),
            smart_plug_name: None,
            smart_plug_ip: None,
        }
    }

    pub(crate) fn campaign_config() -> CampaignConfig {
        CampaignConfig {
            campaign_name: "smoke".to_string(),
            gen_type: GenType::Pcg,
            max_failures: 3,
            max_retries: 2,
            slave_machines: vec![
                machine_config("pi-1", 1, ParticipantType::Pub),
                machine_config("pi-2", 2, ParticipantType::Sub),
            ],
            qos_settings: qos_settings(),
            total_experiments: None,
            bw_rate: None,
            experiment_names: Vec::new(),
            skip_restart: false,
            output_dir: default_output_dir(),
            runner: RunnerSettings::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(campaign_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_failures() {
        let mut bad = campaign_config();
        bad.max_retries = 0;
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.qos_settings.durability.clear();
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.qos_settings.datalen_bytes = vec![100, 100];
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.qos_settings.sub_count = vec![0, 1];
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.qos_settings.durability = vec![4];
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.slave_machines[1].ip = bad.slave_machines[0].ip;
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.slave_machines[1].participant_type = ParticipantType::Pub;
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.campaign_name = "a/b".to_string();
        assert!(bad.validate().is_err());

        let mut bad = campaign_config();
        bad.experiment_names = vec!["not-a-qos".to_string()];
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_rcg_needs_total_within_space() {
        let mut cfg = campaign_config();
        cfg.gen_type = GenType::Rcg;
        assert!(cfg.validate().is_err());

        cfg.total_experiments = Some(5);
        assert!(cfg.validate().is_ok());

        // datalen [100, 1000] is a range of 901 values when sampled
        assert_eq!(cfg.qos_settings.sample_space_size(), 901 * 2 * 2);
        cfg.total_experiments = Some(901 * 2 * 2 + 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_combination_count() {
        assert_eq!(qos_settings().combination_count(), 8);
    }

    #[test]
    fn test_parse_rejects_missing_and_non_list_axes() {
        let mut value = serde_json::to_value(vec![campaign_config()]).unwrap();
        value[0]["qos_settings"]["duration_secs"] = serde_json::json!(30);
        assert!(serde_json::from_value::<Vec<CampaignConfig>>(value.clone()).is_err());

        value[0]["qos_settings"]
            .as_object_mut()
            .unwrap()
            .remove("duration_secs");
        assert!(serde_json::from_value::<Vec<CampaignConfig>>(value).is_err());

        let mut value = serde_json::to_value(vec![campaign_config()]).unwrap();
        value[0].as_object_mut().unwrap().remove("max_failures");
        assert!(serde_json::from_value::<Vec<CampaignConfig>>(value).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        fs::write(&key, "key").unwrap();

        let mut cfg = campaign_config();
        for m in &mut cfg.slave_machines {
            m.ssh_key_path = key.clone();
        }
        let path = dir.path().join("config.json");
        fs::write(&path, serde_json::to_string_pretty(&vec![cfg.clone()]).unwrap()).unwrap();

        let loaded = load_from_file(&path).unwrap();
        assert_eq!(loaded, vec![cfg.clone()]);

        // minimal JSON falls back to defaults
        let minimal = serde_json::json!([{
            "campaign_name": "minimal",
            "gen_type": "pcg",
            "max_failures": 0,
            "max_retries": 1,
            "slave_machines": [
                {"hostname": "pi-1", "participant_type": "all", "ip": "10.0.0.1",
                 "ssh_key_path": key, "username": "perf", "perftest_path": "/p/perftest_cpp"}
            ],
            "qos_settings": serde_json::to_value(qos_settings()).unwrap(),
        }]);
        fs::write(&path, minimal.to_string()).unwrap();
        let loaded = load_from_file(&path).unwrap();
        assert_eq!(loaded[0].output_dir, PathBuf::from("output"));
        assert_eq!(loaded[0].runner, RunnerSettings::default());
        assert!(!loaded[0].skip_restart);

        // missing key file
        for m in &mut cfg.slave_machines {
            m.ssh_key_path = dir.path().join("missing");
        }
        fs::write(&path, serde_json::to_string(&vec![cfg]).unwrap()).unwrap();
        assert!(load_from_file(&path).is_err());

        // bad IP
        let bad_ip = minimal.to_string().replace("10.0.0.1", "10.0.0.256");
        fs::write(&path, bad_ip).unwrap();
        assert!(load_from_file(&path).is_err());
    }
}
