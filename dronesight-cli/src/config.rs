//! Load config from file and environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dronesight_core::rules::parse_prefix;
use dronesight_core::{MacParseError, RuleSet, ThreadPool, VendorFallback, DEFAULT_PACKET_THRESHOLD};
use serde::Deserialize;

/// Batch configuration. File: ~/.config/dronesight/config.toml or /etc/dronesight/config.toml.
/// Env overrides: DRONESIGHT_PACKET_THRESHOLD, DRONESIGHT_THREADS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Packets per transmitter before the estimator runs (default 200).
    #[serde(default = "default_packet_threshold")]
    pub packet_threshold: usize,
    /// Worker threads; 0 picks from the host's parallelism.
    #[serde(default)]
    pub threads: usize,
    #[serde(default)]
    pub estimator_path: Option<PathBuf>,
    #[serde(default)]
    pub sequence_model_path: Option<PathBuf>,
    #[serde(default)]
    pub transformer_path: Option<PathBuf>,
    #[serde(default)]
    pub rules: RulesConfig,
}

/// Extra classification tables on top of (or instead of) the built-in ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Start from the built-in vendor table, drone vendors and SSID keywords.
    #[serde(default = "default_builtin")]
    pub builtin: bool,
    /// `"aa:bb:cc"` or `"aa:bb:cc:d"` -> vendor name.
    #[serde(default)]
    pub vendors: BTreeMap<String, String>,
    #[serde(default)]
    pub drone_vendors: Vec<String>,
    #[serde(default)]
    pub ssid_keywords: Vec<String>,
    #[serde(default)]
    pub unaffiliated_vendor: VendorFallback,
}

fn default_packet_threshold() -> usize {
    DEFAULT_PACKET_THRESHOLD
}
fn default_builtin() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packet_threshold: default_packet_threshold(),
            threads: 0,
            estimator_path: None,
            sequence_model_path: None,
            transformer_path: None,
            rules: RulesConfig::default(),
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            builtin: default_builtin(),
            vendors: BTreeMap::new(),
            drone_vendors: Vec::new(),
            ssid_keywords: Vec::new(),
            unaffiliated_vendor: VendorFallback::default(),
        }
    }
}

impl Config {
    /// Worker count with 0 resolved.
    pub fn worker_threads(&self) -> usize {
        if self.threads == 0 {
            ThreadPool::default_size()
        } else {
            self.threads
        }
    }
}

impl RulesConfig {
    pub fn rule_set(&self) -> Result<RuleSet, MacParseError> {
        let mut rules = if self.builtin {
            RuleSet::default()
        } else {
            RuleSet::empty()
        };
        for (prefix, name) in &self.vendors {
            rules.add_vendor(parse_prefix(prefix)?, name.clone());
        }
        for name in &self.drone_vendors {
            rules.add_drone_vendor(name.clone());
        }
        for kw in &self.ssid_keywords {
            rules.add_ssid_keyword(kw);
        }
        rules.fallback = self.unaffiliated_vendor;
        Ok(rules)
    }
}

/// Load config: merge default, then config file (explicit path, or the first default
/// location present), then env vars. Only an explicit path that fails to load is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("DRONESIGHT_PACKET_THRESHOLD") {
        if let Ok(n) = s.parse::<usize>() {
            c.packet_threshold = n;
        }
    }
    if let Some(s) = var("DRONESIGHT_THREADS") {
        if let Ok(n) = s.parse::<usize>() {
            c.threads = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dronesight/config.toml"));
    }
    out.push(PathBuf::from("/etc/dronesight/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}
