//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory (or
//! an explicit path), then applies `GROUPNODE_DATA_DIR` and
//! `GROUPNODE_LOG_LEVEL` env overrides.

use std::{
    collections::BTreeSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    bootstrap::logger,
    error::AppError,
    ledger::MAX_BLOCK_LIMIT_WINDOW,
    types::{GroupId, NodeId},
};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const DEFAULT_IDENTITY_FILE: &str = "node.private";

/// Network layer parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Listen address announced to peers.
    pub listen: String,
}

/// Per-group parameters, read-only after load.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub id: GroupId,
    /// Node ids allowed to take part in this group's consensus.
    pub miners: Vec<NodeId>,
    /// How often the sealer cuts a block.
    pub block_interval_ms: u64,
    /// Upper bound on transactions sealed into one block.
    pub max_block_txs: usize,
    /// Capacity of the pending transaction pool.
    pub pool_limit: usize,
}

impl GroupConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }
}

/// Synthetic load generator settings.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub enabled: bool,
    /// Group that receives the generated transactions.
    pub group: GroupId,
    /// Target rate in transactions per second.
    pub tx_speed: f64,
    /// Blocks past the current height a generated transaction stays valid for.
    pub block_limit_horizon: u64,
}

impl LoadConfig {
    /// Pause between two submissions: `1000 / tx_speed` milliseconds,
    /// truncated to whole milliseconds.
    pub fn interval(&self) -> Duration {
        Duration::from_millis((1000.0 / self.tx_speed) as u64)
    }
}

/// Fully-resolved node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for node-local data (already expanded, no `~`).
    pub data_dir: PathBuf,
    /// Path to the hex-encoded node secret.
    pub identity_file: PathBuf,
    pub log_level: String,
    pub network: NetworkConfig,
    /// Groups sorted by id; ids are exactly `1..=groups.len()`.
    pub groups: Vec<GroupConfig>,
    pub load: LoadConfig,
}

impl Config {
    pub fn group(&self, id: GroupId) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Override the load generator rate (e.g. from `--tx-speed`).
    pub fn set_tx_speed(&mut self, tx_speed: f64) -> Result<(), AppError> {
        validate_tx_speed(tx_speed)?;
        self.load.tx_speed = tx_speed;
        Ok(())
    }

    /// Override how many blocks ahead generated transactions stay valid.
    pub fn set_block_limit_horizon(&mut self, horizon: u64) -> Result<(), AppError> {
        validate_block_limit_horizon(horizon)?;
        self.load.block_limit_horizon = horizon;
        Ok(())
    }
}

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    node: RawNode,
    #[serde(default)]
    network: RawNetwork,
    #[serde(default)]
    groups: Vec<RawGroup>,
    #[serde(default)]
    load: RawLoad,
}

#[derive(Deserialize)]
struct RawNode {
    data_dir: String,
    #[serde(default)]
    identity_file: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

#[derive(Deserialize)]
struct RawNetwork {
    #[serde(default = "default_listen")]
    listen: String,
}

impl Default for RawNetwork {
    fn default() -> Self {
        Self { listen: default_listen() }
    }
}

#[derive(Deserialize)]
struct RawGroup {
    id: u16,
    #[serde(default)]
    miners: Vec<String>,
    #[serde(default = "default_block_interval_ms")]
    block_interval_ms: u64,
    #[serde(default = "default_max_block_txs")]
    max_block_txs: usize,
    #[serde(default = "default_pool_limit")]
    pool_limit: usize,
}

#[derive(Deserialize)]
struct RawLoad {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_load_group")]
    group: u16,
    #[serde(default = "default_tx_speed")]
    tx_speed: f64,
    #[serde(default = "default_block_limit_horizon")]
    block_limit_horizon: u64,
}

impl Default for RawLoad {
    fn default() -> Self {
        Self {
            enabled: true,
            group: default_load_group(),
            tx_speed: default_tx_speed(),
            block_limit_horizon: default_block_limit_horizon(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_listen() -> String { "0.0.0.0:30300".to_string() }
fn default_block_interval_ms() -> u64 { 1000 }
fn default_max_block_txs() -> usize { 1000 }
fn default_pool_limit() -> usize { 102_400 }
fn default_load_group() -> u16 { 1 }
fn default_tx_speed() -> f64 { 10.0 }
fn default_block_limit_horizon() -> u64 { 1000 }
fn default_true() -> bool { true }

/// Load config from `path` (or `config/default.toml`), then apply env-var overrides.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let data_dir_override = env::var("GROUPNODE_DATA_DIR").ok();
    let log_level_override = env::var("GROUPNODE_LOG_LEVEL").ok();
    load_from(
        Path::new(path.unwrap_or(DEFAULT_CONFIG_PATH)),
        data_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    data_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    parse(&raw, data_dir_override, log_level_override)
        .map_err(|e| match e {
            AppError::Config(msg) => AppError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
}

fn parse(
    raw: &str,
    data_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let parsed: RawConfig =
        toml::from_str(raw).map_err(|e| AppError::Config(format!("parse error: {e}")))?;

    let n = parsed.node;
    let data_dir = expand_home(data_dir_override.unwrap_or(&n.data_dir));
    let log_level = log_level_override.unwrap_or(&n.log_level).to_string();
    logger::parse_level(&log_level).map_err(|e| AppError::Config(format!("log_level: {e}")))?;
    let identity_file = {
        let path = PathBuf::from(n.identity_file.as_deref().unwrap_or(DEFAULT_IDENTITY_FILE));
        if path.is_absolute() { path } else { data_dir.join(path) }
    };

    let groups = resolve_groups(parsed.groups)?;

    let load = LoadConfig {
        enabled: parsed.load.enabled,
        group: GroupId::new(parsed.load.group),
        tx_speed: parsed.load.tx_speed,
        block_limit_horizon: parsed.load.block_limit_horizon,
    };
    validate_tx_speed(load.tx_speed)?;
    validate_block_limit_horizon(load.block_limit_horizon)?;
    if load.enabled && !groups.iter().any(|g| g.id == load.group) {
        return Err(AppError::Config(format!(
            "load.group = {} is not a configured group",
            load.group
        )));
    }

    Ok(Config {
        data_dir,
        identity_file,
        log_level,
        network: NetworkConfig { listen: parsed.network.listen },
        groups,
        load,
    })
}

/// Sort groups by id and check they are numbered `1..=N` without gaps.
fn resolve_groups(raw: Vec<RawGroup>) -> Result<Vec<GroupConfig>, AppError> {
    if raw.is_empty() {
        return Err(AppError::Config("at least one [[groups]] entry is required".into()));
    }

    let mut seen = BTreeSet::new();
    let mut groups = Vec::with_capacity(raw.len());
    for g in raw {
        if !seen.insert(g.id) {
            return Err(AppError::Config(format!("group {} is configured twice", g.id)));
        }
        let miners = g
            .miners
            .iter()
            .map(|m| {
                m.parse::<NodeId>()
                    .map_err(|e| AppError::Config(format!("group {}: bad miner id: {e}", g.id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        groups.push(GroupConfig {
            id: GroupId::new(g.id),
            miners,
            block_interval_ms: g.block_interval_ms,
            max_block_txs: g.max_block_txs,
            pool_limit: g.pool_limit,
        });
    }
    groups.sort_by_key(|g| g.id);

    for (idx, g) in groups.iter().enumerate() {
        let expected = idx + 1;
        if usize::from(g.id.get()) != expected {
            return Err(AppError::Config(format!(
                "group ids must be numbered 1..={} without gaps (found {} at position {expected})",
                groups.len(),
                g.id
            )));
        }
    }
    Ok(groups)
}

fn validate_tx_speed(tx_speed: f64) -> Result<(), AppError> {
    // Above 1000 tx/s the millisecond interval truncates to zero.
    if !(tx_speed > 0.0 && tx_speed <= 1000.0) {
        return Err(AppError::Config(format!(
            "tx_speed must be in (0, 1000], got {tx_speed}"
        )));
    }
    Ok(())
}

fn validate_block_limit_horizon(horizon: u64) -> Result<(), AppError> {
    // The pool refuses limits at or below the current height and beyond
    // `height + MAX_BLOCK_LIMIT_WINDOW`.
    if !(1..=MAX_BLOCK_LIMIT_WINDOW).contains(&horizon) {
        return Err(AppError::Config(format!(
            "block_limit_horizon must be in 1..={MAX_BLOCK_LIMIT_WINDOW}, got {horizon}"
        )));
    }
    Ok(())
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl Config {
    /// Config rooted at `data_dir` with `group_count` miner-less groups and
    /// the load generator disabled. Used by unit and integration tests.
    pub fn test_default(data_dir: &Path, group_count: u16) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            identity_file: data_dir.join(DEFAULT_IDENTITY_FILE),
            log_level: "info".into(),
            network: NetworkConfig { listen: "127.0.0.1:0".into() },
            groups: (1..=group_count)
                .map(|id| GroupConfig {
                    id: GroupId::new(id),
                    miners: Vec::new(),
                    block_interval_ms: 1000,
                    max_block_txs: 100,
                    pool_limit: 1024,
                })
                .collect(),
            load: LoadConfig {
                enabled: false,
                group: GroupId::new(1),
                tx_speed: 10.0,
                block_limit_horizon: 1000,
            },
        }
    }
}
