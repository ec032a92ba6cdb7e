use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::{NodeConfig, PeerInfo, RaftTiming};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node: NodeSection,
    #[serde(default)]
    pub raft: RaftSection,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub dashboard: DashboardSection,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSection {
    #[serde(default = "default_host")]
    pub host: String,
    pub rpc_port: u16,
    pub client_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaftSection {
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_vote_wait")]
    pub vote_wait_ms: u64,
    #[serde(default = "default_replicate_wait")]
    pub replicate_wait_ms: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            vote_wait_ms: default_vote_wait(),
            replicate_wait_ms: default_replicate_wait(),
            rpc_timeout_ms: default_rpc_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainerConfig {
    #[serde(default = "default_train_command")]
    pub train_command: String,
    #[serde(default)]
    pub train_args: Vec<String>,
    #[serde(default = "default_predict_command")]
    pub predict_command: String,
    #[serde(default)]
    pub predict_args: Vec<String>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            train_command: default_train_command(),
            train_args: vec!["train.py".to_string()],
            predict_command: default_predict_command(),
            predict_args: vec!["predict.py".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DashboardSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_dashboard_port(),
        }
    }
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_election_timeout_min() -> u64 { 3000 }
fn default_election_timeout_max() -> u64 { 5000 }
fn default_heartbeat_interval() -> u64 { 1000 }
fn default_vote_wait() -> u64 { 2000 }
fn default_replicate_wait() -> u64 { 5000 }
fn default_rpc_timeout() -> u64 { 2000 }
fn default_train_command() -> String { "python3".to_string() }
fn default_predict_command() -> String { "python3".to_string() }
fn default_true() -> bool { true }
fn default_dashboard_port() -> u16 { 8080 }

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        let config: Config =
            toml::from_str(&contents).with_context(|| format!("parsing config {path}"))?;
        Ok(config)
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            host: self.node.host.clone(),
            rpc_port: self.node.rpc_port,
            client_port: self.node.client_port,
            peers: self.peers.clone(),
        }
    }

    pub fn raft_timing(&self) -> RaftTiming {
        RaftTiming {
            election_timeout_min: Duration::from_millis(self.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.raft.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(self.raft.heartbeat_interval_ms),
            vote_wait: Duration::from_millis(self.raft.vote_wait_ms),
            replicate_wait: Duration::from_millis(self.raft.replicate_wait_ms),
            rpc_timeout: Duration::from_millis(self.raft.rpc_timeout_ms),
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.node.data_dir.join("models")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.node.data_dir.join("staging")
    }
}
