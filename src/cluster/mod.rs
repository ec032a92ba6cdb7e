use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod apply;
pub mod consensus;
pub mod storage;
pub mod transport;

/// A statically configured cluster member. Peers are plain value records;
/// a peer's identity is its client-facing address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub host: String,
    pub rpc_port: u16,
    pub client_port: u16,
}

impl PeerInfo {
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

/// One replicated log entry. The command payload is an arbitrary JSON
/// object; only the apply engine assigns meaning to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: serde_json::Value,
}

/// Identity and peer set of the local node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub rpc_port: u16,
    pub client_port: u16,
    pub peers: Vec<PeerInfo>,
}

impl NodeConfig {
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the static cluster size, self included.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

/// Timing knobs for elections, heartbeats and bounded waits.
#[derive(Debug, Clone, Copy)]
pub struct RaftTiming {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub vote_wait: Duration,
    pub replicate_wait: Duration,
    pub rpc_timeout: Duration,
}

impl Default for RaftTiming {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(3000),
            election_timeout_max: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(1000),
            vote_wait: Duration::from_secs(2),
            replicate_wait: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

/// Point-in-time snapshot of a node, for the status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub role: NodeRole,
    pub current_term: u64,
    pub leader: Option<(String, u16)>,
    pub log_len: usize,
    pub commit_index: i64,
    pub last_applied: i64,
    pub peer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_cluster_sizes() {
        let mut config = NodeConfig {
            host: "127.0.0.1".to_string(),
            rpc_port: 9000,
            client_port: 9100,
            peers: vec![],
        };
        assert_eq!(config.majority(), 1);

        config.peers = vec![
            PeerInfo { host: "127.0.0.1".to_string(), rpc_port: 9001, client_port: 9101 },
            PeerInfo { host: "127.0.0.1".to_string(), rpc_port: 9002, client_port: 9102 },
        ];
        assert_eq!(config.cluster_size(), 3);
        assert_eq!(config.majority(), 2);

        config.peers.push(PeerInfo {
            host: "127.0.0.1".to_string(),
            rpc_port: 9003,
            client_port: 9103,
        });
        assert_eq!(config.majority(), 3);
    }

    #[test]
    fn peer_addresses() {
        let peer = PeerInfo {
            host: "10.0.0.7".to_string(),
            rpc_port: 9000,
            client_port: 9100,
        };
        assert_eq!(peer.rpc_addr(), "10.0.0.7:9000");
        assert_eq!(peer.id(), "10.0.0.7:9100");
    }
}
