use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::LogEntry;

/// Peer-to-peer messages: one UTF-8 JSON object per `\n`-terminated line,
/// one request and one response per TCP connection.
///
/// `prev_log_index` and `prev_log_term` are carried for wire compatibility
/// and are not consulted by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcRequest {
    #[serde(rename = "REQUEST_VOTE")]
    RequestVote { term: u64, candidate_id: String },
    #[serde(rename = "APPEND_ENTRIES")]
    AppendEntries {
        term: u64,
        leader_id: (String, u16),
        entries: Vec<LogEntry>,
        prev_log_index: i64,
        prev_log_term: u64,
        leader_commit: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcResponse {
    #[serde(rename = "VOTE_RESPONSE")]
    Vote { term: u64, vote_granted: bool },
    #[serde(rename = "APPEND_RESPONSE")]
    Append { term: u64, success: bool },
}

/// Dials a peer, sends one request line and reads one response line. Dial,
/// write and read are each bounded by `deadline`. Any failure along the way
/// yields `None`; the consensus layer counts that as a missed response and
/// never retries at this level.
pub async fn call(addr: &str, request: &RpcRequest, deadline: Duration) -> Option<RpcResponse> {
    match exchange(addr, request, deadline).await {
        Ok(response) => Some(response),
        Err(e) => {
            debug!("rpc to {} yielded no response: {}", addr, e);
            None
        }
    }
}

async fn exchange(addr: &str, request: &RpcRequest, deadline: Duration) -> Result<RpcResponse> {
    let stream = timeout(deadline, TcpStream::connect(addr)).await??;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    timeout(deadline, write_half.write_all(line.as_bytes())).await??;

    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    timeout(deadline, reader.read_line(&mut response)).await??;
    Ok(serde_json::from_str(&response)?)
}
