use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::apply::ApplyFn;
use super::storage::{PersistedState, StateStore};
use super::transport::{self, RpcRequest, RpcResponse};
use super::{LogEntry, NodeConfig, NodeRole, NodeStatus, RaftTiming};

/// Everything the protocol reads and writes, behind a single lock. The
/// invariants span several fields at once (term vs vote, commit vs applied
/// vs log length), so the record is never split into per-field locks.
struct RaftState {
    current_term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
    role: NodeRole,
    commit_index: i64,
    last_applied: i64,
    current_leader: Option<(String, u16)>,
    next_index: HashMap<String, i64>,
    match_index: HashMap<String, i64>,
    election_deadline: Instant,
}

impl RaftState {
    fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            role: NodeRole::Follower,
            commit_index: -1,
            last_applied: -1,
            current_leader: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now(),
        }
    }

    fn last_index(&self) -> i64 {
        self.log.len() as i64 - 1
    }

    fn persisted(&self) -> PersistedState {
        PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone().unwrap_or_default(),
            log: self.log.clone(),
        }
    }

    /// Adopt a newer term and fall back to follower. The leader hint is
    /// stale at this point; it is re-learned from the next heartbeat.
    fn step_down(&mut self, term: u64) {
        self.current_term = term;
        self.voted_for = None;
        self.role = NodeRole::Follower;
        self.current_leader = None;
    }
}

/// One outbound append to a peer, prepared under the lock and dispatched
/// outside it. `acked_index` is the highest log index the peer holds once
/// it acknowledges this request.
struct AppendJob {
    peer_id: String,
    addr: String,
    request: RpcRequest,
    acked_index: i64,
}

/// The consensus node. Clones share the same underlying state, so the
/// background loops and the request layer all operate on one node.
#[derive(Clone)]
pub struct ConsensusNode {
    config: NodeConfig,
    timing: RaftTiming,
    state: Arc<Mutex<RaftState>>,
    store: StateStore,
    apply_fn: ApplyFn,
    apply_wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConsensusNode {
    pub fn new(config: NodeConfig, timing: RaftTiming, store: StateStore, apply_fn: ApplyFn) -> Self {
        Self {
            config,
            timing,
            state: Arc::new(Mutex::new(RaftState::new())),
            store,
            apply_fn,
            apply_wake: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> String {
        self.config.id()
    }

    /// Loads persisted state, binds the RPC listener and spawns the
    /// background loops. Nodes always come back as followers.
    pub async fn start(&self) -> Result<()> {
        let loaded = self.store.load()?;
        {
            let mut s = self.state.lock().await;
            s.current_term = loaded.current_term;
            s.voted_for = if loaded.voted_for.is_empty() {
                None
            } else {
                Some(loaded.voted_for)
            };
            s.log = loaded.log;
            s.role = NodeRole::Follower;
            s.election_deadline = self.next_election_deadline();
            info!(
                "node {} starting: term {}, {} log entries",
                self.id(),
                s.current_term,
                s.log.len()
            );
        }

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.rpc_port))
            .await
            .with_context(|| format!("binding rpc port {}", self.config.rpc_port))?;
        info!("rpc listener on {}:{}", self.config.host, self.config.rpc_port);

        let node = self.clone();
        let accept = tokio::spawn(async move { node.accept_loop(listener).await });
        let node = self.clone();
        let ticker = tokio::spawn(async move { node.timer_loop().await });
        let node = self.clone();
        let applier = tokio::spawn(async move { node.apply_loop().await });
        self.tasks.lock().await.extend([accept, ticker, applier]);
        Ok(())
    }

    /// Stops the background loops and closes the listener. Handlers already
    /// running finish on their own.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.apply_wake.notify_waiters();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("node {} stopped", self.id());
    }

    // ---- admission facade ----

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == NodeRole::Leader
    }

    pub async fn current_leader(&self) -> Option<(String, u16)> {
        self.state.lock().await.current_leader.clone()
    }

    pub async fn status(&self) -> NodeStatus {
        let s = self.state.lock().await;
        NodeStatus {
            node_id: self.id(),
            role: s.role,
            current_term: s.current_term,
            leader: s.current_leader.clone(),
            log_len: s.log.len(),
            commit_index: s.commit_index,
            last_applied: s.last_applied,
            peer_count: self.config.peers.len(),
        }
    }

    /// Appends a command on the leader and waits for a strict majority of
    /// the cluster to hold it. Returns false immediately on a non-leader.
    /// Concurrent calls serialize on the state lock, so the log order is
    /// the order in which appends win the critical section.
    pub async fn replicate(&self, command: Value) -> bool {
        let (term, index, batch) = {
            let mut s = self.state.lock().await;
            if s.role != NodeRole::Leader {
                return false;
            }
            let entry = LogEntry { term: s.current_term, command };
            s.log.push(entry.clone());
            self.persist(&s);
            let index = s.last_index();
            let batch = self
                .config
                .peers
                .iter()
                .map(|peer| AppendJob {
                    peer_id: peer.id(),
                    addr: peer.rpc_addr(),
                    request: RpcRequest::AppendEntries {
                        term: s.current_term,
                        leader_id: (self.config.host.clone(), self.config.client_port),
                        entries: vec![entry.clone()],
                        prev_log_index: -1,
                        prev_log_term: 0,
                        leader_commit: s.commit_index,
                    },
                    acked_index: index,
                })
                .collect::<Vec<_>>();
            (s.current_term, index, batch)
        };

        debug!("replicating entry {} in term {}", index, term);
        let acks = self.fan_out_appends(batch, self.timing.replicate_wait).await;

        // The leader's own copy counts toward the majority.
        if acks + 1 >= self.config.majority() {
            let mut s = self.state.lock().await;
            if s.role == NodeRole::Leader && s.current_term == term && index > s.commit_index {
                s.commit_index = index;
                self.apply_wake.notify_one();
            }
            true
        } else {
            warn!(
                "entry {} reached {} of {} required acknowledgements",
                index,
                acks + 1,
                self.config.majority()
            );
            false
        }
    }

    // ---- rpc handlers ----

    async fn handle_request_vote(&self, term: u64, candidate_id: String) -> RpcResponse {
        let mut s = self.state.lock().await;
        let mut changed = false;
        if term > s.current_term {
            s.step_down(term);
            changed = true;
        }
        let granted = term >= s.current_term
            && s.voted_for.as_deref().map_or(true, |v| v == candidate_id);
        if granted {
            s.voted_for = Some(candidate_id.clone());
            s.election_deadline = self.next_election_deadline();
            changed = true;
        }
        if changed {
            self.persist(&s);
        }
        debug!(
            "vote request from {} for term {}: granted={}",
            candidate_id, term, granted
        );
        RpcResponse::Vote { term: s.current_term, vote_granted: granted }
    }

    async fn handle_append_entries(
        &self,
        term: u64,
        leader_id: (String, u16),
        entries: Vec<LogEntry>,
        leader_commit: i64,
    ) -> RpcResponse {
        let mut s = self.state.lock().await;
        if term < s.current_term {
            return RpcResponse::Append { term: s.current_term, success: false };
        }

        let mut changed = false;
        if term > s.current_term {
            s.current_term = term;
            s.voted_for = None;
            changed = true;
        }
        if s.role != NodeRole::Follower {
            info!("deferring to leader {:?} for term {}", leader_id, term);
            s.role = NodeRole::Follower;
        }
        s.current_leader = Some(leader_id);

        // Entries are appended at the tail in arrival order; divergent
        // histories are not reconciled here.
        if !entries.is_empty() {
            s.log.extend(entries);
            changed = true;
        }

        if leader_commit > s.commit_index {
            s.commit_index = leader_commit.min(s.last_index());
            self.apply_wake.notify_one();
        }

        if changed {
            self.persist(&s);
        }
        s.election_deadline = self.next_election_deadline();
        RpcResponse::Append { term: s.current_term, success: true }
    }

    // ---- elections ----

    async fn start_election(&self) {
        let (term, request) = {
            let mut s = self.state.lock().await;
            s.current_term += 1;
            s.role = NodeRole::Candidate;
            s.voted_for = Some(self.id());
            s.current_leader = None;
            s.election_deadline = self.next_election_deadline();
            self.persist(&s);
            info!("starting election for term {}", s.current_term);
            (
                s.current_term,
                RpcRequest::RequestVote { term: s.current_term, candidate_id: self.id() },
            )
        };

        let mut votes = 1usize; // self-vote
        if votes >= self.config.majority() {
            self.try_become_leader(term).await;
            return;
        }

        let rpc_timeout = self.timing.rpc_timeout;
        let mut pending: FuturesUnordered<_> = self
            .config
            .peers
            .iter()
            .map(|peer| {
                let addr = peer.rpc_addr();
                let request = request.clone();
                async move { transport::call(&addr, &request, rpc_timeout).await }
            })
            .collect();

        let wait = sleep(self.timing.vote_wait);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                next = pending.next() => match next {
                    None => break,
                    Some(Some(RpcResponse::Vote { term: peer_term, vote_granted })) => {
                        if self.observe_term(peer_term).await {
                            return;
                        }
                        if vote_granted {
                            votes += 1;
                            if votes >= self.config.majority() {
                                break;
                            }
                        }
                    }
                    Some(_) => {}
                },
            }
        }

        if votes >= self.config.majority() {
            self.try_become_leader(term).await;
        } else {
            debug!(
                "election for term {} fell short: {}/{} votes",
                term,
                votes,
                self.config.majority()
            );
        }
    }

    async fn try_become_leader(&self, term: u64) {
        {
            let mut s = self.state.lock().await;
            if s.role != NodeRole::Candidate || s.current_term != term {
                return;
            }
            s.role = NodeRole::Leader;
            s.current_leader = Some((self.config.host.clone(), self.config.client_port));
            let next = s.log.len() as i64;
            for peer in &self.config.peers {
                s.next_index.insert(peer.id(), next);
                s.match_index.insert(peer.id(), -1);
            }
            info!("won election, leading term {}", term);
        }
        // Announce leadership right away instead of waiting a beat.
        self.send_heartbeats().await;
    }

    // ---- replication to followers ----

    /// Prepares one append per peer, carrying whatever suffix of the log
    /// that peer has not acknowledged yet. Empty for peers that are caught
    /// up; either way the request propagates `leader_commit`.
    async fn send_heartbeats(&self) {
        let batch = {
            let s = self.state.lock().await;
            if s.role != NodeRole::Leader {
                return;
            }
            let last = s.last_index();
            self.config
                .peers
                .iter()
                .map(|peer| {
                    let next = s
                        .next_index
                        .get(&peer.id())
                        .copied()
                        .unwrap_or(last + 1)
                        .clamp(0, last + 1);
                    AppendJob {
                        peer_id: peer.id(),
                        addr: peer.rpc_addr(),
                        request: RpcRequest::AppendEntries {
                            term: s.current_term,
                            leader_id: (self.config.host.clone(), self.config.client_port),
                            entries: s.log[next as usize..].to_vec(),
                            prev_log_index: -1,
                            prev_log_term: 0,
                            leader_commit: s.commit_index,
                        },
                        acked_index: last,
                    }
                })
                .collect::<Vec<_>>()
        };
        self.fan_out_appends(batch, self.timing.replicate_wait).await;
    }

    /// Dispatches the prepared appends in parallel and merges responses
    /// back under the lock, counting successes until the deadline. A peer
    /// that does not answer in time simply contributes no acknowledgement.
    async fn fan_out_appends(&self, batch: Vec<AppendJob>, deadline: Duration) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let rpc_timeout = self.timing.rpc_timeout;
        let mut pending: FuturesUnordered<_> = batch
            .into_iter()
            .map(|job| async move {
                let response = transport::call(&job.addr, &job.request, rpc_timeout).await;
                (job.peer_id, job.acked_index, response)
            })
            .collect();

        let mut acks = 0usize;
        let wait = sleep(deadline);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                next = pending.next() => match next {
                    None => break,
                    Some((peer_id, acked, Some(RpcResponse::Append { term, success }))) => {
                        if self.observe_term(term).await {
                            break;
                        }
                        if success {
                            acks += 1;
                            self.advance_peer(&peer_id, acked).await;
                        }
                    }
                    Some(_) => {} // missed response or mismatched reply
                },
            }
        }
        acks
    }

    /// Steps down if a response carried a newer term. Returns true when we
    /// did.
    async fn observe_term(&self, term: u64) -> bool {
        let mut s = self.state.lock().await;
        if term > s.current_term {
            info!("observed newer term {} (own {}), stepping down", term, s.current_term);
            s.step_down(term);
            self.persist(&s);
            true
        } else {
            false
        }
    }

    async fn advance_peer(&self, peer_id: &str, acked: i64) {
        let mut s = self.state.lock().await;
        if s.role != NodeRole::Leader {
            return;
        }
        let next = s.next_index.entry(peer_id.to_string()).or_insert(0);
        if acked + 1 > *next {
            *next = acked + 1;
        }
        let matched = s.match_index.entry(peer_id.to_string()).or_insert(-1);
        if acked > *matched {
            *matched = acked;
        }
    }

    // ---- background loops ----

    async fn timer_loop(&self) {
        let mut ticker = interval(Duration::from_millis(100));
        let mut last_heartbeat = Instant::now();
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let (role, deadline) = {
                let s = self.state.lock().await;
                (s.role, s.election_deadline)
            };
            match role {
                NodeRole::Leader => {
                    if last_heartbeat.elapsed() >= self.timing.heartbeat_interval {
                        last_heartbeat = Instant::now();
                        self.send_heartbeats().await;
                    }
                }
                NodeRole::Follower | NodeRole::Candidate => {
                    if Instant::now() >= deadline {
                        self.start_election().await;
                        last_heartbeat = Instant::now();
                    }
                }
            }
        }
    }

    /// Walks `last_applied` toward `commit_index`, handing each committed
    /// entry to the callback. The lock is held only to claim the next
    /// entry; the callback itself runs unlocked on this dedicated task.
    async fn apply_loop(&self) {
        loop {
            self.apply_wake.notified().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            loop {
                let entry = {
                    let mut s = self.state.lock().await;
                    if s.last_applied < s.commit_index {
                        s.last_applied += 1;
                        Some(s.log[s.last_applied as usize].clone())
                    } else {
                        None
                    }
                };
                match entry {
                    Some(entry) => (self.apply_fn)(&entry.command),
                    None => break,
                }
            }
        }
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let node = self.clone();
                    tokio::spawn(async move { node.handle_rpc_connection(stream).await });
                }
                Err(e) => {
                    warn!("rpc accept failed: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One request line, one response line. Malformed payloads are dropped
    /// by closing the connection without a response.
    async fn handle_rpc_connection(&self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        match timeout(self.timing.rpc_timeout, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => {}
            _ => return,
        }
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping malformed rpc: {}", e);
                return;
            }
        };
        let response = match request {
            RpcRequest::RequestVote { term, candidate_id } => {
                self.handle_request_vote(term, candidate_id).await
            }
            RpcRequest::AppendEntries { term, leader_id, entries, leader_commit, .. } => {
                self.handle_append_entries(term, leader_id, entries, leader_commit).await
            }
        };
        match serde_json::to_string(&response) {
            Ok(mut payload) => {
                payload.push('\n');
                if let Err(e) = write_half.write_all(payload.as_bytes()).await {
                    debug!("failed to send rpc response: {}", e);
                }
            }
            Err(e) => error!("failed to encode rpc response: {}", e),
        }
    }

    // ---- helpers ----

    /// Durability failures are logged; the in-memory mutation stands.
    fn persist(&self, s: &RaftState) {
        if let Err(e) = self.store.save(&s.persisted()) {
            error!("failed to persist raft state: {:#}", e);
        }
    }

    fn next_election_deadline(&self) -> Instant {
        let min = self.timing.election_timeout_min.as_millis() as u64;
        let max = self.timing.election_timeout_max.as_millis() as u64;
        let span = max.saturating_sub(min).max(1);
        let jitter = rand::random::<u64>() % span;
        Instant::now() + Duration::from_millis(min + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("modelherd-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_node(dir: &std::path::Path) -> ConsensusNode {
        let config = NodeConfig {
            host: "127.0.0.1".to_string(),
            rpc_port: 0,
            client_port: 0,
            peers: vec![],
        };
        ConsensusNode::new(
            config,
            RaftTiming::default(),
            StateStore::new(dir),
            Arc::new(|_| {}),
        )
    }

    #[tokio::test]
    async fn grants_at_most_one_vote_per_term() {
        let dir = temp_dir("vote-once");
        let node = test_node(&dir);

        let first = node.handle_request_vote(5, "10.0.0.1:9101".to_string()).await;
        assert!(matches!(first, RpcResponse::Vote { vote_granted: true, .. }));

        let rival = node.handle_request_vote(5, "10.0.0.2:9101".to_string()).await;
        assert!(matches!(rival, RpcResponse::Vote { vote_granted: false, .. }));

        // The same candidate may ask again in the same term.
        let repeat = node.handle_request_vote(5, "10.0.0.1:9101".to_string()).await;
        assert!(matches!(repeat, RpcResponse::Vote { vote_granted: true, .. }));
    }

    #[tokio::test]
    async fn higher_term_resets_the_vote() {
        let dir = temp_dir("vote-reset");
        let node = test_node(&dir);

        node.handle_request_vote(5, "10.0.0.1:9101".to_string()).await;
        let newer = node.handle_request_vote(6, "10.0.0.2:9101".to_string()).await;
        match newer {
            RpcResponse::Vote { term, vote_granted } => {
                assert_eq!(term, 6);
                assert!(vote_granted);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn stale_vote_request_is_denied() {
        let dir = temp_dir("vote-stale");
        let node = test_node(&dir);
        node.handle_append_entries(7, ("10.0.0.9".to_string(), 9101), vec![], -1).await;
        let stale = node.handle_request_vote(3, "10.0.0.1:9101".to_string()).await;
        match stale {
            RpcResponse::Vote { term, vote_granted } => {
                assert_eq!(term, 7);
                assert!(!vote_granted);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_terms() {
        let dir = temp_dir("ae-stale");
        let node = test_node(&dir);
        node.handle_append_entries(4, ("10.0.0.9".to_string(), 9101), vec![], -1).await;
        let stale = node
            .handle_append_entries(3, ("10.0.0.8".to_string(), 9102), vec![], -1)
            .await;
        assert!(matches!(stale, RpcResponse::Append { success: false, term: 4 }));
        // The stale sender did not displace the leader hint.
        assert_eq!(node.current_leader().await, Some(("10.0.0.9".to_string(), 9101)));
    }

    #[tokio::test]
    async fn append_entries_appends_and_caps_commit_index() {
        let dir = temp_dir("ae-commit");
        let node = test_node(&dir);
        let entries = vec![
            LogEntry { term: 1, command: json!({"action": "STORE_FILE", "filename": "a.bin"}) },
            LogEntry { term: 1, command: json!({"action": "STORE_FILE", "filename": "b.bin"}) },
        ];
        // leader_commit points past the local log; commit is capped at the tail
        let response = node
            .handle_append_entries(1, ("10.0.0.9".to_string(), 9101), entries, 10)
            .await;
        assert!(matches!(response, RpcResponse::Append { success: true, .. }));

        let status = node.status().await;
        assert_eq!(status.log_len, 2);
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.leader, Some(("10.0.0.9".to_string(), 9101)));
    }

    #[tokio::test]
    async fn mutating_handlers_persist_before_responding() {
        let dir = temp_dir("persist-handlers");
        let node = test_node(&dir);
        let store = StateStore::new(&dir);

        node.handle_request_vote(2, "10.0.0.1:9101".to_string()).await;
        let on_disk = store.load().unwrap();
        assert_eq!(on_disk.current_term, 2);
        assert_eq!(on_disk.voted_for, "10.0.0.1:9101");

        let entry = LogEntry { term: 3, command: json!({"k": 1}) };
        node.handle_append_entries(3, ("10.0.0.9".to_string(), 9101), vec![entry.clone()], -1)
            .await;
        let on_disk = store.load().unwrap();
        assert_eq!(on_disk.current_term, 3);
        assert_eq!(on_disk.voted_for, "");
        assert_eq!(on_disk.log, vec![entry]);
    }

    #[tokio::test]
    async fn replicate_on_a_follower_returns_false() {
        let dir = temp_dir("replicate-follower");
        let node = test_node(&dir);
        assert!(!node.replicate(json!({"action": "STORE_FILE"})).await);
        assert_eq!(node.status().await.log_len, 0);
    }
}
