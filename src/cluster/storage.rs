use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::LogEntry;

pub const STATE_FILE: &str = "raft_state.json";

/// The durable slice of a node's state. `voted_for` is the empty string
/// when the node has not voted in `current_term`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: String,
    pub log: Vec<LogEntry>,
}

/// Reads and writes `raft_state.json` in the node's data directory.
/// Writes go through a temporary sibling and a rename so a crash mid-write
/// leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(STATE_FILE),
        }
    }

    /// A missing file is a fresh node: term 0, no vote, empty log.
    pub fn load(&self) -> Result<PersistedState> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("corrupt state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => {
                Err(e).with_context(|| format!("reading state file {}", self.path.display()))
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, data)
            .with_context(|| format!("writing state file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing state file {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("modelherd-{}-{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_is_fresh_state() {
        let dir = temp_dir("storage-fresh");
        let store = StateStore::new(&dir);
        let state = store.load().unwrap();
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, "");
        assert!(state.log.is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = temp_dir("storage-roundtrip");
        let store = StateStore::new(&dir);
        let state = PersistedState {
            current_term: 4,
            voted_for: "10.0.0.2:9101".to_string(),
            log: vec![
                LogEntry { term: 2, command: json!({"action": "STORE_FILE", "filename": "a.bin"}) },
                LogEntry { term: 4, command: json!({"action": "MODEL_TRAINED", "model_id": "m1"}) },
            ],
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn save_does_not_leave_tmp_file() {
        let dir = temp_dir("storage-tmp");
        let store = StateStore::new(&dir);
        store.save(&PersistedState::default()).unwrap();
        assert!(dir.join(STATE_FILE).exists());
        assert!(!dir.join("raft_state.json.tmp").exists());
    }

    #[test]
    fn state_file_uses_wire_field_names() {
        let dir = temp_dir("storage-fields");
        let store = StateStore::new(&dir);
        store
            .save(&PersistedState {
                current_term: 1,
                voted_for: String::new(),
                log: vec![],
            })
            .unwrap();
        let raw = fs::read_to_string(dir.join(STATE_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["current_term"], 1);
        assert_eq!(value["voted_for"], "");
        assert!(value["log"].as_array().unwrap().is_empty());
    }
}
