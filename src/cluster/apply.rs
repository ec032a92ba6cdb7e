use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::NodeError;

/// Invoked once per committed log entry, in commit order, outside the
/// consensus lock. Errors are the callback's own problem; the entry counts
/// as applied regardless.
pub type ApplyFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// The default state machine: materializes committed commands into the
/// local model directory.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating model directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.dir.join(format!("{model_id}.bin"))
    }

    /// Wraps the store as an apply callback. Apply failures are logged and
    /// swallowed; a replay mechanism does not exist.
    pub fn callback(self) -> ApplyFn {
        Arc::new(move |command| {
            if let Err(e) = self.apply(command) {
                warn!("apply failed for command {}: {:#}", command, e);
            }
        })
    }

    pub fn apply(&self, command: &Value) -> Result<()> {
        match command.get("action").and_then(Value::as_str) {
            Some("STORE_FILE") => self.store_file(command),
            Some("MODEL_TRAINED") => {
                let model_id = command.get("model_id").and_then(Value::as_str).unwrap_or("?");
                let model_path = command.get("model_path").and_then(Value::as_str).unwrap_or("?");
                info!("model {} trained at {}", model_id, model_path);
                Ok(())
            }
            other => {
                debug!("ignoring command with action {:?}", other);
                Ok(())
            }
        }
    }

    fn store_file(&self, command: &Value) -> Result<()> {
        let filename = command
            .get("filename")
            .and_then(Value::as_str)
            .context("STORE_FILE without filename")?;
        if !is_bare_filename(filename) {
            return Err(NodeError::InvalidFilename(filename.to_string()).into());
        }
        let data = command
            .get("data_b64")
            .and_then(Value::as_str)
            .context("STORE_FILE without data_b64")?;
        let bytes = BASE64
            .decode(data)
            .with_context(|| format!("decoding payload for {filename}"))?;
        self.write_atomic(filename, &bytes)
    }

    /// Writes through a temporary sibling and renames over the target, so
    /// readers never observe a partially written artifact. Replaying the
    /// same entry overwrites with identical bytes.
    pub fn write_atomic(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let target = self.dir.join(filename);
        let tmp = self.dir.join(format!("{filename}.tmp"));
        fs::write(&tmp, bytes)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &target)
            .with_context(|| format!("replacing {}", target.display()))?;
        info!("stored model file {} ({} bytes)", filename, bytes.len());
        Ok(())
    }

    /// Model ids present locally: the file stems of `.bin` artifacts.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut models = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".bin") {
                models.push(stem.to_string());
            }
        }
        models.sort();
        Ok(models)
    }
}

fn is_bare_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}
