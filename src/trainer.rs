use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TrainerConfig;
use crate::error::NodeError;

/// What the training engine reports back on success.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainedModel {
    pub model_id: String,
    pub model_path: PathBuf,
}

/// Boundary to the opaque training engine. Training and prediction are
/// separate subprocess invocations; the engine communicates through the
/// filesystem (CSV in, artifact out) and stdout.
#[derive(Debug, Clone)]
pub struct Trainer {
    train_command: String,
    train_args: Vec<String>,
    predict_command: String,
    predict_args: Vec<String>,
}

impl Trainer {
    pub fn new(config: &TrainerConfig) -> Self {
        Self {
            train_command: config.train_command.clone(),
            train_args: config.train_args.clone(),
            predict_command: config.predict_command.clone(),
            predict_args: config.predict_args.clone(),
        }
    }

    /// Runs the training command with the staged CSV path and a scratch
    /// artifact path appended. The engine must write the artifact and
    /// print, as its last non-empty stdout line, a JSON object with
    /// `model_id` and `model_path`.
    pub async fn train(&self, csv_path: &Path, artifact_path: &Path) -> Result<TrainedModel> {
        debug!(
            "launching trainer: {} {:?} {} {}",
            self.train_command,
            self.train_args,
            csv_path.display(),
            artifact_path.display()
        );
        let output = Command::new(&self.train_command)
            .args(&self.train_args)
            .arg(csv_path)
            .arg(artifact_path)
            .output()
            .await
            .with_context(|| format!("launching trainer '{}'", self.train_command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(NodeError::Training(format!("exit {}: {}", output.status, stderr)).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = last_line(&stdout)
            .ok_or_else(|| NodeError::Training("trainer produced no output".to_string()))?;
        let model: TrainedModel = serde_json::from_str(line)
            .map_err(|e| NodeError::Training(format!("unparseable trainer output '{line}': {e}")))?;
        info!("trained model {} at {}", model.model_id, model.model_path.display());
        Ok(model)
    }

    /// Runs the prediction command with the model path and the JSON-encoded
    /// input vector appended; the last stdout line is the prediction (JSON
    /// if it parses, a bare string otherwise).
    pub async fn predict(&self, model_path: &Path, input: &[f64]) -> Result<Value> {
        let payload = serde_json::to_string(input)?;
        let output = Command::new(&self.predict_command)
            .args(&self.predict_args)
            .arg(model_path)
            .arg(&payload)
            .output()
            .await
            .with_context(|| format!("launching predictor '{}'", self.predict_command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(NodeError::Training(format!("exit {}: {}", output.status, stderr)).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = last_line(&stdout)
            .ok_or_else(|| NodeError::Training("predictor produced no output".to_string()))?;
        Ok(serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string())))
    }
}

fn last_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}
