use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::apply::ModelStore;
use crate::cluster::consensus::ConsensusNode;
use crate::error::NodeError;
use crate::trainer::Trainer;

#[derive(Debug, Deserialize)]
#[serde(tag = "action")]
enum ClientRequest {
    #[serde(rename = "TRAIN")]
    Train { data: Vec<Vec<f64>> },
    #[serde(rename = "PREDICT")]
    Predict { model_id: String, input: Vec<f64> },
    #[serde(rename = "LIST_MODELS")]
    ListModels,
}

/// Serves the line-delimited JSON client protocol on the node's client
/// port: one request object per line, one response object per line.
#[derive(Clone)]
pub struct ClientServer {
    node: ConsensusNode,
    trainer: Trainer,
    models: ModelStore,
    staging_dir: PathBuf,
}

impl ClientServer {
    pub fn new(
        node: ConsensusNode,
        trainer: Trainer,
        models: ModelStore,
        staging_dir: PathBuf,
    ) -> Self {
        Self { node, trainer, models, staging_dir }
    }

    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("client connected from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_client(stream).await });
                }
                Err(e) => {
                    warn!("client accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch(&line).await;
            let mut payload = response.to_string();
            payload.push('\n');
            if write_half.write_all(payload.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch(&self, line: &str) -> Value {
        let request: ClientRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => return error_response(format!("bad request: {e}")),
        };
        match request {
            ClientRequest::Train { data } => self.handle_train(data).await,
            ClientRequest::Predict { model_id, input } => {
                self.handle_predict(&model_id, &input).await
            }
            ClientRequest::ListModels => self.handle_list(),
        }
    }

    /// Writes are admitted only on the leader. Everyone else redirects the
    /// client to the leader's client endpoint, or reports that no leader is
    /// known yet.
    async fn handle_train(&self, data: Vec<Vec<f64>>) -> Value {
        if !self.node.is_leader().await {
            return match self.node.current_leader().await {
                Some((host, port)) => json!({"status": "REDIRECT", "leader": [host, port]}),
                None => error_response(NodeError::NoLeader.to_string()),
            };
        }
        match self.train_and_replicate(data).await {
            Ok(model_id) => json!({"status": "OK", "model_id": model_id}),
            Err(e) => {
                warn!("training request failed: {:#}", e);
                error_response(e.to_string())
            }
        }
    }

    async fn train_and_replicate(&self, data: Vec<Vec<f64>>) -> Result<String> {
        if data.is_empty() {
            bail!("empty training set");
        }
        let csv_path = self.stage_csv(&data)?;
        let artifact_path = self.staging_dir.join(format!("artifact-{}.bin", Uuid::new_v4()));
        let outcome = self.trainer.train(&csv_path, &artifact_path).await;
        if let Err(e) = std::fs::remove_file(&csv_path) {
            debug!("failed to remove staged csv: {}", e);
        }
        let model = outcome?;

        let bytes = std::fs::read(&model.model_path)
            .with_context(|| format!("reading artifact {}", model.model_path.display()))?;
        let _ = std::fs::remove_file(&artifact_path);

        // The artifact reaches followers through the log; the training
        // record alone moves no bytes.
        let filename = format!("{}.bin", model.model_id);
        let store = json!({
            "action": "STORE_FILE",
            "filename": filename,
            "data_b64": BASE64.encode(&bytes),
        });
        if !self.node.replicate(store).await {
            bail!("replication failed: no majority reachable");
        }

        let record = json!({
            "action": "MODEL_TRAINED",
            "model_id": model.model_id,
            "model_path": self.models.dir().join(&filename).display().to_string(),
        });
        if !self.node.replicate(record).await {
            warn!("training record for {} did not replicate", model.model_id);
        }

        info!("model {} trained and replicated", model.model_id);
        Ok(model.model_id)
    }

    /// Served from local state on any replica; reads do not go through the
    /// log.
    async fn handle_predict(&self, model_id: &str, input: &[f64]) -> Value {
        let path = self.models.model_path(model_id);
        if !path.exists() {
            return error_response(NodeError::ModelNotFound(model_id.to_string()).to_string());
        }
        match self.trainer.predict(&path, input).await {
            Ok(prediction) => {
                json!({"status": "OK", "model_id": model_id, "prediction": prediction})
            }
            Err(e) => error_response(e.to_string()),
        }
    }

    fn handle_list(&self) -> Value {
        match self.models.list() {
            Ok(models) => json!({"status": "OK", "models": models}),
            Err(e) => error_response(e.to_string()),
        }
    }

    fn stage_csv(&self, rows: &[Vec<f64>]) -> Result<PathBuf> {
        let path = self.staging_dir.join(format!("train-{}.csv", Uuid::new_v4()));
        let mut contents = String::new();
        for row in rows {
            let fields: Vec<String> = row.iter().map(f64::to_string).collect();
            contents.push_str(&fields.join(","));
            contents.push('\n');
        }
        std::fs::write(&path, contents)
            .with_context(|| format!("staging csv {}", path.display()))?;
        Ok(path)
    }
}

fn error_response(message: String) -> Value {
    json!({"status": "ERROR", "message": message})
}
