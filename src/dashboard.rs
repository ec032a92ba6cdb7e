use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::cluster::apply::ModelStore;
use crate::cluster::consensus::ConsensusNode;

#[derive(Clone)]
struct DashboardState {
    node: ConsensusNode,
    models: ModelStore,
    started_at: DateTime<Utc>,
}

pub fn router(node: ConsensusNode, models: ModelStore) -> Router {
    let state = DashboardState { node, models, started_at: Utc::now() };
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn api_status(State(state): State<DashboardState>) -> impl IntoResponse {
    let status = state.node.status().await;
    let models = state.models.list().unwrap_or_default();
    Json(json!({
        "node_id": status.node_id,
        "role": status.role.to_string(),
        "current_term": status.current_term,
        "leader": status.leader,
        "log_len": status.log_len,
        "commit_index": status.commit_index,
        "last_applied": status.last_applied,
        "peers": status.peer_count,
        "models": models,
        "started_at": state.started_at.to_rfc3339(),
    }))
}

async fn index(State(state): State<DashboardState>) -> Html<String> {
    let status = state.node.status().await;
    let models = state.models.list().unwrap_or_default();
    let leader = status
        .leader
        .map(|(host, port)| format!("{host}:{port}"))
        .unwrap_or_else(|| "unknown".to_string());
    let model_rows = if models.is_empty() {
        "<li class=\"empty\">no models yet</li>".to_string()
    } else {
        models
            .iter()
            .map(|m| format!("<li>{m}</li>"))
            .collect::<Vec<_>>()
            .join("\n        ")
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>modelherd - {node_id}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 720px; margin: 40px auto; padding: 0 20px; color: #333; }}
        h1 {{ margin-bottom: 0; }}
        .subtitle {{ color: #888; margin-top: 4px; }}
        .card {{ background: #f5f5f5; border-radius: 8px; padding: 20px; margin: 20px 0; }}
        .role {{ font-weight: bold; text-transform: uppercase; }}
        .role.leader {{ color: #27ae60; }}
        .role.follower {{ color: #2980b9; }}
        .role.candidate {{ color: #e67e22; }}
        table {{ border-collapse: collapse; width: 100%; }}
        td {{ padding: 6px 10px; border-bottom: 1px solid #e0e0e0; }}
        td:first-child {{ color: #777; width: 40%; }}
        ul {{ margin: 8px 0; }}
        .empty {{ color: #aaa; }}
    </style>
</head>
<body>
    <h1>modelherd</h1>
    <div class="subtitle">replicated model training cluster</div>
    <div class="card">
        <table>
            <tr><td>Node</td><td>{node_id}</td></tr>
            <tr><td>Role</td><td><span class="role {role}">{role}</span></td></tr>
            <tr><td>Term</td><td>{term}</td></tr>
            <tr><td>Leader</td><td>{leader}</td></tr>
            <tr><td>Log entries</td><td>{log_len}</td></tr>
            <tr><td>Committed / applied</td><td>{commit} / {applied}</td></tr>
            <tr><td>Peers</td><td>{peers}</td></tr>
            <tr><td>Up since</td><td>{started}</td></tr>
        </table>
    </div>
    <div class="card">
        <strong>Models</strong>
        <ul>
        {model_rows}
        </ul>
    </div>
    <p>API: <a href="/api/status">/api/status</a> | Health: <a href="/health">/health</a></p>
</body>
</html>"#,
        node_id = status.node_id,
        role = status.role,
        term = status.current_term,
        leader = leader,
        log_len = status.log_len,
        commit = status.commit_index,
        applied = status.last_applied,
        peers = status.peer_count,
        started = state.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        model_rows = model_rows,
    ))
}
