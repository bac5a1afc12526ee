use axum::{extract::State, http::Uri, response::IntoResponse};
use chrono::Utc;
use obshell_core::constants::{GIT_BRANCH, GIT_COMMIT};

use crate::{
    error::{ApiError, ApiResult},
    models::{AgentStatus, GitInfo, SecretInfo, ServiceStatus, TimeInfo},
    response::success,
    routes::AppState,
};

pub async fn time() -> ApiResult<impl IntoResponse> {
    let now = Utc::now();
    Ok(success(TimeInfo {
        time: now,
        timestamp_ms: now.timestamp_millis(),
    }))
}

pub async fn info(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let current = state.identity.current().await;
    Ok(success(AgentStatus {
        agent: current.agent,
        zone: current.zone,
        version: current.version,
        identity: current.identity,
        master: current.master,
        pid: current.pid,
        start_time: current.start_time,
    }))
}

pub async fn git_info() -> ApiResult<impl IntoResponse> {
    Ok(success(GitInfo {
        git_commit: GIT_COMMIT.to_string(),
        git_branch: GIT_BRANCH.to_string(),
    }))
}

/// 服务状态, 非维护者也能回答当前维护者是谁
pub async fn status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let identity = state.identity.identity().await;
    let (is_maintainer, maintainer) = match &state.maintainer {
        Some(coordinator) => (coordinator.is_maintainer(), coordinator.maintainer().await?),
        None => (false, None),
    };
    Ok(success(ServiceStatus {
        state: "RUNNING".to_string(),
        identity,
        is_maintainer,
        maintainer,
        pid: std::process::id(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    }))
}

/// 本代理公钥, 调用方用它封装安全头
pub async fn secret(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(SecretInfo {
        public_key: state.keys.public_key_pem().to_string(),
    }))
}

pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
