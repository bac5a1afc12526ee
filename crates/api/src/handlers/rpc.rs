//! 代理之间的内部调用

use axum::{extract::State, response::IntoResponse};
use obshell_domain::ports::{IdentityChange, JoinRequest, MappingAck, RemoteSubTask};

use super::ApiJson;
use crate::{error::ApiResult, models::AgentTarget, response::success, routes::AppState};

pub async fn accept_follower(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<JoinRequest>,
) -> ApiResult<impl IntoResponse> {
    state.membership.accept_follower(&request).await?;
    Ok(success(()))
}

pub async fn remove_follower(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<AgentTarget>,
) -> ApiResult<impl IntoResponse> {
    state.membership.remove_follower(&request.agent).await?;
    Ok(success(()))
}

pub async fn change_identity(
    State(state): State<AppState>,
    ApiJson(change): ApiJson<IdentityChange>,
) -> ApiResult<impl IntoResponse> {
    state.membership.apply_identity_change(&change).await?;
    Ok(success(()))
}

pub async fn accept_sub_task(
    State(state): State<AppState>,
    ApiJson(task): ApiJson<RemoteSubTask>,
) -> ApiResult<impl IntoResponse> {
    state.mapping.accept(&task).await?;
    Ok(success(()))
}

pub async fn unsynced_mappings(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.mapping.unsynced().await?))
}

pub async fn ack_mappings(
    State(state): State<AppState>,
    ApiJson(acks): ApiJson<Vec<MappingAck>>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.mapping.ack(&acks).await?))
}
