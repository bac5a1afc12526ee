//! 身份与成员接口, 对应的身份变更以 Dag 形式异步执行

use axum::{extract::State, response::IntoResponse};
use obshell_dispatcher::DagDetail;

use super::ApiJson;
use crate::{
    error::ApiResult,
    models::{AgentTarget, JoinMasterRequest},
    response::success,
    routes::AppState,
};

pub async fn get_agent(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.identity.instance().await))
}

pub async fn list_agents(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.membership.members().await?))
}

pub async fn join(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<JoinMasterRequest>,
) -> ApiResult<impl IntoResponse> {
    let dag = state.membership.join(request.master).await?;
    Ok(success(DagDetail::new(&dag)))
}

pub async fn remove(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<AgentTarget>,
) -> ApiResult<impl IntoResponse> {
    let dag = state.membership.remove(request.agent).await?;
    Ok(success(DagDetail::new(&dag)))
}

pub async fn init(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let dag = state.membership.init().await?;
    Ok(success(DagDetail::new(&dag)))
}

pub async fn scale_out(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<AgentTarget>,
) -> ApiResult<impl IntoResponse> {
    let dag = state.membership.scale_out(request.agent).await?;
    Ok(success(DagDetail::new(&dag)))
}

pub async fn scale_in(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<AgentTarget>,
) -> ApiResult<impl IntoResponse> {
    let dag = state.membership.scale_in(request.agent).await?;
    Ok(success(DagDetail::new(&dag)))
}
