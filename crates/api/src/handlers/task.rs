//! 任务查询与人工操作
//!
//! 路径中的id是 [`GenericId`]: 集群范围的任务直接读集群元数据库, 其他代理
//! 的本地任务转发给该代理处理。

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::Method,
    response::IntoResponse,
};
use obshell_core::constants::API_PREFIX;
use obshell_dispatcher::{DagDetail, NodeDetail, SubTaskDetail};
use obshell_domain::entities::{AgentInfo, GenericId, Identity, MaintenanceType, Operator, TaskScope};
use obshell_errors::ObshellError;
use serde::{de::DeserializeOwned, Serialize};

use super::ApiJson;
use crate::{
    error::{ApiError, ApiResult},
    models::{DetailQuery, OperatorRequest},
    response::success,
    routes::AppState,
    secure::ForwardType,
};

fn parse_id(raw: &str) -> ApiResult<GenericId> {
    Ok(raw.parse::<GenericId>()?)
}

fn detail_query(query: Result<Query<DetailQuery>, QueryRejection>) -> ApiResult<DetailQuery> {
    query
        .map(|Query(q)| q)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// 归属其他代理的本地任务
async fn remote_owner(state: &AppState, id: &GenericId) -> Option<AgentInfo> {
    if id.scope == TaskScope::Local && id.agent != state.identity.agent().await {
        Some(id.agent.clone())
    } else {
        None
    }
}

async fn relay<B, T>(
    state: &AppState,
    owner: &AgentInfo,
    method: Method,
    uri: String,
    body: Option<&B>,
) -> ApiResult<T>
where
    B: Serialize,
    T: DeserializeOwned,
{
    state
        .client
        .request(owner, method, &uri, body, ForwardType::ManualForward)
        .await
        .map_err(|e| match e {
            ObshellError::Network(_) | ObshellError::Timeout(_) => ApiError::Forward(e.to_string()),
            other => ApiError::Obshell(other),
        })
}

pub async fn get_dag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<DetailQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let query = detail_query(query)?;
    let detail: DagDetail = match remote_owner(&state, &id).await {
        Some(owner) => {
            let uri = format!(
                "{API_PREFIX}/task/dag/{id}?show_details={}",
                query.show_details
            );
            relay::<(), _>(&state, &owner, Method::GET, uri, None).await?
        }
        None => {
            state
                .dags(id.scope)
                .dag_detail(id.id, query.show_details)
                .await?
        }
    };
    Ok(success(detail))
}

pub async fn operate_dag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<OperatorRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let operator = Operator::parse_request(&request.operator)?;
    let detail: DagDetail = match remote_owner(&state, &id).await {
        Some(owner) => {
            let uri = format!("{API_PREFIX}/task/dag/{id}");
            relay(&state, &owner, Method::POST, uri, Some(&request)).await?
        }
        None => {
            let dag = state.dags(id.scope).operate(id.id, operator).await?;
            DagDetail::new(&dag)
        }
    };
    Ok(success(detail))
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<DetailQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let query = detail_query(query)?;
    let detail: NodeDetail = match remote_owner(&state, &id).await {
        Some(owner) => {
            let uri = format!(
                "{API_PREFIX}/task/node/{id}?show_details={}",
                query.show_details
            );
            relay::<(), _>(&state, &owner, Method::GET, uri, None).await?
        }
        None => {
            state
                .dags(id.scope)
                .node_detail(id.id, query.show_details)
                .await?
        }
    };
    Ok(success(detail))
}

/// 节点上只支持 PASS
pub async fn operate_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<OperatorRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let operator = Operator::parse_request(&request.operator)?;
    if operator != Operator::Pass {
        return Err(ObshellError::operator_not_supported(format!(
            "节点不支持操作 {operator}"
        ))
        .into());
    }
    let detail: DagDetail = match remote_owner(&state, &id).await {
        Some(owner) => {
            let uri = format!("{API_PREFIX}/task/node/{id}");
            relay(&state, &owner, Method::POST, uri, Some(&request)).await?
        }
        None => {
            let dag = state.dags(id.scope).pass_node(id.id).await?;
            DagDetail::new(&dag)
        }
    };
    Ok(success(detail))
}

pub async fn get_sub_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let detail: SubTaskDetail = match remote_owner(&state, &id).await {
        Some(owner) => {
            let uri = format!("{API_PREFIX}/task/sub_task/{id}");
            relay::<(), _>(&state, &owner, Method::GET, uri, None).await?
        }
        None => state.dags(id.scope).sub_task_detail(id.id).await?,
    };
    Ok(success(detail))
}

/// 集群任务只对集群成员可见
async fn in_cluster(state: &AppState) -> bool {
    matches!(
        state.identity.identity().await,
        Identity::ClusterAgent | Identity::TakeOverMaster
    )
}

pub async fn unfinished_dags(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut dags = state.local_dags.list_unfinished().await?;
    if in_cluster(&state).await {
        dags.extend(state.cluster_dags.list_unfinished().await?);
    }
    Ok(success(dags))
}

pub async fn unfinished_cluster_dags(
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let dags = if in_cluster(&state).await {
        state.cluster_dags.list_unfinished().await?
    } else {
        Vec::new()
    };
    Ok(success(dags))
}

pub async fn unfinished_local_dags(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.local_dags.list_unfinished().await?))
}

pub async fn cluster_maintenance(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(
        state
            .cluster_dags
            .find_maintenance(Some(MaintenanceType::Global))
            .await?,
    ))
}

pub async fn local_maintenance(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.local_dags.find_maintenance(None).await?))
}

pub async fn any_cluster_maintenance(
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.cluster_dags.find_maintenance(None).await?))
}
