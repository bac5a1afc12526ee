use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use obshell_core::config::ApiConfig;
use obshell_dispatcher::{
    DagService, IdentityService, MaintainerCoordinator, MembershipService, TaskMappingService,
};
use obshell_domain::entities::TaskScope;

use crate::client::AgentClient;
use crate::handlers::{agent, rpc, system, task};
use crate::secure::KeyStore;

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub started_at: DateTime<Utc>,
    pub identity: Arc<IdentityService>,
    pub keys: Arc<KeyStore>,
    pub membership: Arc<MembershipService>,
    pub local_dags: Arc<DagService>,
    pub cluster_dags: Arc<DagService>,
    pub mapping: Arc<TaskMappingService>,
    /// 只有能访问集群元数据库的代理才会参与维护者选举
    pub maintainer: Option<Arc<MaintainerCoordinator>>,
    pub client: Arc<AgentClient>,
}

impl AppState {
    pub fn dags(&self, scope: TaskScope) -> &Arc<DagService> {
        match scope {
            TaskScope::Local => &self.local_dags,
            TaskScope::Cluster => &self.cluster_dags,
        }
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .nest("/rpc/v1", rpc_routes())
        .fallback(system::not_found)
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // 公开接口
        .route("/time", get(system::time))
        .route("/info", get(system::info))
        .route("/git-info", get(system::git_info))
        .route("/status", get(system::status))
        .route("/secret", get(system::secret))
        // 身份与成员
        .route("/agent", get(agent::get_agent))
        .route("/agents", get(agent::list_agents))
        .route("/agent/join", post(agent::join))
        .route("/agent/remove", post(agent::remove))
        .route("/ob/init", post(agent::init))
        .route("/ob/scale_out", post(agent::scale_out))
        .route("/ob/scale_in", post(agent::scale_in))
        // 任务
        .route(
            "/task/dag/{id}",
            get(task::get_dag).post(task::operate_dag),
        )
        .route(
            "/task/node/{id}",
            get(task::get_node).post(task::operate_node),
        )
        .route("/task/sub_task/{id}", get(task::get_sub_task))
        .route("/task/dag/unfinish", get(task::unfinished_dags))
        .route("/task/dag/ob/unfinish", get(task::unfinished_cluster_dags))
        .route("/task/dag/agent/unfinish", get(task::unfinished_local_dags))
        .route("/task/dag/maintain/ob", get(task::cluster_maintenance))
        .route("/task/dag/maintain/agent", get(task::local_maintenance))
        .route("/task/dag/maintain/agents", get(task::any_cluster_maintenance))
}

fn rpc_routes() -> Router<AppState> {
    Router::new()
        .route("/agent", get(agent::get_agent))
        .route("/agent/join", post(rpc::accept_follower))
        .route("/agent/remove", post(rpc::remove_follower))
        .route("/agent/promote", post(rpc::change_identity))
        .route("/agent/demote", post(rpc::change_identity))
        .route("/task/sub_task", post(rpc::accept_sub_task))
        .route("/task/mapping/unsynced", get(rpc::unsynced_mappings))
        .route("/task/mapping/ack", post(rpc::ack_mappings))
}
