use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    AgentInfo, DagType, GenericId, MaintenanceType, Operator, State, TaskCapabilities,
    TaskContext, TaskScope,
};

/// 工作流实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub id: i64,
    pub name: String,
    pub dag_type: DagType,
    /// 当前阶段, 从1开始; 尚未调度时为0
    pub stage: i32,
    pub max_stage: i32,
    pub state: State,
    pub operator: Operator,
    pub executor: AgentInfo,
    pub maintenance_type: MaintenanceType,
    pub is_finished: bool,
    pub context: TaskContext,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub gmt_modify: DateTime<Utc>,
}

impl Dag {
    pub fn is_maintenance(&self) -> bool {
        self.maintenance_type.is_maintenance()
    }

    pub fn scope(&self) -> TaskScope {
        self.dag_type.scope()
    }

    /// `owner` 为持有该元数据的代理: 本地 Dag 是执行者本身, 集群 Dag 是请求处理者
    pub fn generic_id(&self, owner: &AgentInfo) -> GenericId {
        GenericId::new(self.scope(), owner.clone(), self.id)
    }

    pub fn is_rollback(&self) -> bool {
        self.operator == Operator::Rollback
    }
}

/// Dag 的一个阶段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub dag_id: i64,
    pub name: String,
    pub stage: i32,
    pub state: State,
    pub operator: Operator,
    pub capabilities: TaskCapabilities,
    /// 为空表示单代理执行
    pub executors: Vec<AgentInfo>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub gmt_modify: DateTime<Utc>,
}

/// 一个任务在一个代理上的执行记录
///
/// 镜像子任务 (由集群调度器派发到本代理) 的 `node_id` 为 0, 通过
/// [`TaskMapping`] 与集群元数据库中的子任务关联。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: i64,
    pub node_id: i64,
    pub name: String,
    pub struct_name: String,
    pub executor: AgentInfo,
    pub execute_times: i32,
    pub state: State,
    pub operator: Operator,
    pub context: TaskContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub gmt_modify: DateTime<Utc>,
}

impl SubTask {
    pub fn is_mirror(&self) -> bool {
        self.node_id == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskLog {
    pub id: i64,
    pub sub_task_id: i64,
    pub execute_times: i32,
    pub log_content: String,
    pub created_at: DateTime<Utc>,
}

/// 集群子任务到本地镜像的映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMapping {
    pub id: i64,
    pub remote_task_id: i64,
    pub local_task_id: i64,
    pub execute_times: i32,
    /// 镜像状态已推送到集群元数据库
    pub is_sync: bool,
    /// 每次置为未同步时递增, 确认同步时用作条件
    pub sync_version: i64,
    pub gmt_modify: DateTime<Utc>,
}
