use chrono::{DateTime, Utc};
use obshell_domain::entities::{
    AgentInfo, Dag, DagType, GenericId, MaintenanceType, Node, Operator, State, SubTask,
    TaskCapabilities, TaskScope,
};
use serde::{Deserialize, Serialize};

/// 对外展示的 Dag, `show_details` 时带上节点和子任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDetail {
    pub generic_id: GenericId,
    pub dag_id: i64,
    pub name: String,
    pub dag_type: DagType,
    pub stage: i32,
    pub max_stage: i32,
    pub state: State,
    pub operator: Operator,
    pub maintenance_type: MaintenanceType,
    pub is_finished: bool,
    pub executor: AgentInfo,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDetail>,
}

impl DagDetail {
    pub fn new(dag: &Dag) -> Self {
        Self {
            generic_id: dag.generic_id(&dag.executor),
            dag_id: dag.id,
            name: dag.name.clone(),
            dag_type: dag.dag_type,
            stage: dag.stage,
            max_stage: dag.max_stage,
            state: dag.state,
            operator: dag.operator,
            maintenance_type: dag.maintenance_type,
            is_finished: dag.is_finished,
            executor: dag.executor.clone(),
            start_time: dag.start_time,
            end_time: dag.end_time,
            nodes: Vec::new(),
        }
    }

    /// 正在等待人工操作的失败 Dag
    pub fn is_awaiting_operator(&self) -> bool {
        self.state == State::Failed && !self.is_finished
    }

    pub fn current_node(&self) -> Option<&NodeDetail> {
        self.nodes.iter().find(|n| n.stage == self.stage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    pub generic_id: GenericId,
    pub node_id: i64,
    pub name: String,
    pub stage: i32,
    pub state: State,
    pub operator: Operator,
    pub capabilities: TaskCapabilities,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_tasks: Vec<SubTaskDetail>,
}

impl NodeDetail {
    pub fn new(scope: TaskScope, owner: &AgentInfo, node: &Node) -> Self {
        Self {
            generic_id: GenericId::new(scope, owner.clone(), node.id),
            node_id: node.id,
            name: node.name.clone(),
            stage: node.stage,
            state: node.state,
            operator: node.operator,
            capabilities: node.capabilities,
            start_time: node.start_time,
            end_time: node.end_time,
            sub_tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskDetail {
    pub generic_id: GenericId,
    pub sub_task_id: i64,
    pub name: String,
    pub struct_name: String,
    pub executor: AgentInfo,
    pub execute_times: i32,
    pub state: State,
    pub operator: Operator,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 最近一次执行的日志
    #[serde(default)]
    pub logs: Vec<String>,
}

impl SubTaskDetail {
    pub fn new(scope: TaskScope, owner: &AgentInfo, sub_task: &SubTask, logs: Vec<String>) -> Self {
        Self {
            generic_id: GenericId::new(scope, owner.clone(), sub_task.id),
            sub_task_id: sub_task.id,
            name: sub_task.name.clone(),
            struct_name: sub_task.struct_name.clone(),
            executor: sub_task.executor.clone(),
            execute_times: sub_task.execute_times,
            state: sub_task.state,
            operator: sub_task.operator,
            start_time: sub_task.start_time,
            end_time: sub_task.end_time,
            logs,
        }
    }

    pub fn last_log(&self) -> Option<&str> {
        self.logs.last().map(String::as_str)
    }
}
