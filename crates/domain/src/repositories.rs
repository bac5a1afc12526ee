use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::*;
use crate::ObshellResult;

/// 创建 Dag 的完整计划, 由模板和上下文生成, 在一个事务内落库
#[derive(Debug, Clone)]
pub struct DagPlan {
    pub name: String,
    pub dag_type: DagType,
    pub maintenance_type: MaintenanceType,
    pub executor: AgentInfo,
    pub context: TaskContext,
    pub nodes: Vec<NodePlan>,
}

#[derive(Debug, Clone)]
pub struct NodePlan {
    pub name: String,
    pub capabilities: TaskCapabilities,
    pub executors: Vec<AgentInfo>,
    pub sub_tasks: Vec<SubTaskPlan>,
}

#[derive(Debug, Clone)]
pub struct SubTaskPlan {
    pub name: String,
    pub struct_name: String,
    pub executor: AgentInfo,
}

/// 集群调度器在执行代理上创建镜像子任务时使用
#[derive(Debug, Clone)]
pub struct MirrorPlan {
    pub name: String,
    pub struct_name: String,
    pub executor: AgentInfo,
    pub operator: Operator,
    pub execute_times: i32,
    pub context: TaskContext,
}

/// 同一事务内批量修改某个节点下子任务的状态
#[derive(Debug, Clone)]
pub struct SubTaskReset {
    pub node_id: i64,
    pub from_states: Vec<State>,
    pub to_state: State,
    pub operator: Operator,
    /// `Some(true)` 只匹配执行过的子任务, `Some(false)` 只匹配从未执行过的
    pub executed: Option<bool>,
}

impl SubTaskReset {
    pub fn new(node_id: i64, from_states: &[State], to_state: State, operator: Operator) -> Self {
        Self {
            node_id,
            from_states: from_states.to_vec(),
            to_state,
            operator,
            executed: None,
        }
    }

    pub fn executed(mut self, executed: bool) -> Self {
        self.executed = Some(executed);
        self
    }
}

/// Dag 状态迁移
///
/// 以 (state, stage, operator) 作为条件更新, 条件不满足时返回
/// `NoAffectedRows`, 调用方重新读取后再决定。
#[derive(Debug, Clone)]
pub struct DagTransition {
    pub dag_id: i64,
    pub expected_state: State,
    pub expected_stage: i32,
    pub expected_operator: Operator,
    pub state: State,
    pub stage: i32,
    pub operator: Operator,
    pub is_finished: bool,
    pub context: Option<TaskContext>,
    pub node_states: Vec<(i64, State)>,
    pub sub_task_resets: Vec<SubTaskReset>,
    /// 把 `context` 下发给该节点中尚未执行的子任务
    pub propagate_context_to: Option<i64>,
    /// 重新打开已结束的运维 Dag 时需要再次检查运维锁
    pub recheck_maintenance: Option<MaintenanceType>,
}

impl DagTransition {
    pub fn from_dag(dag: &Dag) -> Self {
        Self {
            dag_id: dag.id,
            expected_state: dag.state,
            expected_stage: dag.stage,
            expected_operator: dag.operator,
            state: dag.state,
            stage: dag.stage,
            operator: dag.operator,
            is_finished: dag.is_finished,
            context: None,
            node_states: Vec::new(),
            sub_task_resets: Vec::new(),
            propagate_context_to: None,
            recheck_maintenance: None,
        }
    }

    pub fn state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    pub fn stage(mut self, stage: i32) -> Self {
        self.stage = stage;
        self
    }

    pub fn operator(mut self, operator: Operator) -> Self {
        self.operator = operator;
        self
    }

    pub fn finished(mut self, is_finished: bool) -> Self {
        self.is_finished = is_finished;
        self
    }

    pub fn context(mut self, context: TaskContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn node_state(mut self, node_id: i64, state: State) -> Self {
        self.node_states.push((node_id, state));
        self
    }

    pub fn reset_sub_tasks(mut self, reset: SubTaskReset) -> Self {
        self.sub_task_resets.push(reset);
        self
    }

    pub fn propagate_context_to(mut self, node_id: i64) -> Self {
        self.propagate_context_to = Some(node_id);
        self
    }

    pub fn recheck_maintenance(mut self, maintenance_type: MaintenanceType) -> Self {
        if maintenance_type.is_maintenance() {
            self.recheck_maintenance = Some(maintenance_type);
        }
        self
    }
}

/// 镜像子任务推送回集群元数据库的状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskSnapshot {
    pub state: State,
    /// 镜像上的操作, 只用于判断快照是否过期, 集群子任务的操作由维护者写入
    pub operator: Operator,
    pub execute_times: i32,
    pub context: TaskContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Dag / Node / SubTask 元数据库
///
/// 本地元数据库和集群元数据库实现同一个接口。所有状态迁移都是条件更新,
/// 这是引擎唯一的并发控制手段。
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_dag(&self, plan: &DagPlan) -> ObshellResult<Dag>;
    async fn get_dag(&self, id: i64) -> ObshellResult<Option<Dag>>;
    async fn list_unfinished_dags(&self) -> ObshellResult<Vec<Dag>>;
    /// `None` 表示任意运维类型
    async fn find_maintenance_dag(
        &self,
        maintenance_type: Option<MaintenanceType>,
    ) -> ObshellResult<Option<Dag>>;
    async fn transition_dag(&self, transition: &DagTransition) -> ObshellResult<()>;

    async fn get_node(&self, id: i64) -> ObshellResult<Option<Node>>;
    async fn list_nodes(&self, dag_id: i64) -> ObshellResult<Vec<Node>>;
    async fn get_node_by_stage(&self, dag_id: i64, stage: i32) -> ObshellResult<Option<Node>>;

    async fn get_sub_task(&self, id: i64) -> ObshellResult<Option<SubTask>>;
    async fn list_sub_tasks(&self, node_id: i64) -> ObshellResult<Vec<SubTask>>;
    /// 指定执行代理上处于 READY / RUNNING 的子任务
    async fn list_active_sub_tasks(&self, executor: &AgentInfo) -> ObshellResult<Vec<SubTask>>;
    async fn list_pending_mirrors(&self) -> ObshellResult<Vec<SubTask>>;

    /// `state != READY ∧ execute_times == expected` 时置为 READY 并递增执行次数
    async fn ready_sub_task(
        &self,
        id: i64,
        expected_execute_times: i32,
        operator: Operator,
        executor: &AgentInfo,
        context: &TaskContext,
    ) -> ObshellResult<()>;
    /// `state == READY ∧ execute_times == expected` 时置为 RUNNING
    async fn start_sub_task(&self, id: i64, execute_times: i32) -> ObshellResult<()>;
    /// `state == RUNNING ∧ execute_times == expected` 时写入终态、上下文和剩余日志
    async fn finish_sub_task(
        &self,
        id: i64,
        execute_times: i32,
        state: State,
        context: &TaskContext,
        logs: &[String],
    ) -> ObshellResult<()>;
    /// 不改变执行次数的条件状态迁移
    async fn transit_sub_task(
        &self,
        id: i64,
        from: &[State],
        to: State,
        operator: Operator,
    ) -> ObshellResult<()>;
    /// 给活跃的子任务打上取消标记, 返回是否有更新
    async fn cancel_sub_task(&self, id: i64) -> ObshellResult<bool>;
    /// 同步器把镜像状态写回集群子任务, 执行次数不回退
    async fn apply_snapshot(&self, id: i64, snapshot: &SubTaskSnapshot) -> ObshellResult<bool>;

    async fn append_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: i32,
        lines: &[String],
    ) -> ObshellResult<()>;
    async fn replace_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: i32,
        lines: &[String],
    ) -> ObshellResult<()>;
    async fn list_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: Option<i32>,
    ) -> ObshellResult<Vec<SubTaskLog>>;

    /// 创建镜像子任务和映射; 映射已存在时返回已有的镜像
    async fn create_mirror(&self, remote_task_id: i64, plan: &MirrorPlan)
        -> ObshellResult<SubTask>;
    async fn get_mapping_by_remote(&self, remote_task_id: i64)
        -> ObshellResult<Option<TaskMapping>>;
    async fn list_unsynced_mappings(&self) -> ObshellResult<Vec<TaskMapping>>;
    /// `is_sync == false ∧ sync_version == expected` 时置为已同步
    async fn ack_mapping(&self, mapping_id: i64, sync_version: i64) -> ObshellResult<bool>;
    /// 已结束的镜像重新进入 PENDING, 用于集群侧重试和回滚
    async fn reset_mirror(
        &self,
        local_task_id: i64,
        operator: Operator,
        context: &TaskContext,
    ) -> ObshellResult<()>;
}

/// 本代理身份 (`ocs_identity`, 单行)
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn load(&self) -> ObshellResult<Option<AgentIdentity>>;
    async fn save(&self, identity: &AgentIdentity) -> ObshellResult<()>;
    async fn update_identity(
        &self,
        identity: Identity,
        master: Option<&AgentInfo>,
    ) -> ObshellResult<()>;
}

/// 初始化前的成员表 (`all_agent`)
#[async_trait]
pub trait RosterRepository: Send + Sync {
    async fn list(&self) -> ObshellResult<Vec<RosterEntry>>;
    async fn get(&self, agent: &AgentInfo) -> ObshellResult<Option<RosterEntry>>;
    async fn upsert(&self, entry: &RosterEntry) -> ObshellResult<()>;
    async fn remove(&self, agent: &AgentInfo) -> ObshellResult<bool>;
}

/// 集群成员与维护者心跳 (`ocs_info`)
#[async_trait]
pub trait ClusterAgentRepository: Send + Sync {
    async fn list(&self) -> ObshellResult<Vec<ClusterAgent>>;
    async fn get(&self, agent: &AgentInfo) -> ObshellResult<Option<ClusterAgent>>;
    /// 注册成员, 已存在时只更新基本信息, 保留心跳
    async fn register(&self, agent: &ClusterAgent) -> ObshellResult<()>;
    async fn remove(&self, agent: &AgentInfo) -> ObshellResult<bool>;
    /// 当且仅当没有其他成员在 `window_ms` 内写过心跳时, 把自己的心跳更新为 `now_ms`
    async fn try_heartbeat(
        &self,
        agent: &AgentInfo,
        now_ms: i64,
        window_ms: i64,
    ) -> ObshellResult<bool>;
    async fn current_maintainer(
        &self,
        now_ms: i64,
        window_ms: i64,
    ) -> ObshellResult<Option<AgentInfo>>;
    async fn release_heartbeat(&self, agent: &AgentInfo) -> ObshellResult<()>;
}

/// 代理级配置覆盖 (`ob_config`)
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn get(&self, name: &str) -> ObshellResult<Option<String>>;
    async fn set(&self, name: &str, value: &str) -> ObshellResult<()>;
    async fn list(&self) -> ObshellResult<Vec<(String, String)>>;
    async fn delete(&self, name: &str) -> ObshellResult<bool>;
}
