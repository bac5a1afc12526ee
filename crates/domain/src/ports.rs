//! 代理之间的出站调用接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::*;
use crate::ObshellResult;

/// 集群调度器派发给执行代理的子任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSubTask {
    /// 集群元数据库中的子任务id
    pub remote_task_id: i64,
    pub name: String,
    pub struct_name: String,
    pub state: State,
    pub operator: Operator,
    pub execute_times: i32,
    pub context: TaskContext,
}

/// 执行代理上尚未同步的镜像状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSnapshot {
    pub mapping_id: i64,
    pub sync_version: i64,
    pub remote_task_id: i64,
    pub state: State,
    pub operator: Operator,
    pub execute_times: i32,
    pub context: TaskContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 最近一次执行的日志
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingAck {
    pub mapping_id: i64,
    pub sync_version: i64,
}

#[async_trait]
pub trait RemoteTaskClient: Send + Sync {
    /// 幂等: 重复派发同一子任务只会创建一个镜像
    async fn dispatch_sub_task(&self, agent: &AgentInfo, task: &RemoteSubTask)
        -> ObshellResult<()>;
    async fn fetch_unsynced(&self, agent: &AgentInfo) -> ObshellResult<Vec<MirrorSnapshot>>;
    async fn ack_synced(&self, agent: &AgentInfo, acks: &[MappingAck]) -> ObshellResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub agent: AgentInstance,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityChange {
    pub identity: Identity,
    pub master: Option<AgentInfo>,
    /// 扩容时由维护者分配的令牌
    #[serde(default)]
    pub token: Option<String>,
}

#[async_trait]
pub trait AgentRpcClient: Send + Sync {
    async fn get_agent(&self, agent: &AgentInfo) -> ObshellResult<AgentInstance>;
    /// 跟随者请求加入主节点的成员表
    async fn join_master(&self, master: &AgentInfo, request: &JoinRequest) -> ObshellResult<()>;
    async fn leave_master(&self, master: &AgentInfo, follower: &AgentInfo) -> ObshellResult<()>;
    async fn change_identity(&self, agent: &AgentInfo, change: &IdentityChange)
        -> ObshellResult<()>;
}
