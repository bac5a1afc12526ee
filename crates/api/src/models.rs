//! 请求和响应的数据结构, 服务端处理器和客户端共用

use chrono::{DateTime, Utc};
use obshell_domain::entities::{AgentInfo, Identity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTarget {
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMasterRequest {
    pub master: AgentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorRequest {
    pub operator: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailQuery {
    #[serde(default)]
    pub show_details: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretInfo {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeInfo {
    pub time: DateTime<Utc>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitInfo {
    pub git_commit: String,
    pub git_branch: String,
}

/// `/api/v1/info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent: AgentInfo,
    pub zone: String,
    pub version: String,
    pub identity: Identity,
    pub master: Option<AgentInfo>,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
}

/// `/api/v1/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: String,
    pub identity: Identity,
    pub is_maintainer: bool,
    pub maintainer: Option<AgentInfo>,
    pub pid: u32,
    pub uptime_seconds: i64,
}
