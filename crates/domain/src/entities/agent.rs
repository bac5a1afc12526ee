use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ObshellError, ObshellResult};

/// 代理地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentInfo {
    pub ip: String,
    pub port: u16,
}

impl AgentInfo {
    pub fn new<S: Into<String>>(ip: S, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for AgentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for AgentInfo {
    type Err = ObshellError;

    fn from_str(s: &str) -> ObshellResult<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ObshellError::illegal_argument(format!("无效的代理地址: {s}")))?;
        if ip.is_empty() {
            return Err(ObshellError::illegal_argument(format!("无效的代理地址: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ObshellError::illegal_argument(format!("无效的代理端口: {s}")))?;
        Ok(Self::new(ip, port))
    }
}

/// 代理在集群中的身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Identity {
    Single,
    Master,
    Follower,
    ClusterAgent,
    TakeOverMaster,
    TakeOverFollower,
}

impl Identity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Identity::Single => "SINGLE",
            Identity::Master => "MASTER",
            Identity::Follower => "FOLLOWER",
            Identity::ClusterAgent => "CLUSTER_AGENT",
            Identity::TakeOverMaster => "TAKE_OVER_MASTER",
            Identity::TakeOverFollower => "TAKE_OVER_FOLLOWER",
        }
    }

    /// 请求需要自动转发给主节点的身份
    pub fn is_follower_like(&self) -> bool {
        matches!(self, Identity::Follower | Identity::TakeOverFollower)
    }

    /// 需要完整校验签名的身份
    pub fn is_master_like(&self) -> bool {
        matches!(
            self,
            Identity::Master | Identity::ClusterAgent | Identity::TakeOverMaster
        )
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Identity {
    type Err = ObshellError;

    fn from_str(s: &str) -> ObshellResult<Self> {
        match s {
            "SINGLE" => Ok(Identity::Single),
            "MASTER" => Ok(Identity::Master),
            "FOLLOWER" => Ok(Identity::Follower),
            "CLUSTER_AGENT" => Ok(Identity::ClusterAgent),
            "TAKE_OVER_MASTER" => Ok(Identity::TakeOverMaster),
            "TAKE_OVER_FOLLOWER" => Ok(Identity::TakeOverFollower),
            _ => Err(ObshellError::illegal_argument(format!("无效的身份: {s}"))),
        }
    }
}

/// 本代理持久化的身份信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent: AgentInfo,
    pub zone: String,
    pub version: String,
    pub identity: Identity,
    /// 作为 FOLLOWER 时所属的主节点
    pub master: Option<AgentInfo>,
    pub password: String,
    #[serde(skip_serializing)]
    pub private_key_pem: String,
    /// 加入主节点时由本代理生成的令牌, 主节点以此识别跟随者
    pub token: String,
    pub start_time: DateTime<Utc>,
    pub pid: u32,
}

/// 代理对外展示的信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub agent: AgentInfo,
    pub zone: String,
    pub version: String,
    pub identity: Identity,
}

impl From<&AgentIdentity> for AgentInstance {
    fn from(identity: &AgentIdentity) -> Self {
        Self {
            agent: identity.agent.clone(),
            zone: identity.zone.clone(),
            version: identity.version.clone(),
            identity: identity.identity,
        }
    }
}

/// 初始化前主节点本地保存的成员表 (`all_agent`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub agent: AgentInfo,
    pub zone: String,
    pub version: String,
    pub identity: Identity,
    pub token: String,
}

impl RosterEntry {
    pub fn instance(&self) -> AgentInstance {
        AgentInstance {
            agent: self.agent.clone(),
            zone: self.zone.clone(),
            version: self.version.clone(),
            identity: self.identity,
        }
    }
}

/// 初始化后集群元数据库中的成员 (`ocs_info`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAgent {
    pub agent: AgentInfo,
    pub zone: String,
    pub version: String,
    pub token: String,
    /// 维护者心跳, unix 毫秒; 从未成为维护者时为 0
    pub heartbeat_time: i64,
}
