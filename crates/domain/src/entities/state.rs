use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ObshellError, ObshellResult};

/// Dag / Node / SubTask 共用的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Pending,
    Ready,
    Running,
    Failed,
    Succeed,
    Cancelling,
    Canceled,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::Ready => "READY",
            State::Running => "RUNNING",
            State::Failed => "FAILED",
            State::Succeed => "SUCCEED",
            State::Cancelling => "CANCELLING",
            State::Canceled => "CANCELED",
        }
    }

    /// 子任务的终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeed | State::Failed | State::Canceled)
    }

    /// 子任务正在被某个运行时持有
    pub fn is_active(&self) -> bool {
        matches!(self, State::Pending | State::Ready | State::Running)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = ObshellError;

    fn from_str(s: &str) -> ObshellResult<Self> {
        match s {
            "PENDING" => Ok(State::Pending),
            "READY" => Ok(State::Ready),
            "RUNNING" => Ok(State::Running),
            "FAILED" => Ok(State::Failed),
            "SUCCEED" => Ok(State::Succeed),
            "CANCELLING" => Ok(State::Cancelling),
            "CANCELED" => Ok(State::Canceled),
            _ => Err(ObshellError::illegal_argument(format!("无效的状态: {s}"))),
        }
    }
}

/// 调度器据此决定 Dag 的推进方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Run,
    Retry,
    Rollback,
    Cancel,
    Pass,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Run => "RUN",
            Operator::Retry => "RETRY",
            Operator::Rollback => "ROLLBACK",
            Operator::Cancel => "CANCEL",
            Operator::Pass => "PASS",
        }
    }

    /// 正向推进的操作
    pub fn is_forward(&self) -> bool {
        matches!(self, Operator::Run | Operator::Retry | Operator::Pass)
    }

    /// 解析外部请求中的操作名, 大小写不敏感
    pub fn parse_request(s: &str) -> ObshellResult<Self> {
        s.to_ascii_uppercase().parse()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = ObshellError;

    fn from_str(s: &str) -> ObshellResult<Self> {
        match s {
            "RUN" => Ok(Operator::Run),
            "RETRY" => Ok(Operator::Retry),
            "ROLLBACK" => Ok(Operator::Rollback),
            "CANCEL" => Ok(Operator::Cancel),
            "PASS" => Ok(Operator::Pass),
            _ => Err(ObshellError::illegal_argument(format!("无效的操作: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DagType {
    Local,
    Cluster,
    ObproxyLocal,
}

impl DagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DagType::Local => "LOCAL",
            DagType::Cluster => "CLUSTER",
            DagType::ObproxyLocal => "OBPROXY_LOCAL",
        }
    }

    pub fn scope(&self) -> TaskScope {
        match self {
            DagType::Cluster => TaskScope::Cluster,
            DagType::Local | DagType::ObproxyLocal => TaskScope::Local,
        }
    }
}

impl fmt::Display for DagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DagType {
    type Err = ObshellError;

    fn from_str(s: &str) -> ObshellResult<Self> {
        match s {
            "LOCAL" => Ok(DagType::Local),
            "CLUSTER" => Ok(DagType::Cluster),
            "OBPROXY_LOCAL" => Ok(DagType::ObproxyLocal),
            _ => Err(ObshellError::illegal_argument(format!("无效的Dag类型: {s}"))),
        }
    }
}

/// 运维锁类型, 同一元数据库内至多一个未结束的运维 Dag, 不区分类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceType {
    None,
    Global,
    Agent,
    Obproxy,
}

impl MaintenanceType {
    pub fn as_i64(&self) -> i64 {
        match self {
            MaintenanceType::None => 0,
            MaintenanceType::Global => 1,
            MaintenanceType::Agent => 2,
            MaintenanceType::Obproxy => 3,
        }
    }

    pub fn from_i64(value: i64) -> ObshellResult<Self> {
        match value {
            0 => Ok(MaintenanceType::None),
            1 => Ok(MaintenanceType::Global),
            2 => Ok(MaintenanceType::Agent),
            3 => Ok(MaintenanceType::Obproxy),
            _ => Err(ObshellError::illegal_argument(format!(
                "无效的运维类型: {value}"
            ))),
        }
    }

    pub fn is_maintenance(&self) -> bool {
        !matches!(self, MaintenanceType::None)
    }
}

/// 元数据归属范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScope {
    Cluster,
    Local,
}

impl TaskScope {
    pub fn code(&self) -> u8 {
        match self {
            TaskScope::Cluster => 1,
            TaskScope::Local => 2,
        }
    }

    pub fn from_code(code: u8) -> ObshellResult<Self> {
        match code {
            1 => Ok(TaskScope::Cluster),
            2 => Ok(TaskScope::Local),
            _ => Err(ObshellError::illegal_argument(format!("无效的任务范围: {code}"))),
        }
    }
}

/// 任务声明的能力位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskCapabilities {
    pub can_cancel: bool,
    /// 进程崩溃后可以安全地重新进入
    pub can_continue: bool,
    pub can_retry: bool,
    pub can_rollback: bool,
    pub can_pass: bool,
}

impl TaskCapabilities {
    pub fn all() -> Self {
        Self {
            can_cancel: true,
            can_continue: true,
            can_retry: true,
            can_rollback: true,
            can_pass: true,
        }
    }

    pub fn with_cancel(mut self) -> Self {
        self.can_cancel = true;
        self
    }

    pub fn with_continue(mut self) -> Self {
        self.can_continue = true;
        self
    }

    pub fn with_retry(mut self) -> Self {
        self.can_retry = true;
        self
    }

    pub fn with_rollback(mut self) -> Self {
        self.can_rollback = true;
        self
    }

    pub fn with_pass(mut self) -> Self {
        self.can_pass = true;
        self
    }

    /// 失败后是否还有人工可执行的操作
    pub fn awaits_operator(&self) -> bool {
        self.can_retry || self.can_rollback || self.can_pass
    }
}
