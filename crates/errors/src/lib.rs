use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObshellError {
    #[error("非法参数: {0}")]
    IllegalArgument(String),
    #[error("认证失败: {0}")]
    Unauthorized(String),
    #[error("存在进行中的运维任务: {0}")]
    MaintenanceConflict(String),
    #[error("冲突: {0}")]
    Conflict(String),
    #[error("Dag未找到: {id}")]
    DagNotFound { id: String },
    #[error("Node未找到: {id}")]
    NodeNotFound { id: String },
    #[error("SubTask未找到: {id}")]
    SubTaskNotFound { id: String },
    #[error("不支持的操作: {0}")]
    OperatorNotSupported(String),
    #[error("没有记录被更新: {0}")]
    NoAffectedRows(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("任务已取消")]
    Cancelled,
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("加密错误: {0}")]
    Crypto(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("内部错误: {0}")]
    Internal(String),
    #[error("未知错误: {message}")]
    Unexpected {
        message: String,
        cause: Option<String>,
    },
}

pub type ObshellResult<T> = Result<T, ObshellError>;

impl ObshellError {
    pub fn illegal_argument<S: Into<String>>(msg: S) -> Self {
        Self::IllegalArgument(msg.into())
    }
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn maintenance_conflict<S: Into<String>>(msg: S) -> Self {
        Self::MaintenanceConflict(msg.into())
    }
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn dag_not_found<S: ToString>(id: S) -> Self {
        Self::DagNotFound { id: id.to_string() }
    }
    pub fn node_not_found<S: ToString>(id: S) -> Self {
        Self::NodeNotFound { id: id.to_string() }
    }
    pub fn sub_task_not_found<S: ToString>(id: S) -> Self {
        Self::SubTaskNotFound { id: id.to_string() }
    }
    pub fn operator_not_supported<S: Into<String>>(msg: S) -> Self {
        Self::OperatorNotSupported(msg.into())
    }
    pub fn no_affected_rows<S: Into<String>>(msg: S) -> Self {
        Self::NoAffectedRows(msg.into())
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }
    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected {
            message: msg.into(),
            cause: None,
        }
    }
    pub fn unexpected_with_cause<S: Into<String>, E: std::fmt::Display>(msg: S, cause: E) -> Self {
        Self::Unexpected {
            message: msg.into(),
            cause: Some(cause.to_string()),
        }
    }

    /// 稳定的错误码, 对外响应中使用
    pub fn code(&self) -> &'static str {
        match self {
            ObshellError::IllegalArgument(_) => "IllegalArgument",
            ObshellError::Unauthorized(_) => "Unauthorized",
            ObshellError::MaintenanceConflict(_) => "MaintenanceInProgress",
            ObshellError::Conflict(_) => "Conflict",
            ObshellError::DagNotFound { .. } => "DagNotFound",
            ObshellError::NodeNotFound { .. } => "NodeNotFound",
            ObshellError::SubTaskNotFound { .. } => "SubTaskNotFound",
            ObshellError::OperatorNotSupported(_) => "OperatorNotSupported",
            ObshellError::NoAffectedRows(_) => "NoAffectedRows",
            ObshellError::Timeout(_) => "Timeout",
            ObshellError::Cancelled => "Cancelled",
            ObshellError::Database(_) => "DatabaseError",
            ObshellError::Serialization(_) => "SerializationError",
            ObshellError::Network(_) => "NetworkError",
            ObshellError::Configuration(_) => "ConfigurationError",
            ObshellError::Crypto(_) => "CryptoError",
            ObshellError::TaskExecution(_) => "TaskExecutionError",
            ObshellError::Internal(_) => "InternalError",
            ObshellError::Unexpected { .. } => "Unexpected",
        }
    }
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ObshellError::DagNotFound { .. }
                | ObshellError::NodeNotFound { .. }
                | ObshellError::SubTaskNotFound { .. }
        )
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObshellError::Internal(_) | ObshellError::Configuration(_)
        )
    }
    /// 只有乐观更新冲突和瞬时网络错误才由引擎自动重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ObshellError::NoAffectedRows(_) | ObshellError::Network(_) | ObshellError::Timeout(_)
        )
    }
    pub fn user_message(&self) -> String {
        match self {
            ObshellError::IllegalArgument(msg) => format!("参数错误: {msg}"),
            ObshellError::Unauthorized(_) => "认证失败".to_string(),
            ObshellError::MaintenanceConflict(msg) => format!("存在进行中的运维任务: {msg}"),
            ObshellError::Conflict(msg) => format!("请求冲突: {msg}"),
            ObshellError::DagNotFound { id } => format!("任务 {id} 不存在"),
            ObshellError::NodeNotFound { id } => format!("节点 {id} 不存在"),
            ObshellError::SubTaskNotFound { id } => format!("子任务 {id} 不存在"),
            ObshellError::OperatorNotSupported(msg) => format!("不支持的操作: {msg}"),
            ObshellError::Timeout(_) => "操作超时，请稍后重试".to_string(),
            ObshellError::Cancelled => "任务已取消".to_string(),
            _ => "系统繁忙，请稍后重试".to_string(),
        }
    }
}

impl From<serde_json::Error> for ObshellError {
    fn from(err: serde_json::Error) -> Self {
        ObshellError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ObshellError {
    fn from(err: anyhow::Error) -> Self {
        ObshellError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
