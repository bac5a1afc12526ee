//! 全局常量

/// 代理版本号, 加入集群时要求双方版本一致
pub const AGENT_VERSION: &str = "4.2.0";
pub const GIT_COMMIT: &str = match option_env!("OBSHELL_GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};
pub const GIT_BRANCH: &str = match option_env!("OBSHELL_GIT_BRANCH") {
    Some(branch) => branch,
    None => "unknown",
};

pub const DEFAULT_AGENT_PORT: u16 = 2886;

pub const TRACE_ID_HEADER: &str = "X-OCS-Trace-Id";
pub const SECURE_HEADER: &str = "X-OCS-Header";

pub const API_PREFIX: &str = "/api/v1";
pub const RPC_PREFIX: &str = "/rpc/v1";

/// 维护者心跳间隔 (毫秒)
pub const MAINTAINER_UPDATE_INTERVAL_MS: u64 = 4_000;
/// 维护者心跳有效期 (毫秒)
pub const MAINTAINER_MAX_ACTIVE_TIME_MS: u64 = 5_000;

/// 任务上下文序列化格式版本
pub const TASK_CONTEXT_VERSION: u32 = 1;

pub const DAG_POLL_RETRY: u32 = 3;
pub const UPGRADE_DAG_POLL_RETRY: u32 = 600;

pub const AGENT_RESTARTED_LOG: &str = "agent restarted during execution";
/// 执行已结束但终态没有写入元数据库
pub const EXECUTION_LOST_LOG: &str = "execution ended without recording its result";
