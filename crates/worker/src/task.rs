use async_trait::async_trait;
use obshell_domain::entities::TaskCapabilities;
use obshell_errors::ObshellResult;

use crate::runtime::TaskRuntime;

/// 可执行的任务
///
/// 每次执行都会通过注册表构造一个新的实例。任务体应当在安全点调用
/// [`TaskRuntime::timeout_check`], 收到取消信号时返回 `Cancelled`。
#[async_trait]
pub trait ExecutableTask: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> TaskCapabilities;

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()>;

    /// 只有声明了 `can_rollback` 的任务才会被调用
    async fn rollback(&self, _runtime: &TaskRuntime) -> ObshellResult<()> {
        Ok(())
    }
}
