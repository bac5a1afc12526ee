use std::time::Duration;

use async_trait::async_trait;
use obshell_domain::entities::TaskCapabilities;
use obshell_errors::ObshellResult;

use crate::registry::TaskRegistry;
use crate::runtime::TaskRuntime;
use crate::task::ExecutableTask;

/// 什么都不做的任务, 常用于占位和连通性检查
#[derive(Debug, Default)]
pub struct NoopTask;

#[async_trait]
impl ExecutableTask for NoopTask {
    fn name(&self) -> &str {
        "noop"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::all()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        runtime.execute_info_log("noop");
        Ok(())
    }
}

/// 按参数 `sleep_ms` 等待, 期间响应取消
#[derive(Debug, Default)]
pub struct SleepTask;

#[async_trait]
impl ExecutableTask for SleepTask {
    fn name(&self) -> &str {
        "sleep"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default()
            .with_cancel()
            .with_retry()
            .with_pass()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let sleep_ms: u64 = runtime.get_param("sleep_ms").unwrap_or(1_000);
        if runtime.is_continue() {
            runtime.execute_warn_log("上次执行被中断, 重新等待");
        }
        runtime.execute_log(format!("sleep {sleep_ms} ms"));
        runtime.sleep(Duration::from_millis(sleep_ms)).await
    }
}

pub async fn register_builtin_tasks(registry: &TaskRegistry) {
    registry.register("noop", NoopTask::default).await;
    registry.register("sleep", SleepTask::default).await;
}
