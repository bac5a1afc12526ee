use std::sync::Arc;
use std::time::Instant;

use obshell_core::constants::{AGENT_RESTARTED_LOG, EXECUTION_LOST_LOG};
use obshell_domain::{
    entities::{AgentInfo, Operator, SubTask},
    repositories::TaskStore,
};
use obshell_errors::ObshellResult;
use obshell_worker::{RunOutcome, SubTaskExecutor, TaskRegistry};
use tracing::{info, warn};

/// 恢复报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 重新进入执行的子任务
    pub continued: Vec<i64>,
    pub failed: Vec<i64>,
    pub canceled: Vec<i64>,
    pub recovery_duration_ms: u64,
}

/// 启动恢复
///
/// 进程启动时, 本代理名下处于 READY / RUNNING 的子任务都是上一个进程留下的
/// 孤儿: 带取消标记的直接取消, 声明了 `can_continue` 的接续执行, 其余标记失败
/// 等待人工处理。
pub struct RecoveryService {
    store: Arc<dyn TaskStore>,
    executor: Arc<SubTaskExecutor>,
    registry: TaskRegistry,
    agent: AgentInfo,
}

impl RecoveryService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<SubTaskExecutor>,
        registry: TaskRegistry,
        agent: AgentInfo,
    ) -> Self {
        Self {
            store,
            executor,
            registry,
            agent,
        }
    }

    pub async fn recover(&self) -> ObshellResult<RecoveryReport> {
        let started = Instant::now();
        let orphans = self.store.list_active_sub_tasks(&self.agent).await?;
        info!("开始恢复 {} 个未完成的子任务", orphans.len());

        let mut report = self.adopt(orphans, AGENT_RESTARTED_LOG).await?;
        report.recovery_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "子任务恢复完成: 接续 {}, 失败 {}, 取消 {}, 耗时 {}ms",
            report.continued.len(),
            report.failed.len(),
            report.canceled.len(),
            report.recovery_duration_ms
        );
        Ok(report)
    }

    /// 运行期间的孤儿: READY / RUNNING 但执行器中没有在途执行, 通常是终态写入失败留下的
    pub async fn reclaim(&self) -> ObshellResult<RecoveryReport> {
        let mut orphans = Vec::new();
        for sub_task in self.store.list_active_sub_tasks(&self.agent).await? {
            if !self.executor.is_running(sub_task.id).await {
                orphans.push(sub_task);
            }
        }
        if orphans.is_empty() {
            return Ok(RecoveryReport::default());
        }

        warn!("发现 {} 个没有在途执行的子任务", orphans.len());
        self.adopt(orphans, EXECUTION_LOST_LOG).await
    }

    async fn adopt(&self, orphans: Vec<SubTask>, reason: &str) -> ObshellResult<RecoveryReport> {
        let runner = self.executor.runner();
        let mut report = RecoveryReport::default();
        for sub_task in orphans {
            if sub_task.operator == Operator::Cancel {
                if runner.cancel_orphan(&sub_task).await? != RunOutcome::Skipped {
                    report.canceled.push(sub_task.id);
                }
                continue;
            }

            let can_continue = match self.registry.capabilities(&sub_task.struct_name).await {
                Ok(capabilities) => capabilities.can_continue,
                Err(e) => {
                    warn!("子任务 {} 的类型无法识别: {}", sub_task.id, e);
                    false
                }
            };

            if can_continue {
                let id = sub_task.id;
                if self.executor.submit_resume(sub_task).await {
                    report.continued.push(id);
                }
            } else if runner.fail_orphan(&sub_task, reason).await? != RunOutcome::Skipped {
                report.failed.push(sub_task.id);
            }
        }
        Ok(report)
    }
}
