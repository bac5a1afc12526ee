use std::collections::HashMap;
use std::sync::Arc;

use obshell_domain::entities::SubTask;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::runner::{RunOutcome, SubTaskRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Resume,
}

/// 子任务执行器
///
/// 同一子任务同一时刻只允许一次执行在途, 总并发受信号量限制。
pub struct SubTaskExecutor {
    runner: Arc<SubTaskRunner>,
    running: Arc<RwLock<HashMap<i64, JoinHandle<()>>>>,
    permits: Arc<Semaphore>,
}

impl SubTaskExecutor {
    pub fn new(runner: Arc<SubTaskRunner>, max_concurrent: usize) -> Self {
        Self {
            runner,
            running: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn runner(&self) -> &Arc<SubTaskRunner> {
        &self.runner
    }

    /// 提交一次执行, 子任务已在途时返回 false
    pub async fn submit(&self, sub_task: SubTask) -> bool {
        self.spawn(sub_task, Mode::Run).await
    }

    /// 提交一次接续执行
    pub async fn submit_resume(&self, sub_task: SubTask) -> bool {
        self.spawn(sub_task, Mode::Resume).await
    }

    async fn spawn(&self, sub_task: SubTask, mode: Mode) -> bool {
        let id = sub_task.id;
        let mut running = self.running.write().await;
        if running.contains_key(&id) {
            return false;
        }

        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        let running_ref = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => match mode {
                    Mode::Run => runner.run(sub_task).await,
                    Mode::Resume => runner.resume(sub_task).await,
                },
                Err(_) => Ok(RunOutcome::Skipped),
            };
            match outcome {
                Ok(RunOutcome::Finished(state)) => debug!("子任务 {} 结束: {}", id, state),
                Ok(RunOutcome::Skipped) => debug!("子任务 {} 本次执行被跳过", id),
                Err(e) => error!("子任务 {} 执行出错: {}", id, e),
            }
            running_ref.write().await.remove(&id);
        });
        running.insert(id, handle);
        true
    }

    pub async fn is_running(&self, sub_task_id: i64) -> bool {
        self.running.read().await.contains_key(&sub_task_id)
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// 中止所有在途执行, 数据库中的状态留给重启后的恢复流程处理
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut running = self.running.write().await;
        let count = running.len();
        for (_, handle) in running.drain() {
            handle.abort();
        }
        info!("子任务执行器已停止, 中止 {} 个在途执行", count);
    }
}
