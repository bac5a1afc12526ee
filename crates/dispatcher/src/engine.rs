use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use obshell_worker::SubTaskExecutor;

use crate::recovery::RecoveryService;
use crate::scheduler::DagScheduler;

/// 本地任务引擎: 启动恢复后按固定间隔运行本地调度器, 每轮回收没有在途执行的子任务
pub struct TaskEngine {
    scheduler: Arc<DagScheduler>,
    recovery: RecoveryService,
    executor: Arc<SubTaskExecutor>,
    tick: Duration,
}

impl TaskEngine {
    pub fn new(
        scheduler: Arc<DagScheduler>,
        recovery: RecoveryService,
        executor: Arc<SubTaskExecutor>,
        tick: Duration,
    ) -> Self {
        Self {
            scheduler,
            recovery,
            executor,
            tick,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.recovery.recover().await {
            error!("启动恢复失败: {}", e);
        }

        info!("本地任务调度启动, 间隔 {:?}", self.tick);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scheduler.tick().await {
                        warn!("本地调度失败: {}", e);
                    }
                    if let Err(e) = self.recovery.reclaim().await {
                        warn!("回收孤儿子任务失败: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("本地任务调度收到停止信号");
                    break;
                }
            }
        }
        self.executor.shutdown().await;
    }
}
