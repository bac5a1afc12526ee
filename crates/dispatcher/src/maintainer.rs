use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use obshell_core::config::EngineConfig;
use obshell_domain::{
    entities::{AgentInfo, Identity},
    repositories::ClusterAgentRepository,
};
use obshell_errors::{ObshellError, ObshellResult};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::identity::IdentityService;
use crate::scheduler::DagScheduler;
use crate::synchronizer::TaskSynchronizer;

/// 维护者选举与集群调度
///
/// 每个集群代理定期尝试写入心跳, 写入成功即为维护者。维护者运行集群
/// 调度器和任务同步器; 心跳写入失败或续约超时即降级, 停止这两个循环。
pub struct MaintainerCoordinator {
    agent: AgentInfo,
    identity: Arc<IdentityService>,
    agents: Arc<dyn ClusterAgentRepository>,
    scheduler: Arc<DagScheduler>,
    synchronizer: Arc<TaskSynchronizer>,
    config: EngineConfig,
    is_maintainer: AtomicBool,
}

impl MaintainerCoordinator {
    pub fn new(
        agent: AgentInfo,
        identity: Arc<IdentityService>,
        agents: Arc<dyn ClusterAgentRepository>,
        scheduler: Arc<DagScheduler>,
        synchronizer: Arc<TaskSynchronizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            agent,
            identity,
            agents,
            scheduler,
            synchronizer,
            config,
            is_maintainer: AtomicBool::new(false),
        }
    }

    pub fn is_maintainer(&self) -> bool {
        self.is_maintainer.load(Ordering::SeqCst)
    }

    /// 心跳在有效期内且最新的代理
    pub async fn maintainer(&self) -> ObshellResult<Option<AgentInfo>> {
        self.agents
            .current_maintainer(
                Utc::now().timestamp_millis(),
                self.window().as_millis() as i64,
            )
            .await
    }

    fn window(&self) -> Duration {
        self.config.maintainer_max_active_time()
    }

    /// 心跳循环, 收到停止信号后降级并释放心跳
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("维护者协调器启动: {}", self.agent);
        let mut loops = JoinSet::new();
        let mut last_renew: Option<Instant> = None;
        let mut ticker = interval(self.config.maintainer_update_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // 续约到期前没有再次写入成功就立即降级, 不等下一次心跳
            let lease_end = last_renew.map(|at| at + self.window());
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat(&mut loops, &mut last_renew).await;
                }
                _ = sleep_until(lease_end.unwrap_or_else(Instant::now)),
                    if lease_end.is_some() && self.is_maintainer() =>
                {
                    self.demote(&mut loops, "心跳续约超时").await;
                }
                _ = shutdown.recv() => {
                    info!("维护者协调器收到停止信号");
                    break;
                }
            }
        }

        if self.is_maintainer() {
            self.demote(&mut loops, "代理停止").await;
            if let Err(e) = self.agents.release_heartbeat(&self.agent).await {
                warn!("释放维护者心跳失败: {}", e);
            }
        }
    }

    async fn heartbeat(&self, loops: &mut JoinSet<()>, last_renew: &mut Option<Instant>) {
        if self.identity.identity().await != Identity::ClusterAgent {
            if self.is_maintainer() {
                self.demote(loops, "身份已变更").await;
            }
            return;
        }

        // 本地租期从写入前开始计算, 不晚于数据库中记录的心跳时间
        let started = Instant::now();
        let now = Utc::now().timestamp_millis();
        let window = self.window();
        let renew = self
            .agents
            .try_heartbeat(&self.agent, now, window.as_millis() as i64);
        let result = match (*last_renew).filter(|_| self.is_maintainer()) {
            Some(at) => timeout_at(at + window, renew).await.unwrap_or_else(|_| {
                Err(ObshellError::timeout("维护者心跳写入超过租期"))
            }),
            None => renew.await,
        };
        match result {
            Ok(true) => {
                *last_renew = Some(started);
                if !self.is_maintainer() {
                    self.promote(loops);
                }
            }
            Ok(false) => {
                if self.is_maintainer() {
                    self.demote(loops, "其他代理持有心跳").await;
                } else {
                    debug!("维护者心跳被其他代理持有");
                }
            }
            Err(e) => {
                warn!("写入维护者心跳失败: {}", e);
                let expired = last_renew.map_or(true, |at| at.elapsed() >= window);
                if self.is_maintainer() && expired {
                    self.demote(loops, "心跳续约超时").await;
                }
            }
        }
    }

    fn promote(&self, loops: &mut JoinSet<()>) {
        info!("{} 成为维护者, 启动集群调度", self.agent);
        self.is_maintainer.store(true, Ordering::SeqCst);

        let scheduler = Arc::clone(&self.scheduler);
        loops.spawn(every(self.config.scheduler_tick(), "集群调度", move || {
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.tick().await }
        }));

        let synchronizer = Arc::clone(&self.synchronizer);
        loops.spawn(every(self.config.sync_interval(), "任务同步", move || {
            let synchronizer = Arc::clone(&synchronizer);
            async move { synchronizer.sync_once().await.map(|_| ()) }
        }));
    }

    async fn demote(&self, loops: &mut JoinSet<()>, reason: &str) {
        warn!("{} 不再是维护者: {}", self.agent, reason);
        self.is_maintainer.store(false, Ordering::SeqCst);
        loops.shutdown().await;
    }
}

/// 按固定间隔执行, 单轮出错只记录日志
async fn every<F, Fut>(period: Duration, name: &'static str, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ObshellResult<()>>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = f().await {
            error!("{}失败: {}", name, e);
        }
    }
}
