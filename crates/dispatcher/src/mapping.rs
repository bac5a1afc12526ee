use std::sync::Arc;

use async_trait::async_trait;
use obshell_domain::{
    entities::{AgentInfo, Operator, State},
    ports::{MappingAck, MirrorSnapshot, RemoteSubTask, RemoteTaskClient},
    repositories::{MirrorPlan, TaskStore},
};
use obshell_errors::{ObshellError, ObshellResult};
use tracing::{debug, info, instrument};

/// 执行代理一侧的任务映射
///
/// 集群调度器派发的子任务在本地元数据库中以镜像子任务的形式存在, 由本地
/// 调度器执行; 镜像每次状态变化都会把映射置为未同步, 等待维护者拉取。
pub struct TaskMappingService {
    store: Arc<dyn TaskStore>,
    agent: AgentInfo,
}

impl TaskMappingService {
    pub fn new(store: Arc<dyn TaskStore>, agent: AgentInfo) -> Self {
        Self { store, agent }
    }

    /// 接收一次派发, 重复派发是幂等的
    #[instrument(skip(self, task), fields(remote_task_id = task.remote_task_id, operator = %task.operator))]
    pub async fn accept(&self, task: &RemoteSubTask) -> ObshellResult<()> {
        let Some(mapping) = self.store.get_mapping_by_remote(task.remote_task_id).await? else {
            // 还没有镜像时收到取消, 同样创建镜像, 由本地执行器直接置为 CANCELED
            let mirror = self
                .store
                .create_mirror(
                    task.remote_task_id,
                    &MirrorPlan {
                        name: task.name.clone(),
                        struct_name: task.struct_name.clone(),
                        executor: self.agent.clone(),
                        operator: task.operator,
                        execute_times: task.execute_times,
                        context: task.context.clone(),
                    },
                )
                .await?;
            info!(
                "接收子任务 {} -> 镜像 {} ({})",
                task.remote_task_id, mirror.id, task.struct_name
            );
            return Ok(());
        };

        let mirror = self
            .store
            .get_sub_task(mapping.local_task_id)
            .await?
            .ok_or_else(|| ObshellError::sub_task_not_found(mapping.local_task_id))?;

        if task.operator == Operator::Cancel {
            if mirror.state.is_active() && self.store.cancel_sub_task(mirror.id).await? {
                info!("镜像子任务 {} 收到取消", mirror.id);
            }
            return Ok(());
        }

        // 集群子任务被重试或回滚重新置为 PENDING, 已结束的镜像跟着重置
        if task.state == State::Pending
            && mirror.state.is_terminal()
            && task.execute_times >= mirror.execute_times
        {
            match self
                .store
                .reset_mirror(mirror.id, task.operator, &task.context)
                .await
            {
                Ok(()) => info!(
                    "镜像子任务 {} 重置为 PENDING ({})",
                    mirror.id, task.operator
                ),
                Err(ObshellError::NoAffectedRows(_)) => {
                    debug!("镜像子任务 {} 已被重置", mirror.id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 尚未同步到集群元数据库的镜像状态
    pub async fn unsynced(&self) -> ObshellResult<Vec<MirrorSnapshot>> {
        let mut snapshots = Vec::new();
        for mapping in self.store.list_unsynced_mappings().await? {
            let Some(mirror) = self.store.get_sub_task(mapping.local_task_id).await? else {
                continue;
            };
            let logs = if mirror.execute_times > 0 {
                self.store
                    .list_sub_task_logs(mirror.id, Some(mirror.execute_times))
                    .await?
                    .into_iter()
                    .map(|l| l.log_content)
                    .collect()
            } else {
                Vec::new()
            };
            snapshots.push(MirrorSnapshot {
                mapping_id: mapping.id,
                sync_version: mapping.sync_version,
                remote_task_id: mapping.remote_task_id,
                state: mirror.state,
                operator: mirror.operator,
                execute_times: mirror.execute_times,
                context: mirror.context,
                start_time: mirror.start_time,
                end_time: mirror.end_time,
                logs,
            });
        }
        Ok(snapshots)
    }

    /// 确认同步, 版本号已变化的映射保持未同步
    pub async fn ack(&self, acks: &[MappingAck]) -> ObshellResult<usize> {
        let mut acked = 0;
        for ack in acks {
            if self.store.ack_mapping(ack.mapping_id, ack.sync_version).await? {
                acked += 1;
            }
        }
        Ok(acked)
    }
}

/// 派发给本代理的调用直接走本地映射服务, 其余交给远程客户端
pub struct LoopbackTaskClient {
    agent: AgentInfo,
    local: Arc<TaskMappingService>,
    remote: Arc<dyn RemoteTaskClient>,
}

impl LoopbackTaskClient {
    pub fn new(
        agent: AgentInfo,
        local: Arc<TaskMappingService>,
        remote: Arc<dyn RemoteTaskClient>,
    ) -> Self {
        Self {
            agent,
            local,
            remote,
        }
    }
}

#[async_trait]
impl RemoteTaskClient for LoopbackTaskClient {
    async fn dispatch_sub_task(&self, agent: &AgentInfo, task: &RemoteSubTask) -> ObshellResult<()> {
        if agent == &self.agent {
            self.local.accept(task).await
        } else {
            self.remote.dispatch_sub_task(agent, task).await
        }
    }

    async fn fetch_unsynced(&self, agent: &AgentInfo) -> ObshellResult<Vec<MirrorSnapshot>> {
        if agent == &self.agent {
            self.local.unsynced().await
        } else {
            self.remote.fetch_unsynced(agent).await
        }
    }

    async fn ack_synced(&self, agent: &AgentInfo, acks: &[MappingAck]) -> ObshellResult<()> {
        if agent == &self.agent {
            self.local.ack(acks).await.map(|_| ())
        } else {
            self.remote.ack_synced(agent, acks).await
        }
    }
}
