use std::sync::Arc;

use obshell_domain::{
    entities::AgentInfo,
    ports::{MappingAck, RemoteTaskClient},
    repositories::{ClusterAgentRepository, SubTaskSnapshot, TaskStore},
};
use obshell_errors::ObshellResult;
use tracing::{debug, warn};

/// 把执行代理上镜像子任务的状态写回集群元数据库, 只在维护者上运行
pub struct TaskSynchronizer {
    cluster_store: Arc<dyn TaskStore>,
    agents: Arc<dyn ClusterAgentRepository>,
    client: Arc<dyn RemoteTaskClient>,
}

impl TaskSynchronizer {
    pub fn new(
        cluster_store: Arc<dyn TaskStore>,
        agents: Arc<dyn ClusterAgentRepository>,
        client: Arc<dyn RemoteTaskClient>,
    ) -> Self {
        Self {
            cluster_store,
            agents,
            client,
        }
    }

    /// 同步一轮, 返回写回集群元数据库的子任务数
    pub async fn sync_once(&self) -> ObshellResult<usize> {
        let mut applied = 0;
        for member in self.agents.list().await? {
            match self.sync_agent(&member.agent).await {
                Ok(count) => applied += count,
                Err(e) => warn!("同步代理 {} 的任务状态失败: {}", member.agent, e),
            }
        }
        Ok(applied)
    }

    async fn sync_agent(&self, agent: &AgentInfo) -> ObshellResult<usize> {
        let snapshots = self.client.fetch_unsynced(agent).await?;
        if snapshots.is_empty() {
            return Ok(0);
        }

        let mut applied = 0;
        let mut acks = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let written = self
                .cluster_store
                .apply_snapshot(
                    snapshot.remote_task_id,
                    &SubTaskSnapshot {
                        state: snapshot.state,
                        operator: snapshot.operator,
                        execute_times: snapshot.execute_times,
                        context: snapshot.context.clone(),
                        start_time: snapshot.start_time,
                        end_time: snapshot.end_time,
                    },
                )
                .await?;
            if written {
                if snapshot.execute_times > 0 {
                    self.cluster_store
                        .replace_sub_task_logs(
                            snapshot.remote_task_id,
                            snapshot.execute_times,
                            &snapshot.logs,
                        )
                        .await?;
                }
                applied += 1;
                debug!(
                    sub_task_id = snapshot.remote_task_id,
                    execute_times = snapshot.execute_times,
                    "同步子任务状态: {}",
                    snapshot.state
                );
            }
            // 被拒绝的快照已经过期, 同样确认
            acks.push(MappingAck {
                mapping_id: snapshot.mapping_id,
                sync_version: snapshot.sync_version,
            });
        }

        self.client.ack_synced(agent, &acks).await?;
        Ok(applied)
    }
}
