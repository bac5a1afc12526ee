//! 代理身份状态机
//!
//! ```text
//! SINGLE --join--> MASTER / FOLLOWER --init--> CLUSTER_AGENT
//!   ^                  |                            |
//!   +------remove------+                            |
//!   +-------------------------scale_in--------------+
//! SINGLE --scale_out(由维护者发起)--> CLUSTER_AGENT
//! ```
//!
//! 每一次身份变更都是一个 Dag, 由 [`tasks`] 中的子任务组成。

pub mod tasks;

use std::sync::Arc;

use obshell_domain::{
    entities::{
        AgentInfo, AgentInstance, Dag, DagType, Identity, MaintenanceType, RosterEntry,
        TaskContext,
    },
    ports::{IdentityChange, JoinRequest},
};
use obshell_errors::{ObshellError, ObshellResult};
use tracing::info;

use crate::dag_service::DagService;
use crate::template::{Template, TemplateBuilder};

pub use tasks::{register_membership_tasks, MembershipContext};

use tasks::*;

pub fn join_template() -> ObshellResult<Template> {
    TemplateBuilder::new("Join agent")
        .set_type(DagType::Local)
        .set_maintenance(MaintenanceType::Agent)
        .add_node(CHECK_IDENTITY)
        .add_node(CHECK_PEER_VERSION)
        .add_node(SEND_TOKEN)
        .add_node(UPDATE_IDENTITY)
        .build()
}

pub fn remove_template() -> ObshellResult<Template> {
    TemplateBuilder::new("Remove agent")
        .set_type(DagType::Local)
        .set_maintenance(MaintenanceType::Agent)
        .add_node(CHECK_REMOVE)
        .add_node(REMOVE_MEMBER)
        .build()
}

pub fn init_template() -> ObshellResult<Template> {
    TemplateBuilder::new("Initialize cluster")
        .set_type(DagType::Local)
        .set_maintenance(MaintenanceType::Global)
        .add_node(CHECK_INIT)
        .add_node(BOOTSTRAP_CLUSTER)
        .add_node(PROMOTE_AGENTS)
        .build()
}

pub fn scale_out_template() -> ObshellResult<Template> {
    TemplateBuilder::new("Scale out agent")
        .set_type(DagType::Cluster)
        .set_maintenance(MaintenanceType::Global)
        .add_node(CHECK_SCALE_OUT)
        .add_node(REGISTER_AGENT)
        .add_node(PROMOTE_AGENT)
        .build()
}

pub fn scale_in_template() -> ObshellResult<Template> {
    TemplateBuilder::new("Scale in agent")
        .set_type(DagType::Cluster)
        .set_maintenance(MaintenanceType::Global)
        .add_node(CHECK_SCALE_IN)
        .add_node(DEMOTE_AGENT)
        .add_node(UNREGISTER_AGENT)
        .build()
}

/// 身份变更入口
///
/// 对外接口只负责前置检查和创建 Dag; 对端代理调用的 RPC 直接修改本地状态。
pub struct MembershipService {
    ctx: MembershipContext,
    local_dags: Arc<DagService>,
    cluster_dags: Arc<DagService>,
}

impl MembershipService {
    pub fn new(
        ctx: MembershipContext,
        local_dags: Arc<DagService>,
        cluster_dags: Arc<DagService>,
    ) -> Self {
        Self {
            ctx,
            local_dags,
            cluster_dags,
        }
    }

    pub fn context(&self) -> &MembershipContext {
        &self.ctx
    }

    /// 加入 `master` 的集群; `master` 是自身时本代理成为主节点
    pub async fn join(&self, master: AgentInfo) -> ObshellResult<Dag> {
        self.expect_identity(&[Identity::Single]).await?;
        let context = TaskContext::new().with_param(PARAM_MASTER, &master);
        let dag = self.local_dags.create(&join_template()?, context).await?;
        info!("创建加入集群任务 {}: master {}", dag.id, master);
        Ok(dag)
    }

    pub async fn remove(&self, agent: AgentInfo) -> ObshellResult<Dag> {
        self.expect_identity(&[Identity::Master, Identity::Follower])
            .await?;
        let context = TaskContext::new().with_param(PARAM_AGENT, &agent);
        let dag = self.local_dags.create(&remove_template()?, context).await?;
        info!("创建移除代理任务 {}: {}", dag.id, agent);
        Ok(dag)
    }

    /// 主节点把成员表中的代理一起提升为集群代理
    pub async fn init(&self) -> ObshellResult<Dag> {
        self.expect_identity(&[Identity::Master]).await?;
        let dag = self
            .local_dags
            .create(&init_template()?, TaskContext::new())
            .await?;
        info!("创建集群初始化任务 {}", dag.id);
        Ok(dag)
    }

    pub async fn scale_out(&self, agent: AgentInfo) -> ObshellResult<Dag> {
        self.expect_identity(&[Identity::ClusterAgent]).await?;
        if self.ctx.cluster_agents.get(&agent).await?.is_some() {
            return Err(ObshellError::illegal_argument(format!(
                "{agent} 已经是集群成员"
            )));
        }
        let context = TaskContext::new().with_param(PARAM_AGENT, &agent);
        let dag = self
            .cluster_dags
            .create(&scale_out_template()?, context)
            .await?;
        info!("创建扩容任务 {}: {}", dag.id, agent);
        Ok(dag)
    }

    pub async fn scale_in(&self, agent: AgentInfo) -> ObshellResult<Dag> {
        self.expect_identity(&[Identity::ClusterAgent]).await?;
        if self.ctx.cluster_agents.get(&agent).await?.is_none() {
            return Err(ObshellError::illegal_argument(format!(
                "{agent} 不是集群成员"
            )));
        }
        let context = TaskContext::new().with_param(PARAM_AGENT, &agent);
        let dag = self
            .cluster_dags
            .create(&scale_in_template()?, context)
            .await?;
        info!("创建缩容任务 {}: {}", dag.id, agent);
        Ok(dag)
    }

    /// 当前可见的成员列表
    pub async fn members(&self) -> ObshellResult<Vec<AgentInstance>> {
        let current = self.ctx.identity.current().await;
        match current.identity {
            Identity::Single | Identity::Follower | Identity::TakeOverFollower => {
                Ok(vec![AgentInstance::from(&current)])
            }
            Identity::ClusterAgent | Identity::TakeOverMaster => Ok(self
                .ctx
                .cluster_agents
                .list()
                .await?
                .into_iter()
                .map(|a| AgentInstance {
                    agent: a.agent,
                    zone: a.zone,
                    version: a.version,
                    identity: Identity::ClusterAgent,
                })
                .collect()),
            _ => Ok(self
                .ctx
                .roster
                .list()
                .await?
                .iter()
                .map(RosterEntry::instance)
                .collect()),
        }
    }

    /// 主节点接受跟随者的加入请求
    pub async fn accept_follower(&self, request: &JoinRequest) -> ObshellResult<()> {
        self.expect_identity(&[Identity::Master]).await?;
        let local = self.ctx.identity.current().await;
        if request.agent.version != local.version {
            return Err(ObshellError::illegal_argument(format!(
                "代理 {} 版本 {} 与主节点版本 {} 不一致",
                request.agent.agent, request.agent.version, local.version
            )));
        }
        self.ctx
            .roster
            .upsert(&RosterEntry {
                agent: request.agent.agent.clone(),
                zone: request.agent.zone.clone(),
                version: request.agent.version.clone(),
                identity: Identity::Follower,
                token: request.token.clone(),
            })
            .await?;
        info!("{} 加入成员表", request.agent.agent);
        Ok(())
    }

    pub async fn remove_follower(&self, follower: &AgentInfo) -> ObshellResult<()> {
        self.expect_identity(&[Identity::Master]).await?;
        if self.ctx.roster.remove(follower).await? {
            info!("{} 离开成员表", follower);
        }
        Ok(())
    }

    /// 对端要求本代理变更身份
    pub async fn apply_identity_change(&self, change: &IdentityChange) -> ObshellResult<()> {
        let current = self.ctx.identity.identity().await;
        let allowed = match change.identity {
            Identity::ClusterAgent => matches!(
                current,
                Identity::Follower | Identity::Single | Identity::ClusterAgent
            ),
            Identity::Single => matches!(
                current,
                Identity::Follower | Identity::ClusterAgent | Identity::Single
            ),
            Identity::Follower => {
                current == Identity::Single && change.master.is_some()
            }
            _ => false,
        };
        if !allowed {
            return Err(ObshellError::operator_not_supported(format!(
                "不能从 {current} 变更为 {}",
                change.identity
            )));
        }

        if let Some(token) = &change.token {
            self.ctx.identity.set_token(token.clone()).await?;
        }
        if current != change.identity {
            self.ctx
                .identity
                .update(change.identity, change.master.clone())
                .await?;
        }
        Ok(())
    }

    async fn expect_identity(&self, expected: &[Identity]) -> ObshellResult<()> {
        let current = self.ctx.identity.identity().await;
        if expected.contains(&current) {
            Ok(())
        } else {
            Err(ObshellError::operator_not_supported(format!(
                "身份 {current} 不支持此操作"
            )))
        }
    }
}
