//! 身份变更 Dag 中的子任务
//!
//! 每一步都可以在进程重启后重新进入, 重复执行的效果与执行一次相同。

use std::sync::Arc;

use async_trait::async_trait;
use obshell_domain::{
    entities::{AgentInfo, ClusterAgent, Identity, RosterEntry, TaskCapabilities},
    ports::{AgentRpcClient, IdentityChange, JoinRequest},
    repositories::{ClusterAgentRepository, RosterRepository},
};
use obshell_errors::{ObshellError, ObshellResult};
use obshell_worker::{ExecutableTask, TaskRegistry, TaskRuntime};

use crate::identity::IdentityService;

pub const CHECK_IDENTITY: &str = "check_identity";
pub const CHECK_PEER_VERSION: &str = "check_peer_version";
pub const SEND_TOKEN: &str = "send_token";
pub const UPDATE_IDENTITY: &str = "update_identity";
pub const CHECK_REMOVE: &str = "check_remove";
pub const REMOVE_MEMBER: &str = "remove_member";
pub const CHECK_INIT: &str = "check_init";
pub const BOOTSTRAP_CLUSTER: &str = "bootstrap_cluster";
pub const PROMOTE_AGENTS: &str = "promote_agents";
pub const CHECK_SCALE_OUT: &str = "check_scale_out";
pub const REGISTER_AGENT: &str = "register_agent";
pub const PROMOTE_AGENT: &str = "promote_agent";
pub const CHECK_SCALE_IN: &str = "check_scale_in";
pub const DEMOTE_AGENT: &str = "demote_agent";
pub const UNREGISTER_AGENT: &str = "unregister_agent";

pub const PARAM_MASTER: &str = "master";
pub const PARAM_AGENT: &str = "agent";
const DATA_TOKEN: &str = "token";

/// 身份变更任务共用的依赖
#[derive(Clone)]
pub struct MembershipContext {
    pub identity: Arc<IdentityService>,
    pub roster: Arc<dyn RosterRepository>,
    pub cluster_agents: Arc<dyn ClusterAgentRepository>,
    pub rpc: Arc<dyn AgentRpcClient>,
}

impl MembershipContext {
    async fn require_identity(&self, expected: &[Identity]) -> ObshellResult<()> {
        let current = self.identity.identity().await;
        if expected.contains(&current) {
            Ok(())
        } else {
            Err(ObshellError::task_execution(format!(
                "当前身份 {current} 不允许此操作"
            )))
        }
    }

    async fn check_version(&self, peer: &AgentInfo) -> ObshellResult<Identity> {
        let local = self.identity.current().await;
        let remote = self.rpc.get_agent(peer).await?;
        if remote.version != local.version {
            return Err(ObshellError::task_execution(format!(
                "代理 {} 版本 {} 与本代理版本 {} 不一致",
                peer, remote.version, local.version
            )));
        }
        Ok(remote.identity)
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn change(identity: Identity) -> IdentityChange {
    IdentityChange {
        identity,
        master: None,
        token: None,
    }
}

macro_rules! membership_task {
    ($ty:ident, $name:expr, $caps:expr) => {
        pub struct $ty {
            ctx: MembershipContext,
        }

        impl $ty {
            pub fn new(ctx: MembershipContext) -> Self {
                Self { ctx }
            }
        }

        impl $ty {
            const NAME: &'static str = $name;

            fn caps() -> TaskCapabilities {
                $caps
            }
        }
    };
}

fn checking() -> TaskCapabilities {
    TaskCapabilities::default()
        .with_cancel()
        .with_continue()
        .with_retry()
        .with_rollback()
}

fn mutating() -> TaskCapabilities {
    TaskCapabilities::default().with_continue().with_retry()
}

membership_task!(CheckIdentityTask, CHECK_IDENTITY, checking());
membership_task!(CheckPeerVersionTask, CHECK_PEER_VERSION, checking());
membership_task!(SendTokenTask, SEND_TOKEN, mutating().with_rollback());
membership_task!(UpdateIdentityTask, UPDATE_IDENTITY, mutating());
membership_task!(CheckRemoveTask, CHECK_REMOVE, checking());
membership_task!(RemoveMemberTask, REMOVE_MEMBER, mutating().with_pass());
membership_task!(CheckInitTask, CHECK_INIT, checking());
membership_task!(BootstrapClusterTask, BOOTSTRAP_CLUSTER, mutating().with_rollback());
membership_task!(PromoteAgentsTask, PROMOTE_AGENTS, mutating());
membership_task!(CheckScaleOutTask, CHECK_SCALE_OUT, checking());
membership_task!(RegisterAgentTask, REGISTER_AGENT, mutating().with_rollback());
membership_task!(PromoteAgentTask, PROMOTE_AGENT, mutating());
membership_task!(CheckScaleInTask, CHECK_SCALE_IN, checking());
membership_task!(DemoteAgentTask, DEMOTE_AGENT, mutating().with_pass());
membership_task!(UnregisterAgentTask, UNREGISTER_AGENT, mutating());

#[async_trait]
impl ExecutableTask for CheckIdentityTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        self.ctx.require_identity(&[Identity::Single]).await?;
        let master: AgentInfo = runtime.get_param(PARAM_MASTER)?;
        runtime.execute_log(format!("准备加入 {master}"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for CheckPeerVersionTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let master: AgentInfo = runtime.get_param(PARAM_MASTER)?;
        if &master == runtime.agent() {
            runtime.execute_log("本代理将成为主节点");
            return Ok(());
        }
        let identity = self.ctx.check_version(&master).await?;
        if identity != Identity::Master {
            return Err(ObshellError::task_execution(format!(
                "{master} 的身份是 {identity}, 不是主节点"
            )));
        }
        runtime.execute_log(format!("{master} 版本一致"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for SendTokenTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let master: AgentInfo = runtime.get_param(PARAM_MASTER)?;
        let mut current = self.ctx.identity.current().await;
        if current.token.is_empty() {
            self.ctx.identity.set_token(new_token()).await?;
            current = self.ctx.identity.current().await;
        }

        if &master == runtime.agent() {
            self.ctx
                .roster
                .upsert(&RosterEntry {
                    agent: current.agent.clone(),
                    zone: current.zone.clone(),
                    version: current.version.clone(),
                    identity: Identity::Master,
                    token: current.token.clone(),
                })
                .await?;
            runtime.execute_log("主节点写入成员表");
            return Ok(());
        }

        let mut instance = self.ctx.identity.instance().await;
        instance.identity = Identity::Follower;
        self.ctx
            .rpc
            .join_master(
                &master,
                &JoinRequest {
                    agent: instance,
                    token: current.token,
                },
            )
            .await?;
        runtime.execute_log(format!("已向 {master} 发送令牌"));
        Ok(())
    }

    async fn rollback(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let master: AgentInfo = runtime.get_param(PARAM_MASTER)?;
        if &master == runtime.agent() {
            self.ctx.roster.remove(runtime.agent()).await?;
        } else {
            self.ctx.rpc.leave_master(&master, runtime.agent()).await?;
        }
        runtime.execute_log(format!("已从 {master} 的成员表中移除"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for UpdateIdentityTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let master: AgentInfo = runtime.get_param(PARAM_MASTER)?;
        if &master == runtime.agent() {
            self.ctx.identity.update(Identity::Master, None).await?;
        } else {
            self.ctx
                .identity
                .update(Identity::Follower, Some(master))
                .await?;
        }
        runtime.execute_log(format!("身份更新为 {}", self.ctx.identity.identity().await));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for CheckRemoveTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        let current = self.ctx.identity.current().await;
        let is_self = target == current.agent;
        match current.identity {
            Identity::Follower if is_self => Ok(()),
            Identity::Master if is_self => {
                let followers = self
                    .ctx
                    .roster
                    .list()
                    .await?
                    .into_iter()
                    .filter(|e| e.agent != current.agent)
                    .count();
                if followers > 0 {
                    return Err(ObshellError::task_execution(format!(
                        "主节点还有 {followers} 个跟随者, 不能移除"
                    )));
                }
                Ok(())
            }
            Identity::Master => {
                if self.ctx.roster.get(&target).await?.is_none() {
                    return Err(ObshellError::task_execution(format!(
                        "{target} 不在成员表中"
                    )));
                }
                Ok(())
            }
            identity => Err(ObshellError::task_execution(format!(
                "身份 {identity} 不能移除 {target}"
            ))),
        }
    }
}

#[async_trait]
impl ExecutableTask for RemoveMemberTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        let current = self.ctx.identity.current().await;

        if target != current.agent {
            // 主节点移除跟随者
            self.ctx.roster.remove(&target).await?;
            self.ctx
                .rpc
                .change_identity(&target, &change(Identity::Single))
                .await?;
            runtime.execute_log(format!("{target} 已移除"));
            return Ok(());
        }

        match (current.identity, current.master) {
            (Identity::Follower, Some(master)) => {
                self.ctx.rpc.leave_master(&master, &current.agent).await?;
                runtime.execute_log(format!("已离开 {master}"));
            }
            _ => {
                self.ctx.roster.remove(&current.agent).await?;
            }
        }
        if current.identity != Identity::Single {
            self.ctx.identity.update(Identity::Single, None).await?;
        }
        runtime.execute_log("身份更新为 SINGLE");
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for CheckInitTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        // 重启后接续时主节点可能已经完成提升
        if runtime.is_continue()
            && self.ctx.identity.identity().await == Identity::ClusterAgent
        {
            return Ok(());
        }
        self.ctx.require_identity(&[Identity::Master]).await?;
        let roster = self.ctx.roster.list().await?;
        if !roster.iter().any(|e| &e.agent == runtime.agent()) {
            return Err(ObshellError::task_execution("主节点不在成员表中"));
        }
        for entry in roster.iter().filter(|e| &e.agent != runtime.agent()) {
            runtime.timeout_check()?;
            let identity = self.ctx.check_version(&entry.agent).await?;
            if identity != Identity::Follower && identity != Identity::ClusterAgent {
                return Err(ObshellError::task_execution(format!(
                    "{} 的身份是 {identity}",
                    entry.agent
                )));
            }
        }
        runtime.execute_log(format!("{} 个代理检查通过", roster.len()));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for BootstrapClusterTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let roster = self.ctx.roster.list().await?;
        for entry in &roster {
            self.ctx
                .cluster_agents
                .register(&ClusterAgent {
                    agent: entry.agent.clone(),
                    zone: entry.zone.clone(),
                    version: entry.version.clone(),
                    token: entry.token.clone(),
                    heartbeat_time: 0,
                })
                .await?;
        }
        runtime.execute_log(format!("集群元数据库注册 {} 个代理", roster.len()));
        Ok(())
    }

    async fn rollback(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        for entry in self.ctx.roster.list().await? {
            self.ctx.cluster_agents.remove(&entry.agent).await?;
        }
        runtime.execute_log("已清理集群成员");
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for PromoteAgentsTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let roster = self.ctx.roster.list().await?;
        for entry in roster.iter().filter(|e| &e.agent != runtime.agent()) {
            self.ctx
                .rpc
                .change_identity(&entry.agent, &change(Identity::ClusterAgent))
                .await?;
            runtime.execute_log(format!("{} 提升为 CLUSTER_AGENT", entry.agent));
        }

        if self.ctx.identity.identity().await != Identity::ClusterAgent {
            self.ctx.identity.update(Identity::ClusterAgent, None).await?;
        }
        for entry in roster {
            self.ctx.roster.remove(&entry.agent).await?;
        }
        runtime.execute_log("本代理提升为 CLUSTER_AGENT");
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for CheckScaleOutTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        if self.ctx.cluster_agents.get(&target).await?.is_some() {
            return Err(ObshellError::task_execution(format!(
                "{target} 已经是集群成员"
            )));
        }
        let identity = self.ctx.check_version(&target).await?;
        if identity != Identity::Single {
            return Err(ObshellError::task_execution(format!(
                "{target} 的身份是 {identity}, 只有 SINGLE 代理可以加入集群"
            )));
        }
        runtime.execute_log(format!("{target} 检查通过"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for RegisterAgentTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        let instance = self.ctx.rpc.get_agent(&target).await?;
        let token = match self.ctx.cluster_agents.get(&target).await? {
            Some(existing) => existing.token,
            None => new_token(),
        };
        self.ctx
            .cluster_agents
            .register(&ClusterAgent {
                agent: target.clone(),
                zone: instance.zone,
                version: instance.version,
                token: token.clone(),
                heartbeat_time: 0,
            })
            .await?;
        runtime.set_data(DATA_TOKEN, token);
        runtime.execute_log(format!("{target} 已注册"));
        Ok(())
    }

    async fn rollback(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        self.ctx.cluster_agents.remove(&target).await?;
        runtime.execute_log(format!("{target} 已注销"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for PromoteAgentTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        let token = runtime.get_data::<String>(DATA_TOKEN);
        self.ctx
            .rpc
            .change_identity(
                &target,
                &IdentityChange {
                    identity: Identity::ClusterAgent,
                    master: None,
                    token,
                },
            )
            .await?;
        runtime.execute_log(format!("{target} 提升为 CLUSTER_AGENT"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for CheckScaleInTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        if &target == runtime.agent() {
            return Err(ObshellError::task_execution("维护者不能缩容自身"));
        }
        if self.ctx.cluster_agents.get(&target).await?.is_none() {
            return Err(ObshellError::task_execution(format!(
                "{target} 不是集群成员"
            )));
        }
        runtime.execute_log(format!("{target} 检查通过"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for DemoteAgentTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        self.ctx
            .rpc
            .change_identity(&target, &change(Identity::Single))
            .await?;
        runtime.execute_log(format!("{target} 降级为 SINGLE"));
        Ok(())
    }
}

#[async_trait]
impl ExecutableTask for UnregisterAgentTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> TaskCapabilities {
        Self::caps()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let target: AgentInfo = runtime.get_param(PARAM_AGENT)?;
        self.ctx.cluster_agents.remove(&target).await?;
        runtime.execute_log(format!("{target} 已注销"));
        Ok(())
    }
}

/// 注册所有身份变更任务
pub async fn register_membership_tasks(registry: &TaskRegistry, ctx: MembershipContext) {
    macro_rules! register {
        ($($ty:ident),* $(,)?) => {
            $(
                let c = ctx.clone();
                registry.register($ty::NAME, move || $ty::new(c.clone())).await;
            )*
        };
    }
    register!(
        CheckIdentityTask,
        CheckPeerVersionTask,
        SendTokenTask,
        UpdateIdentityTask,
        CheckRemoveTask,
        RemoveMemberTask,
        CheckInitTask,
        BootstrapClusterTask,
        PromoteAgentsTask,
        CheckScaleOutTask,
        RegisterAgentTask,
        PromoteAgentTask,
        CheckScaleInTask,
        DemoteAgentTask,
        UnregisterAgentTask,
    );
}
