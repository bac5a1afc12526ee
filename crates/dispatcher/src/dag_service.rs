use std::sync::Arc;

use obshell_domain::{
    entities::{
        AgentInfo, Dag, MaintenanceType, Node, Operator, State, SubTask, TaskContext, TaskScope,
    },
    repositories::{DagPlan, DagTransition, NodePlan, SubTaskPlan, SubTaskReset, TaskStore},
};
use obshell_errors::{ObshellError, ObshellResult};
use obshell_worker::TaskRegistry;
use tracing::{debug, info, instrument};

use crate::template::{NodeExecutors, Template};
use crate::views::{DagDetail, NodeDetail, SubTaskDetail};

const OPERATE_RETRY: usize = 3;

/// Dag 的创建、查询和人工操作
///
/// 本地元数据库和集群元数据库各有一个实例, 逻辑完全相同。
pub struct DagService {
    scope: TaskScope,
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    agent: AgentInfo,
}

impl DagService {
    pub fn new(
        scope: TaskScope,
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
        agent: AgentInfo,
    ) -> Self {
        Self {
            scope,
            store,
            registry,
            agent,
        }
    }

    pub fn scope(&self) -> TaskScope {
        self.scope
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 按模板创建 Dag, 节点、子任务和运维锁检查在同一个事务内完成
    #[instrument(skip(self, template, context), fields(name = %template.name))]
    pub async fn create(&self, template: &Template, context: TaskContext) -> ObshellResult<Dag> {
        if template.dag_type.scope() != self.scope {
            return Err(ObshellError::illegal_argument(format!(
                "{} 类型的 Dag 不能创建在 {:?} 元数据库中",
                template.dag_type, self.scope
            )));
        }

        let mut nodes = Vec::with_capacity(template.nodes.len());
        for node in &template.nodes {
            let (name, capabilities) = self.registry.describe(&node.struct_name).await?;
            let executors = match &node.executors {
                NodeExecutors::Local => Vec::new(),
                NodeExecutors::Agents(agents) => agents.clone(),
                NodeExecutors::Context => {
                    if context.execute_agents.is_empty() {
                        return Err(ObshellError::illegal_argument(format!(
                            "节点 {} 需要上下文中的执行代理",
                            node.struct_name
                        )));
                    }
                    context.execute_agents.clone()
                }
            };

            let sub_task_agents = if executors.is_empty() {
                vec![self.agent.clone()]
            } else {
                executors.clone()
            };
            if self.scope == TaskScope::Local && sub_task_agents.iter().any(|a| a != &self.agent)
            {
                return Err(ObshellError::illegal_argument(format!(
                    "本地 Dag 的节点 {} 只能在 {} 上执行",
                    node.struct_name, self.agent
                )));
            }

            let sub_tasks = sub_task_agents
                .into_iter()
                .map(|executor| SubTaskPlan {
                    name: name.clone(),
                    struct_name: node.struct_name.clone(),
                    executor,
                })
                .collect();
            nodes.push(NodePlan {
                name,
                capabilities,
                executors,
                sub_tasks,
            });
        }

        let dag = self
            .store
            .create_dag(&DagPlan {
                name: template.name.clone(),
                dag_type: template.dag_type,
                maintenance_type: template.maintenance_type,
                executor: self.agent.clone(),
                context,
                nodes,
            })
            .await?;
        info!(dag_id = dag.id, "创建 Dag {} ({} 个节点)", dag.name, dag.max_stage);
        Ok(dag)
    }

    pub async fn get_dag(&self, id: i64) -> ObshellResult<Dag> {
        self.store
            .get_dag(id)
            .await?
            .ok_or_else(|| ObshellError::dag_not_found(id))
    }

    pub async fn dag_detail(&self, id: i64, show_details: bool) -> ObshellResult<DagDetail> {
        let dag = self.get_dag(id).await?;
        self.render_dag(&dag, show_details).await
    }

    pub async fn node_detail(&self, id: i64, show_details: bool) -> ObshellResult<NodeDetail> {
        let node = self
            .store
            .get_node(id)
            .await?
            .ok_or_else(|| ObshellError::node_not_found(id))?;
        let dag = self.get_dag(node.dag_id).await?;
        self.render_node(&dag.executor, &node, show_details).await
    }

    pub async fn sub_task_detail(&self, id: i64) -> ObshellResult<SubTaskDetail> {
        let sub_task = self
            .store
            .get_sub_task(id)
            .await?
            .ok_or_else(|| ObshellError::sub_task_not_found(id))?;
        let owner = self.owner_of(&sub_task).await?;
        let logs = self.latest_logs(&sub_task).await?;
        Ok(SubTaskDetail::new(self.scope, &owner, &sub_task, logs))
    }

    pub async fn list_unfinished(&self) -> ObshellResult<Vec<DagDetail>> {
        let dags = self.store.list_unfinished_dags().await?;
        Ok(dags.iter().map(DagDetail::new).collect())
    }

    /// 当前未结束的运维 Dag, `None` 表示任意运维类型
    pub async fn find_maintenance(
        &self,
        maintenance_type: Option<MaintenanceType>,
    ) -> ObshellResult<Option<DagDetail>> {
        let dag = self.store.find_maintenance_dag(maintenance_type).await?;
        Ok(dag.as_ref().map(DagDetail::new))
    }

    /// 执行人工操作, 条件更新冲突时重新读取后重试
    #[instrument(skip(self))]
    pub async fn operate(&self, id: i64, operator: Operator) -> ObshellResult<Dag> {
        for _ in 0..OPERATE_RETRY {
            let dag = self.get_dag(id).await?;
            let result = match operator {
                Operator::Retry => self.retry(&dag).await,
                Operator::Rollback => self.rollback(&dag).await,
                Operator::Cancel => self.cancel(&dag).await,
                Operator::Pass => self.pass(&dag).await,
                Operator::Run => Err(ObshellError::operator_not_supported(
                    "RUN 只能在创建 Dag 时使用",
                )),
            };
            match result {
                Ok(()) => {
                    info!(dag_id = id, "Dag {} 执行操作 {}", dag.name, operator);
                    return self.get_dag(id).await;
                }
                Err(ObshellError::NoAffectedRows(msg)) => {
                    debug!(dag_id = id, "操作 {} 冲突, 重新读取: {}", operator, msg);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ObshellError::conflict(format!(
            "Dag {id} 状态持续变化, 请稍后重试"
        )))
    }

    /// 跳过节点, 只允许作用于 Dag 当前所在的节点; 已经跳过的节点再次跳过不做任何事
    pub async fn pass_node(&self, node_id: i64) -> ObshellResult<Dag> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ObshellError::node_not_found(node_id))?;
        let dag = self.get_dag(node.dag_id).await?;
        if node.stage != dag.stage {
            if self.is_passed(&node).await? {
                debug!(dag_id = dag.id, "节点 {} 已经跳过", node.name);
                return Ok(dag);
            }
            return Err(ObshellError::operator_not_supported(format!(
                "节点 {} 不是 Dag {} 的当前节点",
                node.name, dag.id
            )));
        }
        self.operate(dag.id, Operator::Pass).await
    }

    /// 节点的子任务全部成功, 且至少一个是人工跳过的
    async fn is_passed(&self, node: &Node) -> ObshellResult<bool> {
        let sub_tasks = self.store.list_sub_tasks(node.id).await?;
        Ok(sub_tasks.iter().all(|s| s.state == State::Succeed)
            && sub_tasks.iter().any(|s| s.operator == Operator::Pass))
    }

    async fn retry(&self, dag: &Dag) -> ObshellResult<()> {
        if dag.state == State::Succeed {
            return Ok(());
        }
        if dag.state != State::Failed {
            return Err(ObshellError::operator_not_supported(format!(
                "Dag {} 处于 {}, 不能重试",
                dag.id, dag.state
            )));
        }
        let node = self.current_node(dag).await?;
        if !node.capabilities.can_retry && !dag.is_rollback() {
            return Err(ObshellError::operator_not_supported(format!(
                "节点 {} 不支持重试",
                node.name
            )));
        }

        // 回滚失败后的重试继续回滚
        let operator = if dag.is_rollback() {
            Operator::Rollback
        } else {
            Operator::Retry
        };
        let transition = DagTransition::from_dag(dag)
            .state(State::Ready)
            .operator(operator)
            .finished(false)
            .node_state(node.id, State::Ready)
            .reset_sub_tasks(SubTaskReset::new(
                node.id,
                &[State::Failed, State::Canceled],
                State::Pending,
                operator,
            ));
        self.store.transition_dag(&self.reopen(dag, transition)).await
    }

    async fn rollback(&self, dag: &Dag) -> ObshellResult<()> {
        let allowed = match dag.state {
            State::Failed => dag.operator.is_forward(),
            State::Canceled => dag.operator == Operator::Cancel,
            State::Succeed => true,
            _ => false,
        };
        if !allowed {
            return Err(ObshellError::operator_not_supported(format!(
                "Dag {} 处于 {} ({}), 不能回滚",
                dag.id, dag.state, dag.operator
            )));
        }
        let node = self.current_node(dag).await?;
        if !node.capabilities.can_rollback {
            return Err(ObshellError::operator_not_supported(format!(
                "节点 {} 不支持回滚",
                node.name
            )));
        }

        let transition = DagTransition::from_dag(dag)
            .state(State::Ready)
            .operator(Operator::Rollback)
            .finished(false)
            .node_state(node.id, State::Ready)
            .reset_sub_tasks(
                SubTaskReset::new(
                    node.id,
                    &[State::Pending, State::Canceled],
                    State::Succeed,
                    Operator::Rollback,
                )
                .executed(false),
            )
            .reset_sub_tasks(
                SubTaskReset::new(
                    node.id,
                    &[State::Succeed, State::Failed, State::Canceled, State::Pending],
                    State::Pending,
                    Operator::Rollback,
                )
                .executed(true),
            );
        self.store.transition_dag(&self.reopen(dag, transition)).await
    }

    async fn cancel(&self, dag: &Dag) -> ObshellResult<()> {
        if dag.operator == Operator::Cancel
            && matches!(dag.state, State::Cancelling | State::Canceled)
        {
            return Ok(());
        }

        match dag.state {
            State::Pending | State::Ready | State::Running if dag.operator.is_forward() => {}
            // 等待人工处理的失败 Dag 直接放弃, 释放运维锁
            State::Failed if !dag.is_finished => {
                let mut transition = DagTransition::from_dag(dag)
                    .state(State::Canceled)
                    .operator(Operator::Cancel)
                    .finished(true);
                if let Some(node) = self.store.get_node_by_stage(dag.id, dag.stage).await? {
                    transition = transition.node_state(node.id, State::Canceled);
                }
                return self.store.transition_dag(&transition).await;
            }
            _ => {
                return Err(ObshellError::operator_not_supported(format!(
                    "Dag {} 处于 {} ({}), 不能取消",
                    dag.id, dag.state, dag.operator
                )))
            }
        }

        let node = self.store.get_node_by_stage(dag.id, dag.stage).await?;
        let mut transition = DagTransition::from_dag(dag)
            .state(State::Cancelling)
            .operator(Operator::Cancel);
        if let Some(node) = &node {
            if node.state != State::Pending && !node.capabilities.can_cancel {
                return Err(ObshellError::operator_not_supported(format!(
                    "节点 {} 不支持取消",
                    node.name
                )));
            }
            transition = transition.node_state(node.id, State::Cancelling);
        }
        self.store.transition_dag(&transition).await?;

        // 尽快让运行中的子任务看到取消标记, 调度器之后每轮还会补发
        if let Some(node) = node {
            for sub_task in self.store.list_sub_tasks(node.id).await? {
                if sub_task.state.is_active() {
                    self.store.cancel_sub_task(sub_task.id).await?;
                }
            }
        }
        Ok(())
    }

    async fn pass(&self, dag: &Dag) -> ObshellResult<()> {
        if dag.operator == Operator::Pass && dag.state != State::Failed {
            return Ok(());
        }
        if dag.state != State::Failed || !dag.operator.is_forward() {
            return Err(ObshellError::operator_not_supported(format!(
                "Dag {} 处于 {} ({}), 不能跳过",
                dag.id, dag.state, dag.operator
            )));
        }
        let node = self.current_node(dag).await?;
        if !node.capabilities.can_pass {
            return Err(ObshellError::operator_not_supported(format!(
                "节点 {} 不支持跳过",
                node.name
            )));
        }

        let transition = DagTransition::from_dag(dag)
            .state(State::Ready)
            .operator(Operator::Pass)
            .finished(false)
            .node_state(node.id, State::Ready)
            .reset_sub_tasks(SubTaskReset::new(
                node.id,
                &[State::Failed, State::Canceled],
                State::Succeed,
                Operator::Pass,
            ));
        self.store.transition_dag(&self.reopen(dag, transition)).await
    }

    /// 重新打开已结束的运维 Dag 前需要再次确认运维锁
    fn reopen(&self, dag: &Dag, transition: DagTransition) -> DagTransition {
        if dag.is_finished {
            transition.recheck_maintenance(dag.maintenance_type)
        } else {
            transition
        }
    }

    async fn current_node(&self, dag: &Dag) -> ObshellResult<Node> {
        self.store
            .get_node_by_stage(dag.id, dag.stage)
            .await?
            .ok_or_else(|| {
                ObshellError::operator_not_supported(format!("Dag {} 尚未开始执行", dag.id))
            })
    }

    async fn render_dag(&self, dag: &Dag, show_details: bool) -> ObshellResult<DagDetail> {
        let mut detail = DagDetail::new(dag);
        if show_details {
            for node in self.store.list_nodes(dag.id).await? {
                detail
                    .nodes
                    .push(self.render_node(&dag.executor, &node, true).await?);
            }
        }
        Ok(detail)
    }

    async fn render_node(
        &self,
        owner: &AgentInfo,
        node: &Node,
        show_details: bool,
    ) -> ObshellResult<NodeDetail> {
        let mut detail = NodeDetail::new(self.scope, owner, node);
        if show_details {
            for sub_task in self.store.list_sub_tasks(node.id).await? {
                let logs = self.latest_logs(&sub_task).await?;
                detail
                    .sub_tasks
                    .push(SubTaskDetail::new(self.scope, owner, &sub_task, logs));
            }
        }
        Ok(detail)
    }

    /// 子任务所属 Dag 的发起代理; 镜像子任务属于本代理
    async fn owner_of(&self, sub_task: &SubTask) -> ObshellResult<AgentInfo> {
        if sub_task.is_mirror() {
            return Ok(self.agent.clone());
        }
        let node = self
            .store
            .get_node(sub_task.node_id)
            .await?
            .ok_or_else(|| ObshellError::node_not_found(sub_task.node_id))?;
        Ok(self.get_dag(node.dag_id).await?.executor)
    }

    async fn latest_logs(&self, sub_task: &SubTask) -> ObshellResult<Vec<String>> {
        if sub_task.execute_times == 0 {
            return Ok(Vec::new());
        }
        let logs = self
            .store
            .list_sub_task_logs(sub_task.id, Some(sub_task.execute_times))
            .await?;
        Ok(logs.into_iter().map(|l| l.log_content).collect())
    }
}
