use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use obshell_domain::{
    entities::{AgentInfo, Dag, Node, Operator, State, SubTask, TaskScope},
    ports::{RemoteSubTask, RemoteTaskClient},
    repositories::{DagTransition, SubTaskReset, TaskStore},
};
use obshell_errors::{ObshellError, ObshellResult};
use obshell_worker::SubTaskExecutor;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::barrier::{failed_sub_tasks, NodeProgress};

/// 子任务的执行方式
pub enum Dispatch {
    /// 本地元数据库: 属于本代理的子任务直接交给执行器
    Local(Arc<SubTaskExecutor>),
    /// 集群元数据库: 子任务以镜像的形式派发到执行代理
    Remote(Arc<dyn RemoteTaskClient>),
}

type DispatchKey = (i32, State, Operator);

/// Dag 调度器
///
/// 每一轮扫描所有未结束的 Dag, 根据 (state, operator, stage) 推进一步。
/// 所有推进都是条件更新, 多个调度器同时推进同一个 Dag 时只有一个生效。
pub struct DagScheduler {
    scope: TaskScope,
    store: Arc<dyn TaskStore>,
    agent: AgentInfo,
    dispatch: Dispatch,
    /// 已派发的集群子任务, 状态不变时不再重复派发
    dispatched: Mutex<HashMap<i64, DispatchKey>>,
}

impl DagScheduler {
    pub fn new(
        scope: TaskScope,
        store: Arc<dyn TaskStore>,
        agent: AgentInfo,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            scope,
            store,
            agent,
            dispatch,
            dispatched: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> TaskScope {
        self.scope
    }

    /// 执行一轮调度
    pub async fn tick(&self) -> ObshellResult<()> {
        let dags = self.store.list_unfinished_dags().await?;
        let mut live = HashSet::new();

        for dag in &dags {
            match self.schedule_dag(dag, &mut live).await {
                Ok(()) => {}
                Err(ObshellError::NoAffectedRows(msg)) => {
                    debug!(dag_id = dag.id, "Dag 已被其他调度者推进: {}", msg);
                }
                Err(e) => warn!(dag_id = dag.id, "调度 Dag {} 失败: {}", dag.name, e),
            }
        }

        match &self.dispatch {
            Dispatch::Local(executor) => {
                for mirror in self.store.list_pending_mirrors().await? {
                    if mirror.executor == self.agent {
                        executor.submit(mirror).await;
                    }
                }
            }
            Dispatch::Remote(_) => {
                self.dispatched
                    .lock()
                    .await
                    .retain(|id, _| live.contains(id));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, dag, live), fields(dag_id = dag.id, state = %dag.state, stage = dag.stage))]
    async fn schedule_dag(&self, dag: &Dag, live: &mut HashSet<i64>) -> ObshellResult<()> {
        match dag.state {
            State::Pending => self.start(dag).await,
            State::Ready => self.resume(dag).await,
            State::Running => self.run_stage(dag, live).await,
            State::Cancelling => self.drive_cancel(dag, live).await,
            State::Failed | State::Succeed | State::Canceled => Ok(()),
        }
    }

    async fn start(&self, dag: &Dag) -> ObshellResult<()> {
        let first = self.node_at(dag, 1).await?;
        let transition = DagTransition::from_dag(dag)
            .state(State::Running)
            .stage(1)
            .node_state(first.id, State::Running);
        self.store.transition_dag(&transition).await?;
        info!(dag_id = dag.id, "Dag {} 开始执行", dag.name);
        Ok(())
    }

    /// 人工操作后重新进入 RUNNING
    async fn resume(&self, dag: &Dag) -> ObshellResult<()> {
        let node = self.node_at(dag, dag.stage).await?;
        let transition = DagTransition::from_dag(dag)
            .state(State::Running)
            .node_state(node.id, State::Running);
        self.store.transition_dag(&transition).await
    }

    async fn run_stage(&self, dag: &Dag, live: &mut HashSet<i64>) -> ObshellResult<()> {
        let node = self.node_at(dag, dag.stage).await?;
        let sub_tasks = self.store.list_sub_tasks(node.id).await?;
        let progress = NodeProgress::from_sub_tasks(&sub_tasks);

        if progress.all_succeed() {
            return if dag.is_rollback() {
                self.step_back(dag, &node).await
            } else {
                self.step_forward(dag, &node, &sub_tasks).await
            };
        }
        if progress.is_failed() {
            return self.fail(dag, &node, &sub_tasks).await;
        }

        let pending: Vec<SubTask> = sub_tasks
            .into_iter()
            .filter(|s| s.state == State::Pending)
            .collect();
        self.dispatch(pending, live).await;
        Ok(())
    }

    async fn step_forward(&self, dag: &Dag, node: &Node, sub_tasks: &[SubTask]) -> ObshellResult<()> {
        let mut context = dag.context.clone();
        for sub_task in sub_tasks {
            context.merge_data(&sub_task.context);
        }

        if dag.stage >= dag.max_stage {
            let transition = DagTransition::from_dag(dag)
                .state(State::Succeed)
                .finished(true)
                .context(context)
                .node_state(node.id, State::Succeed);
            self.store.transition_dag(&transition).await?;
            info!(dag_id = dag.id, "Dag {} 执行成功", dag.name);
            return Ok(());
        }

        let next = self.node_at(dag, dag.stage + 1).await?;
        let transition = DagTransition::from_dag(dag)
            .stage(dag.stage + 1)
            .context(context)
            .node_state(node.id, State::Succeed)
            .node_state(next.id, State::Running)
            .propagate_context_to(next.id);
        self.store.transition_dag(&transition).await?;
        debug!(dag_id = dag.id, "Dag {} 进入第 {} 步: {}", dag.name, next.stage, next.name);
        Ok(())
    }

    async fn step_back(&self, dag: &Dag, node: &Node) -> ObshellResult<()> {
        if dag.stage <= 1 {
            let transition = DagTransition::from_dag(dag)
                .state(State::Canceled)
                .finished(true)
                .node_state(node.id, State::Canceled);
            self.store.transition_dag(&transition).await?;
            info!(dag_id = dag.id, "Dag {} 回滚完成", dag.name);
            return Ok(());
        }

        let previous = self.node_at(dag, dag.stage - 1).await?;
        let mut transition = DagTransition::from_dag(dag)
            .stage(dag.stage - 1)
            .node_state(node.id, State::Canceled)
            .node_state(previous.id, State::Running);
        transition = if previous.capabilities.can_rollback {
            transition
                .reset_sub_tasks(
                    SubTaskReset::new(
                        previous.id,
                        &[State::Succeed, State::Failed, State::Canceled],
                        State::Pending,
                        Operator::Rollback,
                    )
                    .executed(true),
                )
                .reset_sub_tasks(
                    SubTaskReset::new(
                        previous.id,
                        &[State::Pending, State::Canceled],
                        State::Succeed,
                        Operator::Rollback,
                    )
                    .executed(false),
                )
        } else {
            // 不支持回滚的节点直接视为回滚完成
            transition.reset_sub_tasks(SubTaskReset::new(
                previous.id,
                &[State::Succeed, State::Failed, State::Canceled, State::Pending],
                State::Succeed,
                Operator::Rollback,
            ))
        };
        self.store.transition_dag(&transition).await?;
        debug!(dag_id = dag.id, "Dag {} 回滚到第 {} 步", dag.name, previous.stage);
        Ok(())
    }

    async fn fail(&self, dag: &Dag, node: &Node, sub_tasks: &[SubTask]) -> ObshellResult<()> {
        // 回滚失败总是可以重试
        let awaiting = dag.is_rollback() || node.capabilities.awaits_operator();
        let transition = DagTransition::from_dag(dag)
            .state(State::Failed)
            .finished(!awaiting)
            .node_state(node.id, State::Failed);
        self.store.transition_dag(&transition).await?;

        let failing: Vec<String> = failed_sub_tasks(sub_tasks)
            .iter()
            .map(|s| format!("{}@{}", s.id, s.executor))
            .collect();
        warn!(
            dag_id = dag.id,
            "Dag {} 在节点 {} 失败, 失败的子任务: {}",
            dag.name,
            node.name,
            failing.join(", ")
        );
        Ok(())
    }

    /// 取消中: 给活跃的子任务打上取消标记, 全部结束后 Dag 进入 CANCELED
    async fn drive_cancel(&self, dag: &Dag, live: &mut HashSet<i64>) -> ObshellResult<()> {
        let Some(node) = self.store.get_node_by_stage(dag.id, dag.stage).await? else {
            let transition = DagTransition::from_dag(dag)
                .state(State::Canceled)
                .finished(true);
            return self.store.transition_dag(&transition).await;
        };

        let sub_tasks = self.store.list_sub_tasks(node.id).await?;
        let mut active = Vec::new();
        for mut sub_task in sub_tasks {
            if sub_task.state.is_active() {
                self.store.cancel_sub_task(sub_task.id).await?;
                sub_task.operator = Operator::Cancel;
                active.push(sub_task);
            }
        }

        if active.is_empty() {
            let transition = DagTransition::from_dag(dag)
                .state(State::Canceled)
                .finished(true)
                .node_state(node.id, State::Canceled);
            self.store.transition_dag(&transition).await?;
            info!(dag_id = dag.id, "Dag {} 已取消", dag.name);
            return Ok(());
        }

        self.dispatch(active, live).await;
        Ok(())
    }

    async fn dispatch(&self, sub_tasks: Vec<SubTask>, live: &mut HashSet<i64>) {
        match &self.dispatch {
            Dispatch::Local(executor) => {
                for sub_task in sub_tasks {
                    if sub_task.state == State::Pending && sub_task.executor == self.agent {
                        executor.submit(sub_task).await;
                    }
                }
            }
            Dispatch::Remote(client) => {
                live.extend(sub_tasks.iter().map(|s| s.id));
                let mut todo = Vec::new();
                {
                    let dispatched = self.dispatched.lock().await;
                    for sub_task in sub_tasks {
                        let key = (sub_task.execute_times, sub_task.state, sub_task.operator);
                        if dispatched.get(&sub_task.id) != Some(&key) {
                            todo.push((sub_task, key));
                        }
                    }
                }

                let results = join_all(todo.iter().map(|(sub_task, _)| {
                    let task = RemoteSubTask {
                        remote_task_id: sub_task.id,
                        name: sub_task.name.clone(),
                        struct_name: sub_task.struct_name.clone(),
                        state: sub_task.state,
                        operator: sub_task.operator,
                        execute_times: sub_task.execute_times,
                        context: sub_task.context.clone(),
                    };
                    let client = Arc::clone(client);
                    let executor = sub_task.executor.clone();
                    async move { client.dispatch_sub_task(&executor, &task).await }
                }))
                .await;

                let mut dispatched = self.dispatched.lock().await;
                for ((sub_task, key), result) in todo.into_iter().zip(results) {
                    match result {
                        Ok(()) => {
                            debug!(
                                sub_task_id = sub_task.id,
                                "子任务已派发到 {} ({})", sub_task.executor, sub_task.operator
                            );
                            dispatched.insert(sub_task.id, key);
                        }
                        Err(e) => warn!(
                            sub_task_id = sub_task.id,
                            "派发子任务到 {} 失败: {}", sub_task.executor, e
                        ),
                    }
                }
            }
        }
    }

    async fn node_at(&self, dag: &Dag, stage: i32) -> ObshellResult<Node> {
        self.store
            .get_node_by_stage(dag.id, stage)
            .await?
            .ok_or_else(|| ObshellError::node_not_found(format!("{}/{}", dag.id, stage)))
    }
}
