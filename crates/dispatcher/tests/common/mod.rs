#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obshell_dispatcher::{
    DagScheduler, DagService, Dispatch, RecoveryService, TaskEngine, TaskMappingService,
};
use obshell_domain::{
    entities::{
        AgentInfo, Dag, MaintenanceType, Node, Operator, State, SubTask, SubTaskLog,
        TaskCapabilities, TaskContext, TaskMapping, TaskScope,
    },
    ports::{MappingAck, MirrorSnapshot, RemoteSubTask, RemoteTaskClient},
    repositories::{DagPlan, DagTransition, MirrorPlan, SubTaskSnapshot, TaskStore},
};
use obshell_errors::{ObshellError, ObshellResult};
use obshell_infrastructure::{DatabaseManager, SqliteTaskStore, StoreRole};
use obshell_worker::{
    register_builtin_tasks, ExecutableTask, SubTaskExecutor, SubTaskRunner, TaskRegistry,
    TaskRuntime,
};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

pub const POLL: Duration = Duration::from_millis(20);

pub fn agent(ip: &str) -> AgentInfo {
    AgentInfo::new(ip, 2886)
}

pub async fn database(role: StoreRole) -> DatabaseManager {
    let db = DatabaseManager::in_memory(role).await.unwrap();
    db.migrate().await.unwrap();
    db
}

pub async fn task_store(db: &DatabaseManager) -> Arc<dyn TaskStore> {
    Arc::new(SqliteTaskStore::new(db.pool().clone()))
}

/// 前 `fail_times` 次执行失败
pub struct FlakyTask {
    pub attempts: Arc<AtomicUsize>,
    pub fail_times: usize,
}

#[async_trait]
impl ExecutableTask for FlakyTask {
    fn name(&self) -> &str {
        "flaky"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default().with_retry().with_pass()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        runtime.execute_log(format!("attempt {attempt}"));
        if attempt <= self.fail_times {
            return Err(ObshellError::task_execution(format!("attempt {attempt} failed")));
        }
        Ok(())
    }
}

/// 按执行代理决定耗时和结果, 用于模拟慢节点和故障节点
#[derive(Clone, Default)]
pub struct PerAgentTask {
    pub delays: HashMap<AgentInfo, Duration>,
    pub failing: Vec<AgentInfo>,
}

#[async_trait]
impl ExecutableTask for PerAgentTask {
    fn name(&self) -> &str {
        "per_agent"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default()
            .with_cancel()
            .with_retry()
            .with_rollback()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        if let Some(delay) = self.delays.get(runtime.agent()) {
            runtime.sleep(*delay).await?;
        }
        if self.failing.contains(runtime.agent()) {
            return Err(ObshellError::task_execution(format!(
                "{} failed",
                runtime.agent()
            )));
        }
        runtime.set_data(format!("done@{}", runtime.agent()), true);
        Ok(())
    }
}

/// 可接续的长任务, 记录是否为接续执行
pub struct ResumableTask {
    pub started: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecutableTask for ResumableTask {
    fn name(&self) -> &str {
        "resumable"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default().with_continue().with_cancel()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let sleep_ms: u64 = runtime.get_param("sleep_ms")?;
        if !runtime.is_continue() {
            runtime.sleep(Duration::from_millis(sleep_ms)).await?;
        }
        runtime.set_data("continued", runtime.is_continue());
        Ok(())
    }
}

/// 按次数注入子任务状态写入失败的元数据库
pub struct FaultyStore {
    inner: Arc<dyn TaskStore>,
    pub start_failures: AtomicUsize,
    pub finish_failures: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn TaskStore>) -> Self {
        Self {
            inner,
            start_failures: AtomicUsize::new(0),
            finish_failures: AtomicUsize::new(0),
        }
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn create_dag(&self, plan: &DagPlan) -> ObshellResult<Dag> {
        self.inner.create_dag(plan).await
    }

    async fn get_dag(&self, id: i64) -> ObshellResult<Option<Dag>> {
        self.inner.get_dag(id).await
    }

    async fn list_unfinished_dags(&self) -> ObshellResult<Vec<Dag>> {
        self.inner.list_unfinished_dags().await
    }

    async fn find_maintenance_dag(
        &self,
        maintenance_type: Option<MaintenanceType>,
    ) -> ObshellResult<Option<Dag>> {
        self.inner.find_maintenance_dag(maintenance_type).await
    }

    async fn transition_dag(&self, transition: &DagTransition) -> ObshellResult<()> {
        self.inner.transition_dag(transition).await
    }

    async fn get_node(&self, id: i64) -> ObshellResult<Option<Node>> {
        self.inner.get_node(id).await
    }

    async fn list_nodes(&self, dag_id: i64) -> ObshellResult<Vec<Node>> {
        self.inner.list_nodes(dag_id).await
    }

    async fn get_node_by_stage(&self, dag_id: i64, stage: i32) -> ObshellResult<Option<Node>> {
        self.inner.get_node_by_stage(dag_id, stage).await
    }

    async fn get_sub_task(&self, id: i64) -> ObshellResult<Option<SubTask>> {
        self.inner.get_sub_task(id).await
    }

    async fn list_sub_tasks(&self, node_id: i64) -> ObshellResult<Vec<SubTask>> {
        self.inner.list_sub_tasks(node_id).await
    }

    async fn list_active_sub_tasks(&self, executor: &AgentInfo) -> ObshellResult<Vec<SubTask>> {
        self.inner.list_active_sub_tasks(executor).await
    }

    async fn list_pending_mirrors(&self) -> ObshellResult<Vec<SubTask>> {
        self.inner.list_pending_mirrors().await
    }

    async fn ready_sub_task(
        &self,
        id: i64,
        expected_execute_times: i32,
        operator: Operator,
        executor: &AgentInfo,
        context: &TaskContext,
    ) -> ObshellResult<()> {
        self.inner
            .ready_sub_task(id, expected_execute_times, operator, executor, context)
            .await
    }

    async fn start_sub_task(&self, id: i64, execute_times: i32) -> ObshellResult<()> {
        if take_failure(&self.start_failures) {
            return Err(ObshellError::internal("database is locked"));
        }
        self.inner.start_sub_task(id, execute_times).await
    }

    async fn finish_sub_task(
        &self,
        id: i64,
        execute_times: i32,
        state: State,
        context: &TaskContext,
        logs: &[String],
    ) -> ObshellResult<()> {
        if take_failure(&self.finish_failures) {
            return Err(ObshellError::internal("database is locked"));
        }
        self.inner
            .finish_sub_task(id, execute_times, state, context, logs)
            .await
    }

    async fn transit_sub_task(
        &self,
        id: i64,
        from: &[State],
        to: State,
        operator: Operator,
    ) -> ObshellResult<()> {
        self.inner.transit_sub_task(id, from, to, operator).await
    }

    async fn cancel_sub_task(&self, id: i64) -> ObshellResult<bool> {
        self.inner.cancel_sub_task(id).await
    }

    async fn apply_snapshot(&self, id: i64, snapshot: &SubTaskSnapshot) -> ObshellResult<bool> {
        self.inner.apply_snapshot(id, snapshot).await
    }

    async fn append_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: i32,
        lines: &[String],
    ) -> ObshellResult<()> {
        self.inner
            .append_sub_task_logs(sub_task_id, execute_times, lines)
            .await
    }

    async fn replace_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: i32,
        lines: &[String],
    ) -> ObshellResult<()> {
        self.inner
            .replace_sub_task_logs(sub_task_id, execute_times, lines)
            .await
    }

    async fn list_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: Option<i32>,
    ) -> ObshellResult<Vec<SubTaskLog>> {
        self.inner
            .list_sub_task_logs(sub_task_id, execute_times)
            .await
    }

    async fn create_mirror(&self, remote_task_id: i64, plan: &MirrorPlan) -> ObshellResult<SubTask> {
        self.inner.create_mirror(remote_task_id, plan).await
    }

    async fn get_mapping_by_remote(&self, remote_task_id: i64) -> ObshellResult<Option<TaskMapping>> {
        self.inner.get_mapping_by_remote(remote_task_id).await
    }

    async fn list_unsynced_mappings(&self) -> ObshellResult<Vec<TaskMapping>> {
        self.inner.list_unsynced_mappings().await
    }

    async fn ack_mapping(&self, mapping_id: i64, sync_version: i64) -> ObshellResult<bool> {
        self.inner.ack_mapping(mapping_id, sync_version).await
    }

    async fn reset_mirror(
        &self,
        local_task_id: i64,
        operator: Operator,
        context: &TaskContext,
    ) -> ObshellResult<()> {
        self.inner.reset_mirror(local_task_id, operator, context).await
    }
}

/// 一个代理的本地侧: 本地元数据库、执行器、本地调度器和任务映射
pub struct LocalAgent {
    pub agent: AgentInfo,
    pub db: DatabaseManager,
    pub store: Arc<dyn TaskStore>,
    pub registry: TaskRegistry,
    pub executor: Arc<SubTaskExecutor>,
    pub scheduler: Arc<DagScheduler>,
    pub mapping: Arc<TaskMappingService>,
}

impl LocalAgent {
    pub async fn start(agent: AgentInfo, registry: TaskRegistry) -> Self {
        let db = database(StoreRole::Local).await;
        let store = task_store(&db).await;
        Self::with_store(agent, db, store, registry)
    }

    pub fn with_store(
        agent: AgentInfo,
        db: DatabaseManager,
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
    ) -> Self {
        let runner = Arc::new(SubTaskRunner::new(
            store.clone(),
            registry.clone(),
            agent.clone(),
            POLL,
        ));
        let executor = Arc::new(SubTaskExecutor::new(runner, 8));
        let scheduler = Arc::new(DagScheduler::new(
            TaskScope::Local,
            store.clone(),
            agent.clone(),
            Dispatch::Local(executor.clone()),
        ));
        let mapping = Arc::new(TaskMappingService::new(store.clone(), agent.clone()));
        Self {
            agent,
            db,
            store,
            registry,
            executor,
            scheduler,
            mapping,
        }
    }

    /// 模拟进程重启: 保留元数据库, 重新创建执行器和调度器
    pub fn restart(self) -> Self {
        Self::with_store(self.agent, self.db, self.store, self.registry)
    }

    pub fn engine(&self) -> TaskEngine {
        let recovery = RecoveryService::new(
            self.store.clone(),
            self.executor.clone(),
            self.registry.clone(),
            self.agent.clone(),
        );
        TaskEngine::new(self.scheduler.clone(), recovery, self.executor.clone(), POLL)
    }

    pub fn dag_service(&self) -> DagService {
        DagService::new(
            TaskScope::Local,
            self.store.clone(),
            self.registry.clone(),
            self.agent.clone(),
        )
    }
}

/// 后台运行的本地任务引擎
pub struct RunningEngine {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningEngine {
    pub fn spawn(engine: TaskEngine) -> Self {
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { engine.run(rx).await });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap();
    }
}

pub async fn builtin_registry() -> TaskRegistry {
    let registry = TaskRegistry::new();
    register_builtin_tasks(&registry).await;
    registry
}

/// 进程内的代理路由, 代替 HTTP 客户端
#[derive(Default)]
pub struct InProcessCluster {
    agents: RwLock<HashMap<AgentInfo, Arc<TaskMappingService>>>,
    pub dispatched: AtomicUsize,
}

impl InProcessCluster {
    pub async fn add(&self, agent: AgentInfo, mapping: Arc<TaskMappingService>) {
        self.agents.write().await.insert(agent, mapping);
    }

    async fn route(&self, agent: &AgentInfo) -> ObshellResult<Arc<TaskMappingService>> {
        self.agents
            .read()
            .await
            .get(agent)
            .cloned()
            .ok_or_else(|| ObshellError::network(format!("{agent} 不可达")))
    }
}

#[async_trait]
impl RemoteTaskClient for InProcessCluster {
    async fn dispatch_sub_task(&self, agent: &AgentInfo, task: &RemoteSubTask) -> ObshellResult<()> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        self.route(agent).await?.accept(task).await
    }

    async fn fetch_unsynced(&self, agent: &AgentInfo) -> ObshellResult<Vec<MirrorSnapshot>> {
        self.route(agent).await?.unsynced().await
    }

    async fn ack_synced(&self, agent: &AgentInfo, acks: &[MappingAck]) -> ObshellResult<()> {
        self.route(agent).await?.ack(acks).await.map(|_| ())
    }
}

/// 轮询直到条件成立, 超时则失败
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_dag_state(store: &Arc<dyn TaskStore>, dag_id: i64, state: State) -> Dag {
    let reached = wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            matches!(store.get_dag(dag_id).await, Ok(Some(dag)) if dag.state == state)
        }
    })
    .await;
    let dag = store.get_dag(dag_id).await.unwrap().unwrap();
    assert!(reached, "Dag {} 停留在 {} (期望 {})", dag_id, dag.state, state);
    dag
}

pub async fn sub_tasks_at(store: &Arc<dyn TaskStore>, dag_id: i64, stage: i32) -> Vec<SubTask> {
    let node = store
        .get_node_by_stage(dag_id, stage)
        .await
        .unwrap()
        .unwrap();
    store.list_sub_tasks(node.id).await.unwrap()
}
