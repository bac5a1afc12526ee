use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obshell_core::constants::AGENT_RESTARTED_LOG;
use obshell_domain::entities::{
    AgentInfo, DagType, MaintenanceType, Operator, State, SubTask, TaskCapabilities, TaskContext,
};
use obshell_domain::repositories::{DagPlan, NodePlan, SubTaskPlan, TaskStore};
use obshell_errors::{ObshellError, ObshellResult};
use obshell_infrastructure::{DatabaseManager, SqliteTaskStore, StoreRole};
use obshell_worker::{
    ExecutableTask, NoopTask, RunOutcome, SubTaskExecutor, SubTaskRunner, TaskRegistry,
    TaskRuntime,
};

fn agent() -> AgentInfo {
    AgentInfo::new("127.0.0.1", 2886)
}

struct FailingTask;

#[async_trait]
impl ExecutableTask for FailingTask {
    fn name(&self) -> &str {
        "failing"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default().with_retry()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        runtime.execute_log("about to fail");
        Err(ObshellError::task_execution("boom"))
    }
}

struct PanickingTask;

#[async_trait]
impl ExecutableTask for PanickingTask {
    fn name(&self) -> &str {
        "panicking"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default()
    }

    async fn execute(&self, _runtime: &TaskRuntime) -> ObshellResult<()> {
        panic!("task exploded");
    }
}

/// 每 20ms 检查一次取消信号
struct LoopingTask {
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecutableTask for LoopingTask {
    fn name(&self) -> &str {
        "looping"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default().with_cancel()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        for _ in 0..250 {
            runtime.timeout_check()?;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

struct ContextTask;

#[async_trait]
impl ExecutableTask for ContextTask {
    fn name(&self) -> &str {
        "context"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default().with_continue()
    }

    async fn execute(&self, runtime: &TaskRuntime) -> ObshellResult<()> {
        let x: i64 = runtime.get_param("x")?;
        runtime.set_data("doubled", x * 2);
        runtime.set_data("continued", runtime.is_continue());
        Ok(())
    }
}

async fn setup(struct_name: &str) -> (Arc<SqliteTaskStore>, TaskRegistry, SubTask) {
    let db = DatabaseManager::in_memory(StoreRole::Local).await.unwrap();
    db.migrate().await.unwrap();
    let store = Arc::new(SqliteTaskStore::new(db.pool().clone()));

    let registry = TaskRegistry::new();
    registry.register("noop", NoopTask::default).await;
    registry.register("failing", || FailingTask).await;
    registry.register("panicking", || PanickingTask).await;
    registry.register("context", || ContextTask).await;

    let dag = store
        .create_dag(&DagPlan {
            name: "test".to_string(),
            dag_type: DagType::Local,
            maintenance_type: MaintenanceType::None,
            executor: agent(),
            context: TaskContext::new().with_param("x", 21),
            nodes: vec![NodePlan {
                name: struct_name.to_string(),
                capabilities: TaskCapabilities::default(),
                executors: vec![],
                sub_tasks: vec![SubTaskPlan {
                    name: struct_name.to_string(),
                    struct_name: struct_name.to_string(),
                    executor: agent(),
                }],
            }],
        })
        .await
        .unwrap();
    let node = store.get_node_by_stage(dag.id, 1).await.unwrap().unwrap();
    let sub_task = store.list_sub_tasks(node.id).await.unwrap().remove(0);
    (store, registry, sub_task)
}

fn runner(store: &Arc<SqliteTaskStore>, registry: &TaskRegistry) -> SubTaskRunner {
    SubTaskRunner::new(
        store.clone() as Arc<dyn TaskStore>,
        registry.clone(),
        agent(),
        Duration::from_millis(20),
    )
}

#[tokio::test]
async fn test_successful_run_writes_context_back() {
    let (store, registry, sub_task) = setup("context").await;
    let outcome = runner(&store, &registry).run(sub_task.clone()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(State::Succeed));

    let done = store.get_sub_task(sub_task.id).await.unwrap().unwrap();
    assert_eq!(done.state, State::Succeed);
    assert_eq!(done.execute_times, 1);
    assert_eq!(done.context.get_data::<i64>("doubled"), Some(42));
    assert_eq!(done.context.get_data::<bool>("continued"), Some(false));
    assert!(done.end_time.unwrap() >= done.start_time.unwrap());
}

#[tokio::test]
async fn test_failure_is_logged() {
    let (store, registry, sub_task) = setup("failing").await;
    let outcome = runner(&store, &registry).run(sub_task.clone()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(State::Failed));

    let logs = store.list_sub_task_logs(sub_task.id, Some(1)).await.unwrap();
    let lines: Vec<&str> = logs.iter().map(|l| l.log_content.as_str()).collect();
    assert_eq!(lines, vec!["about to fail", "boom"]);
}

#[tokio::test]
async fn test_panic_is_captured_as_failure() {
    let (store, registry, sub_task) = setup("panicking").await;
    let outcome = runner(&store, &registry).run(sub_task.clone()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(State::Failed));

    let logs = store.list_sub_task_logs(sub_task.id, None).await.unwrap();
    assert!(logs.last().unwrap().log_content.contains("task exploded"));
}

#[tokio::test]
async fn test_unregistered_struct_fails() {
    let (store, registry, sub_task) = setup("missing").await;
    let outcome = runner(&store, &registry).run(sub_task).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(State::Failed));
}

#[tokio::test]
async fn test_second_runner_loses_the_race() {
    let (store, registry, sub_task) = setup("noop").await;
    let first = runner(&store, &registry).run(sub_task.clone()).await.unwrap();
    assert_eq!(first, RunOutcome::Finished(State::Succeed));

    // 使用过期快照的第二个执行者不能再次执行
    let second = runner(&store, &registry).run(sub_task.clone()).await.unwrap();
    assert_eq!(second, RunOutcome::Skipped);
    let done = store.get_sub_task(sub_task.id).await.unwrap().unwrap();
    assert_eq!(done.execute_times, 1);
}

#[tokio::test]
async fn test_cancel_flag_stops_running_task() {
    let (store, registry, sub_task) = setup("looping").await;
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    registry
        .register("looping", move || LoopingTask {
            started: counter.clone(),
        })
        .await;

    let executor = SubTaskExecutor::new(Arc::new(runner(&store, &registry)), 4);
    assert!(executor.submit(sub_task.clone()).await);
    assert!(executor.is_running(sub_task.id).await);
    // 同一子任务不会重复提交
    assert!(!executor.submit(sub_task.clone()).await);

    for _ in 0..100 {
        if started.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.cancel_sub_task(sub_task.id).await.unwrap());

    let mut state = State::Running;
    for _ in 0..50 {
        state = store.get_sub_task(sub_task.id).await.unwrap().unwrap().state;
        if state == State::Canceled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, State::Canceled);

    for _ in 0..50 {
        if executor.running_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!executor.is_running(sub_task.id).await);
}

#[tokio::test]
async fn test_pending_cancel_skips_execution() {
    let (store, registry, sub_task) = setup("noop").await;
    store.cancel_sub_task(sub_task.id).await.unwrap();
    let pending = store.get_sub_task(sub_task.id).await.unwrap().unwrap();

    let outcome = runner(&store, &registry).run(pending).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(State::Canceled));
    let done = store.get_sub_task(sub_task.id).await.unwrap().unwrap();
    assert_eq!(done.execute_times, 0);
}

#[tokio::test]
async fn test_resume_and_orphan_handling() {
    let (store, registry, sub_task) = setup("context").await;
    store
        .ready_sub_task(sub_task.id, 0, Operator::Run, &agent(), &sub_task.context)
        .await
        .unwrap();
    store.start_sub_task(sub_task.id, 1).await.unwrap();
    let orphan = store.get_sub_task(sub_task.id).await.unwrap().unwrap();

    let outcome = runner(&store, &registry).resume(orphan).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(State::Succeed));
    let done = store.get_sub_task(sub_task.id).await.unwrap().unwrap();
    assert_eq!(done.execute_times, 1);
    assert_eq!(done.context.get_data::<bool>("continued"), Some(true));
}

#[tokio::test]
async fn test_fail_orphan_records_restart() {
    let (store, registry, sub_task) = setup("noop").await;
    store
        .ready_sub_task(sub_task.id, 0, Operator::Run, &agent(), &sub_task.context)
        .await
        .unwrap();
    store.start_sub_task(sub_task.id, 1).await.unwrap();
    let orphan = store.get_sub_task(sub_task.id).await.unwrap().unwrap();

    let outcome = runner(&store, &registry).fail_orphan(&orphan, AGENT_RESTARTED_LOG).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(State::Failed));
    let logs = store.list_sub_task_logs(sub_task.id, Some(1)).await.unwrap();
    assert_eq!(logs.last().unwrap().log_content, AGENT_RESTARTED_LOG);
}
