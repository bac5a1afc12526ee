use std::sync::Arc;
use std::time::Duration;

use obshell_domain::{
    entities::{AgentInfo, Operator, State, SubTask},
    repositories::TaskStore,
};
use obshell_errors::{ObshellError, ObshellResult};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::registry::TaskRegistry;
use crate::runtime::TaskRuntime;
use crate::task::ExecutableTask;

const READY_RETRY: usize = 3;

/// 一次执行的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 本次执行写入了终态
    Finished(State),
    /// 条件更新落败, 子任务由其他执行者持有或状态已变化
    Skipped,
}

/// 子任务被放弃时中止任务体
struct AbortOnDrop(JoinHandle<ObshellResult<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 单个子任务的执行流程
///
/// 所有状态变化都通过元数据库的条件更新完成:
/// 1. `state != READY ∧ execute_times == n` → READY, execute_times = n + 1
/// 2. `state == READY ∧ execute_times == n + 1` → RUNNING
/// 3. `state == RUNNING ∧ execute_times == n + 1` → 终态
///
/// 任一步落败即放弃本次执行, 由调度器重新读取后决定。
pub struct SubTaskRunner {
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    agent: AgentInfo,
    poll_interval: Duration,
}

impl SubTaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
        agent: AgentInfo,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            agent,
            poll_interval,
        }
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 从 PENDING 开始执行一次
    #[instrument(skip(self, sub_task), fields(sub_task_id = sub_task.id, name = %sub_task.name))]
    pub async fn run(&self, sub_task: SubTask) -> ObshellResult<RunOutcome> {
        if sub_task.executor != self.agent {
            return Err(ObshellError::illegal_argument(format!(
                "子任务 {} 的执行代理是 {}",
                sub_task.id, sub_task.executor
            )));
        }

        // 提交到真正执行之间可能等待了并发许可, 以数据库中的最新状态为准
        let sub_task = self
            .store
            .get_sub_task(sub_task.id)
            .await?
            .ok_or_else(|| ObshellError::sub_task_not_found(sub_task.id))?;
        if sub_task.state != State::Pending {
            debug!("子任务 {} 已不在PENDING: {}", sub_task.id, sub_task.state);
            return Ok(RunOutcome::Skipped);
        }
        if sub_task.operator == Operator::Cancel {
            return self.cancel_pending(&sub_task).await;
        }

        let Some(sub_task) = self.ready(sub_task).await? else {
            return Ok(RunOutcome::Skipped);
        };
        let execute_times = sub_task.execute_times;

        if let Err(e) = self.store.start_sub_task(sub_task.id, execute_times).await {
            if !matches!(e, ObshellError::NoAffectedRows(_)) {
                return Err(e);
            }
            match self.store.get_sub_task(sub_task.id).await? {
                Some(current) if current.state == State::Running => {
                    warn!("子任务 {} 已在其他执行者上运行", sub_task.id);
                }
                Some(current) => {
                    debug!(
                        "子任务 {} 执行次数竞争失败: {} != {}",
                        sub_task.id, current.execute_times, execute_times
                    );
                }
                None => return Err(ObshellError::sub_task_not_found(sub_task.id)),
            }
            return Ok(RunOutcome::Skipped);
        }

        self.execute(sub_task, false).await
    }

    /// 接续进程重启前未完成的执行, 只用于声明了 `can_continue` 的任务
    #[instrument(skip(self, sub_task), fields(sub_task_id = sub_task.id, name = %sub_task.name))]
    pub async fn resume(&self, sub_task: SubTask) -> ObshellResult<RunOutcome> {
        match sub_task.state {
            State::Ready => {
                match self
                    .store
                    .start_sub_task(sub_task.id, sub_task.execute_times)
                    .await
                {
                    Ok(()) => self.execute(sub_task, false).await,
                    Err(ObshellError::NoAffectedRows(_)) => Ok(RunOutcome::Skipped),
                    Err(e) => Err(e),
                }
            }
            State::Running => {
                info!("接续执行子任务 {} (第 {} 次)", sub_task.id, sub_task.execute_times);
                self.execute(sub_task, true).await
            }
            state => Err(ObshellError::illegal_argument(format!(
                "子任务 {} 处于 {state}, 无法接续",
                sub_task.id
            ))),
        }
    }

    /// 没有执行在途又无法接续的子任务直接失败, `reason` 写入执行日志
    pub async fn fail_orphan(&self, sub_task: &SubTask, reason: &str) -> ObshellResult<RunOutcome> {
        let logs = vec![reason.to_string()];
        let result = match sub_task.state {
            State::Running => {
                self.store
                    .finish_sub_task(
                        sub_task.id,
                        sub_task.execute_times,
                        State::Failed,
                        &sub_task.context,
                        &logs,
                    )
                    .await
            }
            _ => {
                self.store
                    .append_sub_task_logs(sub_task.id, sub_task.execute_times, &logs)
                    .await?;
                self.store
                    .transit_sub_task(sub_task.id, &[State::Ready], State::Failed, sub_task.operator)
                    .await
            }
        };
        match result {
            Ok(()) => Ok(RunOutcome::Finished(State::Failed)),
            Err(ObshellError::NoAffectedRows(_)) => Ok(RunOutcome::Skipped),
            Err(e) => Err(e),
        }
    }

    /// 带取消标记的孤儿子任务直接结束
    pub async fn cancel_orphan(&self, sub_task: &SubTask) -> ObshellResult<RunOutcome> {
        match self
            .store
            .transit_sub_task(
                sub_task.id,
                &[State::Pending, State::Ready, State::Running],
                State::Canceled,
                Operator::Cancel,
            )
            .await
        {
            Ok(()) => Ok(RunOutcome::Finished(State::Canceled)),
            Err(ObshellError::NoAffectedRows(_)) => Ok(RunOutcome::Skipped),
            Err(e) => Err(e),
        }
    }

    async fn cancel_pending(&self, sub_task: &SubTask) -> ObshellResult<RunOutcome> {
        match self
            .store
            .transit_sub_task(sub_task.id, &[State::Pending], State::Canceled, Operator::Cancel)
            .await
        {
            Ok(()) => Ok(RunOutcome::Finished(State::Canceled)),
            Err(ObshellError::NoAffectedRows(_)) => Ok(RunOutcome::Skipped),
            Err(e) => Err(e),
        }
    }

    /// 进入 READY, 返回更新后的子任务; 已被其他执行者接手时返回 `None`
    async fn ready(&self, mut sub_task: SubTask) -> ObshellResult<Option<SubTask>> {
        for _ in 0..READY_RETRY {
            match self
                .store
                .ready_sub_task(
                    sub_task.id,
                    sub_task.execute_times,
                    sub_task.operator,
                    &self.agent,
                    &sub_task.context,
                )
                .await
            {
                Ok(()) => {
                    sub_task.execute_times += 1;
                    sub_task.state = State::Ready;
                    return Ok(Some(sub_task));
                }
                Err(ObshellError::NoAffectedRows(_)) => {
                    let current = self
                        .store
                        .get_sub_task(sub_task.id)
                        .await?
                        .ok_or_else(|| ObshellError::sub_task_not_found(sub_task.id))?;
                    if current.state != State::Pending {
                        debug!("子任务 {} 已被调度: {}", current.id, current.state);
                        return Ok(None);
                    }
                    sub_task = current;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn execute(&self, sub_task: SubTask, is_continue: bool) -> ObshellResult<RunOutcome> {
        let runtime = Arc::new(TaskRuntime::new(
            sub_task.id,
            sub_task.execute_times,
            self.agent.clone(),
            sub_task.context.clone(),
            is_continue,
        ));

        let state = match self.registry.create(&sub_task.struct_name).await {
            Ok(task) => self.drive(&sub_task, task, &runtime).await?,
            Err(e) => {
                runtime.execute_error_log(e.to_string());
                State::Failed
            }
        };

        let logs = runtime.drain_logs();
        match self
            .store
            .finish_sub_task(
                sub_task.id,
                sub_task.execute_times,
                state,
                &runtime.context(),
                &logs,
            )
            .await
        {
            Ok(()) => {
                info!(
                    sub_task_id = sub_task.id,
                    execute_times = sub_task.execute_times,
                    "子任务 {} 执行结束: {}",
                    sub_task.name,
                    state
                );
                Ok(RunOutcome::Finished(state))
            }
            Err(ObshellError::NoAffectedRows(_)) => {
                warn!("子任务 {} 状态已被修改, 放弃本次结果", sub_task.id);
                Ok(RunOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// 根据操作类型运行任务体, 返回应写入的终态
    async fn drive(
        &self,
        sub_task: &SubTask,
        task: Arc<dyn ExecutableTask>,
        runtime: &Arc<TaskRuntime>,
    ) -> ObshellResult<State> {
        let capabilities = task.capabilities();
        match sub_task.operator {
            Operator::Pass => {
                runtime.execute_log("跳过执行");
                return Ok(State::Succeed);
            }
            Operator::Cancel => return Ok(State::Canceled),
            Operator::Rollback if !capabilities.can_rollback => {
                return Ok(State::Succeed);
            }
            _ => {}
        }

        let rollback = sub_task.operator == Operator::Rollback;
        let body_runtime = Arc::clone(runtime);
        let mut body = AbortOnDrop(tokio::spawn(async move {
            if rollback {
                task.rollback(&body_runtime).await
            } else {
                task.execute(&body_runtime).await
            }
        }));

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut body.0 => break joined,
                _ = ticker.tick() => {
                    self.flush_logs(sub_task, runtime).await;
                    if capabilities.can_cancel && !runtime.is_cancelled() {
                        self.watch_cancel(sub_task, runtime).await;
                    }
                }
            }
        };

        Ok(match joined {
            Ok(Ok(())) => State::Succeed,
            Ok(Err(ObshellError::Cancelled)) => {
                runtime.execute_log("任务已取消");
                State::Canceled
            }
            Ok(Err(e)) => {
                runtime.execute_error_log(failure_line(&e));
                State::Failed
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "任务被中止".to_string()
                };
                runtime.execute_error_log(format!("任务异常退出: {message}"));
                State::Failed
            }
        })
    }

    async fn flush_logs(&self, sub_task: &SubTask, runtime: &TaskRuntime) {
        let lines = runtime.drain_logs();
        if lines.is_empty() {
            return;
        }
        if let Err(e) = self
            .store
            .append_sub_task_logs(sub_task.id, sub_task.execute_times, &lines)
            .await
        {
            warn!("刷新子任务 {} 日志失败: {}", sub_task.id, e);
        }
    }

    async fn watch_cancel(&self, sub_task: &SubTask, runtime: &TaskRuntime) {
        match self.store.get_sub_task(sub_task.id).await {
            Ok(Some(current)) if current.operator == Operator::Cancel => {
                info!("子任务 {} 收到取消信号", sub_task.id);
                runtime.cancel();
            }
            Ok(_) => {}
            Err(e) => warn!("读取子任务 {} 失败: {}", sub_task.id, e),
        }
    }
}

/// 任务失败时写入日志的最后一行
fn failure_line(error: &ObshellError) -> String {
    match error {
        ObshellError::TaskExecution(message) => message.clone(),
        other => other.to_string(),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_line_uses_raw_task_message() {
        let err = ObshellError::task_execution("attempt 1 failed");
        assert_eq!(failure_line(&err), "attempt 1 failed");
        let err = ObshellError::timeout("slow");
        assert_eq!(failure_line(&err), err.to_string());
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
