use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use obshell_domain::entities::{AgentInfo, TaskContext};
use obshell_errors::{ObshellError, ObshellResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 子任务执行期间交给任务体的运行时句柄
///
/// 持有本次执行的上下文副本、待刷新的日志和取消信号。上下文在执行结束时
/// 由执行器随终态一起写回元数据库。
pub struct TaskRuntime {
    sub_task_id: i64,
    execute_times: i32,
    agent: AgentInfo,
    is_continue: bool,
    context: Mutex<TaskContext>,
    pending_logs: Mutex<Vec<String>>,
    cancel_tx: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskRuntime {
    pub fn new(
        sub_task_id: i64,
        execute_times: i32,
        agent: AgentInfo,
        context: TaskContext,
        is_continue: bool,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            sub_task_id,
            execute_times,
            agent,
            is_continue,
            context: Mutex::new(context),
            pending_logs: Mutex::new(Vec::new()),
            cancel_tx,
        }
    }

    pub fn sub_task_id(&self) -> i64 {
        self.sub_task_id
    }

    pub fn execute_times(&self) -> i32 {
        self.execute_times
    }

    /// 执行本子任务的代理
    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    /// 本次执行是否接续进程重启前中断的执行
    pub fn is_continue(&self) -> bool {
        self.is_continue
    }

    /// 协作式取消检查点
    pub fn timeout_check(&self) -> ObshellResult<()> {
        if self.is_cancelled() {
            Err(ObshellError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// 等待至多 `duration`, 期间收到取消信号立即返回 `Cancelled`
    pub async fn sleep(&self, duration: Duration) -> ObshellResult<()> {
        let mut rx = self.cancel_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.timeout_check(),
            _ = rx.wait_for(|cancelled| *cancelled) => Err(ObshellError::Cancelled),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn get_param<T: DeserializeOwned>(&self, key: &str) -> ObshellResult<T> {
        lock(&self.context).get_param(key)
    }

    pub fn get_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        lock(&self.context).get_data(key)
    }

    pub fn set_data<K: Into<String>, V: Serialize>(&self, key: K, value: V) {
        lock(&self.context).set_data(key, value);
    }

    pub fn execute_agents(&self) -> Vec<AgentInfo> {
        lock(&self.context).execute_agents.clone()
    }

    pub fn context(&self) -> TaskContext {
        lock(&self.context).clone()
    }

    pub fn execute_log<S: Into<String>>(&self, line: S) {
        let line = line.into();
        info!(sub_task_id = self.sub_task_id, execute_times = self.execute_times, "{}", line);
        lock(&self.pending_logs).push(line);
    }

    pub fn execute_info_log<S: Into<String>>(&self, line: S) {
        self.execute_log(line);
    }

    pub fn execute_warn_log<S: Into<String>>(&self, line: S) {
        let line = line.into();
        warn!(sub_task_id = self.sub_task_id, execute_times = self.execute_times, "{}", line);
        lock(&self.pending_logs).push(line);
    }

    pub fn execute_error_log<S: Into<String>>(&self, line: S) {
        let line = line.into();
        error!(sub_task_id = self.sub_task_id, execute_times = self.execute_times, "{}", line);
        lock(&self.pending_logs).push(line);
    }

    /// 取走尚未落库的日志
    pub(crate) fn drain_logs(&self) -> Vec<String> {
        mem::take(&mut *lock(&self.pending_logs))
    }
}
