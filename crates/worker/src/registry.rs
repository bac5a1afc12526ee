use std::collections::HashMap;
use std::sync::Arc;

use obshell_domain::entities::TaskCapabilities;
use obshell_errors::{ObshellError, ObshellResult};
use tokio::sync::RwLock;
use tracing::debug;

use crate::task::ExecutableTask;

pub type TaskFactory = Arc<dyn Fn() -> Arc<dyn ExecutableTask> + Send + Sync>;

/// 任务注册表: 结构名 → 构造函数
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: Arc<RwLock<HashMap<String, TaskFactory>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register<S, F, T>(&self, struct_name: S, factory: F)
    where
        S: Into<String>,
        F: Fn() -> T + Send + Sync + 'static,
        T: ExecutableTask + 'static,
    {
        let struct_name = struct_name.into();
        debug!("注册任务类型: {}", struct_name);
        let factory: TaskFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn ExecutableTask>);
        self.factories.write().await.insert(struct_name, factory);
    }

    pub async fn contains(&self, struct_name: &str) -> bool {
        self.factories.read().await.contains_key(struct_name)
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn create(&self, struct_name: &str) -> ObshellResult<Arc<dyn ExecutableTask>> {
        let registry = self.factories.read().await;
        let factory = registry.get(struct_name).ok_or_else(|| {
            ObshellError::illegal_argument(format!("未注册的任务类型: {struct_name}"))
        })?;
        Ok(factory())
    }

    /// 构造一个临时实例读取能力位
    pub async fn capabilities(&self, struct_name: &str) -> ObshellResult<TaskCapabilities> {
        Ok(self.create(struct_name).await?.capabilities())
    }

    /// 模板构建时读取任务名和能力位
    pub async fn describe(&self, struct_name: &str) -> ObshellResult<(String, TaskCapabilities)> {
        let task = self.create(struct_name).await?;
        Ok((task.name().to_string(), task.capabilities()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::NoopTask;

    #[tokio::test]
    async fn test_register_and_create() {
        let registry = TaskRegistry::new();
        assert!(!registry.contains("noop").await);

        registry.register("noop", NoopTask::default).await;
        assert!(registry.contains("noop").await);
        assert_eq!(registry.list().await, vec!["noop".to_string()]);

        let task = registry.create("noop").await.unwrap();
        assert_eq!(task.name(), "noop");
        assert!(registry.capabilities("noop").await.unwrap().can_retry);
    }

    #[tokio::test]
    async fn test_unknown_struct_name() {
        let registry = TaskRegistry::new();
        let err = registry.create("missing").await.err().unwrap();
        assert!(matches!(err, ObshellError::IllegalArgument(_)));
    }
}
