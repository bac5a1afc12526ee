//! 子任务执行层
//!
//! 任务类型通过 [`TaskRegistry`] 按结构名注册, 由 [`SubTaskRunner`] 按照
//! READY → RUNNING → 终态 的条件更新流程执行, [`SubTaskExecutor`] 负责
//! 并发控制和同一子任务的单飞。

pub mod builtin;
pub mod executor;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod task;

pub use builtin::{register_builtin_tasks, NoopTask, SleepTask};
pub use executor::SubTaskExecutor;
pub use registry::{TaskFactory, TaskRegistry};
pub use runner::{RunOutcome, SubTaskRunner};
pub use runtime::TaskRuntime;
pub use task::ExecutableTask;
