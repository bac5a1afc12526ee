//! Dag 任务引擎
//!
//! 本地元数据库和集群元数据库各运行一套 [`DagScheduler`]: 本地调度器在
//! 每个代理上运行, 集群调度器只在维护者上运行, 通过 [`mapping`] 把子任务
//! 派发给执行代理的镜像, 再由 [`TaskSynchronizer`] 把镜像状态同步回来。

pub mod barrier;
pub mod dag_service;
pub mod engine;
pub mod identity;
pub mod maintainer;
pub mod mapping;
pub mod membership;
pub mod recovery;
pub mod scheduler;
pub mod synchronizer;
pub mod template;
pub mod views;

pub use barrier::NodeProgress;
pub use dag_service::DagService;
pub use engine::TaskEngine;
pub use identity::{IdentitySeed, IdentityService};
pub use maintainer::MaintainerCoordinator;
pub use mapping::{LoopbackTaskClient, TaskMappingService};
pub use membership::{register_membership_tasks, MembershipContext, MembershipService};
pub use recovery::{RecoveryReport, RecoveryService};
pub use scheduler::{DagScheduler, Dispatch};
pub use synchronizer::TaskSynchronizer;
pub use template::{NodeExecutors, Template, TemplateBuilder};
pub use views::{DagDetail, NodeDetail, SubTaskDetail};
