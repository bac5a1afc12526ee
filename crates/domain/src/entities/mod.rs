mod agent;
mod context;
mod generic_id;
mod state;
mod task;

pub use agent::{AgentIdentity, AgentInfo, AgentInstance, ClusterAgent, Identity, RosterEntry};
pub use context::TaskContext;
pub use generic_id::GenericId;
pub use state::{DagType, MaintenanceType, Operator, State, TaskCapabilities, TaskScope};
pub use task::{Dag, Node, SubTask, SubTaskLog, TaskMapping};
