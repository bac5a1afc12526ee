pub mod sqlite_cluster_agent_repository;
pub mod sqlite_config_repository;
pub mod sqlite_identity_repository;
pub mod sqlite_roster_repository;
pub mod sqlite_task_store;

pub use sqlite_cluster_agent_repository::SqliteClusterAgentRepository;
pub use sqlite_config_repository::SqliteConfigRepository;
pub use sqlite_identity_repository::SqliteIdentityRepository;
pub use sqlite_roster_repository::SqliteRosterRepository;
pub use sqlite_task_store::SqliteTaskStore;
