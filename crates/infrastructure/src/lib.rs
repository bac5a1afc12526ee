pub mod database;

pub use database::sqlite::{
    SqliteClusterAgentRepository, SqliteConfigRepository, SqliteIdentityRepository,
    SqliteRosterRepository, SqliteTaskStore,
};
pub use database::{DatabaseManager, StoreRole};
