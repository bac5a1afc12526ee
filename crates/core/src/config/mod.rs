mod agent;
mod api_observability;
mod app_config;
mod database;
mod engine;

pub use agent::AgentConfig;
pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use engine::EngineConfig;
