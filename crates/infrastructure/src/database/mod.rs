pub mod migrations;
pub mod sqlite;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use obshell_core::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub use migrations::StoreRole;

pub struct DatabaseManager {
    pool: SqlitePool,
    role: StoreRole,
}

impl DatabaseManager {
    /// 创建文件数据库连接池, 启用外键约束和WAL模式
    pub async fn new(url: &str, role: StoreRole, config: &DatabaseConfig) -> Result<Self> {
        info!("创建SQLite数据库连接池: {url}");

        let connect_options = SqliteConnectOptions::from_str(url)
            .context("解析数据库URL失败")?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        if let Some(parent) = Path::new(connect_options.get_filename()).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("创建数据库目录失败: {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect_with(connect_options)
            .await
            .context("创建数据库连接池失败")?;

        Ok(Self { pool, role })
    }

    /// 内存数据库, 只保留一个常驻连接, 否则连接回收时数据库随之消失
    pub async fn in_memory(role: StoreRole) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("创建内存数据库失败")?;

        Ok(Self { pool, role })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn role(&self) -> StoreRole {
        self.role
    }

    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool, self.role).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
