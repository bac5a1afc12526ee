use async_trait::async_trait;
use chrono::Utc;
use obshell_domain::repositories::ConfigRepository;
use obshell_errors::ObshellResult;
use sqlx::{Row, SqlitePool};

pub struct SqliteConfigRepository {
    pool: SqlitePool,
}

impl SqliteConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepository for SqliteConfigRepository {
    async fn get(&self, name: &str) -> ObshellResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM ob_config WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, name: &str, value: &str) -> ObshellResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ob_config (name, value, gmt_modify) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value, gmt_modify = excluded.gmt_modify
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> ObshellResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT name, value FROM ob_config ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> ObshellResult<(String, String)> {
                Ok((row.try_get("name")?, row.try_get("value")?))
            })
            .collect()
    }

    async fn delete(&self, name: &str) -> ObshellResult<bool> {
        let result = sqlx::query("DELETE FROM ob_config WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseManager, StoreRole};

    #[tokio::test]
    async fn test_config_overrides() {
        let db = DatabaseManager::in_memory(StoreRole::Local).await.unwrap();
        db.migrate().await.unwrap();
        let repo = SqliteConfigRepository::new(db.pool().clone());

        assert!(repo.get("log_level").await.unwrap().is_none());
        repo.set("log_level", "debug").await.unwrap();
        repo.set("log_level", "warn").await.unwrap();
        repo.set("api.cors_enabled", "true").await.unwrap();

        assert_eq!(repo.get("log_level").await.unwrap().as_deref(), Some("warn"));
        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "api.cors_enabled");

        assert!(repo.delete("log_level").await.unwrap());
        assert!(!repo.delete("log_level").await.unwrap());
    }
}
