use async_trait::async_trait;
use obshell_domain::{
    entities::{AgentInfo, RosterEntry},
    repositories::RosterRepository,
};
use obshell_errors::ObshellResult;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

pub struct SqliteRosterRepository {
    pool: SqlitePool,
}

impl SqliteRosterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &SqliteRow) -> ObshellResult<RosterEntry> {
        Ok(RosterEntry {
            agent: AgentInfo::new(
                row.try_get::<String, _>("ip")?,
                row.try_get::<u16, _>("port")?,
            ),
            zone: row.try_get("zone")?,
            version: row.try_get("version")?,
            identity: row.try_get("identity")?,
            token: row.try_get("token")?,
        })
    }
}

#[async_trait]
impl RosterRepository for SqliteRosterRepository {
    async fn list(&self) -> ObshellResult<Vec<RosterEntry>> {
        let rows = sqlx::query("SELECT * FROM all_agent ORDER BY ip, port")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn get(&self, agent: &AgentInfo) -> ObshellResult<Option<RosterEntry>> {
        let row = sqlx::query("SELECT * FROM all_agent WHERE ip = ? AND port = ?")
            .bind(&agent.ip)
            .bind(agent.port)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn upsert(&self, entry: &RosterEntry) -> ObshellResult<()> {
        sqlx::query(
            r#"
            INSERT INTO all_agent (ip, port, zone, version, identity, token)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(ip, port) DO UPDATE SET
                zone = excluded.zone,
                version = excluded.version,
                identity = excluded.identity,
                token = excluded.token
            "#,
        )
        .bind(&entry.agent.ip)
        .bind(entry.agent.port)
        .bind(&entry.zone)
        .bind(&entry.version)
        .bind(entry.identity)
        .bind(&entry.token)
        .execute(&self.pool)
        .await?;

        debug!("成员表写入: {} ({})", entry.agent, entry.identity);
        Ok(())
    }

    async fn remove(&self, agent: &AgentInfo) -> ObshellResult<bool> {
        let result = sqlx::query("DELETE FROM all_agent WHERE ip = ? AND port = ?")
            .bind(&agent.ip)
            .bind(agent.port)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseManager, StoreRole};
    use obshell_domain::entities::Identity;

    #[tokio::test]
    async fn test_roster_upsert_and_remove() {
        let db = DatabaseManager::in_memory(StoreRole::Local).await.unwrap();
        db.migrate().await.unwrap();
        let repo = SqliteRosterRepository::new(db.pool().clone());

        let mut entry = RosterEntry {
            agent: AgentInfo::new("10.0.0.1", 2886),
            zone: "zone1".to_string(),
            version: "4.2.0".to_string(),
            identity: Identity::Master,
            token: String::new(),
        };
        repo.upsert(&entry).await.unwrap();
        entry.token = "new-token".to_string();
        repo.upsert(&entry).await.unwrap();

        let entries = repo.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].token, "new-token");
        assert_eq!(repo.get(&entry.agent).await.unwrap(), Some(entry.clone()));

        assert!(repo.remove(&entry.agent).await.unwrap());
        assert!(!repo.remove(&entry.agent).await.unwrap());
        assert!(repo.list().await.unwrap().is_empty());
    }
}
