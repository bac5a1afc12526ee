use async_trait::async_trait;
use obshell_domain::{
    entities::{AgentInfo, ClusterAgent},
    repositories::ClusterAgentRepository,
};
use obshell_errors::ObshellResult;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

/// 集群元数据库中的成员表, 同时承载维护者租约
///
/// 租约就是 `heartbeat_time`: 窗口内只允许一个成员持有新鲜心跳,
/// 抢占和续约都是同一条条件更新。
pub struct SqliteClusterAgentRepository {
    pool: SqlitePool,
}

impl SqliteClusterAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_agent(row: &SqliteRow) -> ObshellResult<ClusterAgent> {
        Ok(ClusterAgent {
            agent: AgentInfo::new(
                row.try_get::<String, _>("ip")?,
                row.try_get::<u16, _>("port")?,
            ),
            zone: row.try_get("zone")?,
            version: row.try_get("version")?,
            token: row.try_get("token")?,
            heartbeat_time: row.try_get("heartbeat_time")?,
        })
    }
}

#[async_trait]
impl ClusterAgentRepository for SqliteClusterAgentRepository {
    async fn list(&self) -> ObshellResult<Vec<ClusterAgent>> {
        let rows = sqlx::query("SELECT * FROM ocs_info ORDER BY ip, port")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn get(&self, agent: &AgentInfo) -> ObshellResult<Option<ClusterAgent>> {
        let row = sqlx::query("SELECT * FROM ocs_info WHERE ip = ? AND port = ?")
            .bind(&agent.ip)
            .bind(agent.port)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn register(&self, agent: &ClusterAgent) -> ObshellResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ocs_info (ip, port, zone, version, token, heartbeat_time)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(ip, port) DO UPDATE SET
                zone = excluded.zone,
                version = excluded.version,
                token = excluded.token
            "#,
        )
        .bind(&agent.agent.ip)
        .bind(agent.agent.port)
        .bind(&agent.zone)
        .bind(&agent.version)
        .bind(&agent.token)
        .bind(agent.heartbeat_time)
        .execute(&self.pool)
        .await?;

        debug!("注册集群成员: {}", agent.agent);
        Ok(())
    }

    async fn remove(&self, agent: &AgentInfo) -> ObshellResult<bool> {
        let result = sqlx::query("DELETE FROM ocs_info WHERE ip = ? AND port = ?")
            .bind(&agent.ip)
            .bind(agent.port)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(agent = %agent))]
    async fn try_heartbeat(
        &self,
        agent: &AgentInfo,
        now_ms: i64,
        window_ms: i64,
    ) -> ObshellResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ocs_info SET heartbeat_time = ?
            WHERE ip = ? AND port = ?
              AND NOT EXISTS (
                  SELECT 1 FROM ocs_info
                  WHERE NOT (ip = ? AND port = ?) AND heartbeat_time > ?
              )
            "#,
        )
        .bind(now_ms)
        .bind(&agent.ip)
        .bind(agent.port)
        .bind(&agent.ip)
        .bind(agent.port)
        .bind(now_ms - window_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn current_maintainer(
        &self,
        now_ms: i64,
        window_ms: i64,
    ) -> ObshellResult<Option<AgentInfo>> {
        let row = sqlx::query(
            "SELECT * FROM ocs_info WHERE heartbeat_time > ? \
             ORDER BY heartbeat_time DESC LIMIT 1",
        )
        .bind(now_ms - window_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .as_ref()
            .map(Self::row_to_agent)
            .transpose()?
            .map(|agent| agent.agent))
    }

    async fn release_heartbeat(&self, agent: &AgentInfo) -> ObshellResult<()> {
        sqlx::query("UPDATE ocs_info SET heartbeat_time = 0 WHERE ip = ? AND port = ?")
            .bind(&agent.ip)
            .bind(agent.port)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
