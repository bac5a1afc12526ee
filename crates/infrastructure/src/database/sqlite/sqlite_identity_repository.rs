use async_trait::async_trait;
use obshell_domain::{
    entities::{AgentIdentity, AgentInfo, Identity},
    repositories::IdentityRepository,
};
use obshell_errors::{ObshellError, ObshellResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

pub struct SqliteIdentityRepository {
    pool: SqlitePool,
}

impl SqliteIdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_identity(row: &SqliteRow) -> ObshellResult<AgentIdentity> {
        let master_ip: Option<String> = row.try_get("master_ip")?;
        let master_port: Option<u16> = row.try_get("master_port")?;
        let pid: i64 = row.try_get("pid")?;
        Ok(AgentIdentity {
            agent: AgentInfo::new(
                row.try_get::<String, _>("ip")?,
                row.try_get::<u16, _>("port")?,
            ),
            zone: row.try_get("zone")?,
            version: row.try_get("version")?,
            identity: row.try_get("identity")?,
            master: master_ip.zip(master_port).map(|(ip, port)| AgentInfo::new(ip, port)),
            password: row.try_get("password")?,
            private_key_pem: row.try_get("private_key")?,
            token: row.try_get("token")?,
            start_time: row.try_get("start_time")?,
            pid: pid as u32,
        })
    }
}

#[async_trait]
impl IdentityRepository for SqliteIdentityRepository {
    async fn load(&self) -> ObshellResult<Option<AgentIdentity>> {
        let row = sqlx::query("SELECT * FROM ocs_identity WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_identity).transpose()
    }

    #[instrument(skip(self, identity), fields(agent = %identity.agent, identity = %identity.identity))]
    async fn save(&self, identity: &AgentIdentity) -> ObshellResult<()> {
        let (master_ip, master_port) = match &identity.master {
            Some(master) => (Some(master.ip.clone()), Some(master.port)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO ocs_identity (id, ip, port, zone, version, identity, master_ip, master_port,
                                      password, private_key, token, start_time, pid)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ip = excluded.ip,
                port = excluded.port,
                zone = excluded.zone,
                version = excluded.version,
                identity = excluded.identity,
                master_ip = excluded.master_ip,
                master_port = excluded.master_port,
                password = excluded.password,
                private_key = excluded.private_key,
                token = excluded.token,
                start_time = excluded.start_time,
                pid = excluded.pid
            "#,
        )
        .bind(&identity.agent.ip)
        .bind(identity.agent.port)
        .bind(&identity.zone)
        .bind(&identity.version)
        .bind(identity.identity)
        .bind(master_ip)
        .bind(master_port)
        .bind(&identity.password)
        .bind(&identity.private_key_pem)
        .bind(&identity.token)
        .bind(identity.start_time)
        .bind(identity.pid as i64)
        .execute(&self.pool)
        .await?;

        debug!("保存代理身份: {} ({})", identity.agent, identity.identity);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_identity(
        &self,
        identity: Identity,
        master: Option<&AgentInfo>,
    ) -> ObshellResult<()> {
        let result = sqlx::query(
            "UPDATE ocs_identity SET identity = ?, master_ip = ?, master_port = ? WHERE id = 1",
        )
        .bind(identity)
        .bind(master.map(|m| m.ip.clone()))
        .bind(master.map(|m| m.port))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::no_affected_rows("代理身份尚未初始化"));
        }
        debug!("代理身份更新为 {}", identity);
        Ok(())
    }
}
