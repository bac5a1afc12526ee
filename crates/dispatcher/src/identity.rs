use std::sync::Arc;

use chrono::Utc;
use obshell_domain::{
    entities::{AgentIdentity, AgentInfo, AgentInstance, Identity},
    repositories::IdentityRepository,
};
use obshell_errors::ObshellResult;
use tokio::sync::RwLock;
use tracing::info;

/// 启动时用于生成身份的配置
#[derive(Debug, Clone)]
pub struct IdentitySeed {
    pub agent: AgentInfo,
    pub zone: String,
    pub version: String,
    pub password: String,
}

/// 本代理身份
///
/// 持久化在本地元数据库, 内存中保留一份副本供请求校验和调度读取;
/// 只有身份变更的 Dag 和对应的 RPC 会写入。
pub struct IdentityService {
    repo: Arc<dyn IdentityRepository>,
    current: RwLock<AgentIdentity>,
}

impl IdentityService {
    /// 读取已保存的身份, 首次启动时以 SINGLE 身份初始化
    ///
    /// `generate_key` 只在首次启动时调用, 返回 PEM 格式的私钥。
    pub async fn load_or_init<F>(
        repo: Arc<dyn IdentityRepository>,
        seed: IdentitySeed,
        generate_key: F,
    ) -> ObshellResult<Self>
    where
        F: FnOnce() -> ObshellResult<String>,
    {
        let identity = match repo.load().await? {
            Some(mut saved) => {
                saved.version = seed.version;
                if !seed.password.is_empty() {
                    saved.password = seed.password;
                }
                saved.start_time = Utc::now();
                saved.pid = std::process::id();
                saved
            }
            None => {
                info!("首次启动, 以 SINGLE 身份初始化代理 {}", seed.agent);
                AgentIdentity {
                    agent: seed.agent,
                    zone: seed.zone,
                    version: seed.version,
                    identity: Identity::Single,
                    master: None,
                    password: seed.password,
                    private_key_pem: generate_key()?,
                    token: String::new(),
                    start_time: Utc::now(),
                    pid: std::process::id(),
                }
            }
        };
        repo.save(&identity).await?;
        info!(
            "代理 {} 身份: {} (zone {}, version {})",
            identity.agent, identity.identity, identity.zone, identity.version
        );

        Ok(Self {
            repo,
            current: RwLock::new(identity),
        })
    }

    pub async fn current(&self) -> AgentIdentity {
        self.current.read().await.clone()
    }

    pub async fn identity(&self) -> Identity {
        self.current.read().await.identity
    }

    pub async fn agent(&self) -> AgentInfo {
        self.current.read().await.agent.clone()
    }

    pub async fn master(&self) -> Option<AgentInfo> {
        self.current.read().await.master.clone()
    }

    pub async fn instance(&self) -> AgentInstance {
        AgentInstance::from(&*self.current.read().await)
    }

    /// 身份变更, 先落库再更新内存副本
    pub async fn update(&self, identity: Identity, master: Option<AgentInfo>) -> ObshellResult<()> {
        let mut current = self.current.write().await;
        self.repo.update_identity(identity, master.as_ref()).await?;
        info!("代理身份变更: {} -> {}", current.identity, identity);
        current.identity = identity;
        current.master = master;
        Ok(())
    }

    pub async fn set_token(&self, token: String) -> ObshellResult<()> {
        let mut current = self.current.write().await;
        let mut updated = current.clone();
        updated.token = token;
        self.repo.save(&updated).await?;
        *current = updated;
        Ok(())
    }
}
