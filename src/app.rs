use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use obshell_api::{
    client::{AgentClient, Credentials},
    create_app, serve,
    secure::KeyStore,
    socket::serve_unix,
    AppState,
};
use obshell_core::{exit_code, AppConfig};
use obshell_dispatcher::{
    register_membership_tasks, DagScheduler, DagService, Dispatch, IdentitySeed, IdentityService,
    LoopbackTaskClient, MaintainerCoordinator, MembershipContext, MembershipService,
    RecoveryService, TaskEngine, TaskMappingService, TaskSynchronizer,
};
use obshell_domain::{
    entities::{AgentInfo, TaskScope},
    ports::RemoteTaskClient,
    repositories::{ClusterAgentRepository, ConfigRepository, RosterRepository, TaskStore},
};
use obshell_infrastructure::{
    DatabaseManager, SqliteClusterAgentRepository, SqliteConfigRepository,
    SqliteIdentityRepository, SqliteRosterRepository, SqliteTaskStore, StoreRole,
};
use obshell_worker::{register_builtin_tasks, SubTaskExecutor, SubTaskRunner, TaskRegistry};
use serde_json::Value;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info, warn};

/// 带保留退出码的启动失败
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StartupError {
    pub code: i32,
    pub message: String,
}

impl StartupError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// 代理进程: 本地任务引擎、维护者协调器, 以及 TCP 和 Unix socket 上的 API
pub struct Application {
    config: AppConfig,
    local_db: DatabaseManager,
    cluster_db: DatabaseManager,
    state: AppState,
    engine: Arc<TaskEngine>,
    maintainer: Arc<MaintainerCoordinator>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let local_db = open_database(&config.database.local_url, StoreRole::Local, &config).await?;
        let config = apply_overrides(
            config,
            &SqliteConfigRepository::new(local_db.pool().clone()),
        )
        .await?;
        let cluster_db =
            open_database(&config.database.cluster_url, StoreRole::Cluster, &config).await?;

        let agent = AgentInfo::new(config.agent.ip.clone(), config.agent.port);
        info!("初始化代理 {}", agent);

        let bits = config.agent.rsa_key_bits;
        let identity = Arc::new(
            IdentityService::load_or_init(
                Arc::new(SqliteIdentityRepository::new(local_db.pool().clone())),
                IdentitySeed {
                    agent: agent.clone(),
                    zone: config.agent.zone.clone(),
                    version: config.agent.version.clone(),
                    password: config.agent.password.clone(),
                },
                || KeyStore::generate_pem(bits),
            )
            .await
            .context("加载代理身份失败")?,
        );
        let saved = identity.agent().await;
        if saved != agent {
            return Err(StartupError::new(
                exit_code::IP_MISMATCH,
                format!("配置的代理地址 {agent} 与已保存的身份 {saved} 不一致"),
            )
            .into());
        }
        let keys = Arc::new(
            KeyStore::from_pem(&identity.current().await.private_key_pem)
                .context("加载代理密钥失败")?,
        );

        let local_store: Arc<dyn TaskStore> =
            Arc::new(SqliteTaskStore::new(local_db.pool().clone()));
        let cluster_store: Arc<dyn TaskStore> =
            Arc::new(SqliteTaskStore::new(cluster_db.pool().clone()));
        let roster: Arc<dyn RosterRepository> =
            Arc::new(SqliteRosterRepository::new(local_db.pool().clone()));
        let cluster_agents: Arc<dyn ClusterAgentRepository> =
            Arc::new(SqliteClusterAgentRepository::new(cluster_db.pool().clone()));

        let client = Arc::new(
            AgentClient::new(
                Credentials::Agent {
                    identity: identity.clone(),
                    roster: roster.clone(),
                },
                Duration::from_secs(config.api.forward_timeout_seconds),
            )
            .context("创建代理客户端失败")?,
        );

        let registry = TaskRegistry::new();
        register_builtin_tasks(&registry).await;
        let membership_ctx = MembershipContext {
            identity: identity.clone(),
            roster,
            cluster_agents: cluster_agents.clone(),
            rpc: client.clone(),
        };
        register_membership_tasks(&registry, membership_ctx.clone()).await;

        // 本地侧
        let runner = Arc::new(SubTaskRunner::new(
            local_store.clone(),
            registry.clone(),
            agent.clone(),
            config.engine.cancel_poll_interval(),
        ));
        let executor = Arc::new(SubTaskExecutor::new(
            runner,
            config.engine.max_concurrent_sub_tasks,
        ));
        let local_scheduler = Arc::new(DagScheduler::new(
            TaskScope::Local,
            local_store.clone(),
            agent.clone(),
            Dispatch::Local(executor.clone()),
        ));
        let recovery = RecoveryService::new(
            local_store.clone(),
            executor.clone(),
            registry.clone(),
            agent.clone(),
        );
        let engine = Arc::new(TaskEngine::new(
            local_scheduler,
            recovery,
            executor,
            config.engine.scheduler_tick(),
        ));
        let mapping = Arc::new(TaskMappingService::new(local_store.clone(), agent.clone()));

        // 集群侧, 只在维护者上运行
        let tasks: Arc<dyn RemoteTaskClient> = Arc::new(LoopbackTaskClient::new(
            agent.clone(),
            mapping.clone(),
            client.clone(),
        ));
        let cluster_scheduler = Arc::new(DagScheduler::new(
            TaskScope::Cluster,
            cluster_store.clone(),
            agent.clone(),
            Dispatch::Remote(tasks.clone()),
        ));
        let synchronizer = Arc::new(TaskSynchronizer::new(
            cluster_store.clone(),
            cluster_agents.clone(),
            tasks,
        ));
        let maintainer = Arc::new(MaintainerCoordinator::new(
            agent.clone(),
            identity.clone(),
            cluster_agents,
            cluster_scheduler,
            synchronizer,
            config.engine.clone(),
        ));

        let local_dags = Arc::new(DagService::new(
            TaskScope::Local,
            local_store,
            registry.clone(),
            agent.clone(),
        ));
        let cluster_dags = Arc::new(DagService::new(
            TaskScope::Cluster,
            cluster_store,
            registry,
            agent,
        ));
        let membership = Arc::new(MembershipService::new(
            membership_ctx,
            local_dags.clone(),
            cluster_dags.clone(),
        ));

        let state = AppState {
            config: config.api.clone(),
            started_at: Utc::now(),
            identity,
            keys,
            membership,
            local_dags,
            cluster_dags,
            mapping,
            maintainer: Some(maintainer.clone()),
            client,
        };

        Ok(Self {
            config,
            local_db,
            cluster_db,
            state,
            engine,
            maintainer,
        })
    }

    /// 运行到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let address = self.config.agent.address();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            if e.kind() == ErrorKind::AddrInUse {
                anyhow::Error::new(StartupError::new(
                    exit_code::PORT_IN_USE,
                    format!("端口已被占用: {address}"),
                ))
            } else {
                anyhow::Error::new(e).context(format!("绑定地址失败: {address}"))
            }
        })?;

        let app = create_app(self.state.clone());

        let engine_handle = {
            let engine = Arc::clone(&self.engine);
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { engine.run(shutdown_rx).await })
        };

        let maintainer_handle = {
            let maintainer = Arc::clone(&self.maintainer);
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { maintainer.run(shutdown_rx).await })
        };

        let socket_handle = {
            let path = self.config.agent.socket_path.clone();
            let app = app.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                if let Err(e) = serve_unix(&path, app, shutdown_rx).await {
                    error!("本地socket服务失败: {}", e);
                }
            })
        };

        info!("代理启动在 http://{}", address);
        serve(listener, app, async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("HTTP服务运行失败")?;

        let _ = tokio::join!(engine_handle, maintainer_handle, socket_handle);
        self.local_db.close().await;
        self.cluster_db.close().await;
        info!("代理已停止");
        Ok(())
    }
}

async fn open_database(url: &str, role: StoreRole, config: &AppConfig) -> Result<DatabaseManager> {
    let db = DatabaseManager::new(url, role, &config.database)
        .await
        .with_context(|| format!("连接元数据库失败: {url}"))?;
    db.migrate()
        .await
        .with_context(|| format!("元数据库迁移失败: {url}"))?;
    Ok(db)
}

/// 把 `ob_config` 中 `section.key` 形式的覆盖项应用到配置上
pub async fn apply_overrides(config: AppConfig, repo: &dyn ConfigRepository) -> Result<AppConfig> {
    let overrides = repo.list().await.context("读取代理配置覆盖失败")?;
    if overrides.is_empty() {
        return Ok(config);
    }

    let mut tree = serde_json::to_value(&config).context("序列化配置失败")?;
    for (name, raw) in overrides {
        let Some((section, key)) = name.split_once('.') else {
            warn!("忽略无法识别的配置项: {}", name);
            continue;
        };
        let Some(slot) = tree.get_mut(section).and_then(|s| s.get_mut(key)) else {
            warn!("忽略不存在的配置项: {}", name);
            continue;
        };
        *slot = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        info!("应用配置覆盖 {}", name);
    }

    let config: AppConfig = serde_json::from_value(tree).context("配置覆盖类型不匹配")?;
    config.validate().context("应用配置覆盖后校验失败")?;
    Ok(config)
}
