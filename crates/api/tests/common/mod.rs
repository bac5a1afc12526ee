#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use chrono::Utc;
use obshell_api::{
    client::{AgentClient, Credentials},
    create_app, serve,
    secure::{seal, KeyStore, SecureHeader},
    AppState,
};
use obshell_core::{config::ApiConfig, constants::SECURE_HEADER};
use obshell_dispatcher::{
    register_membership_tasks, DagScheduler, DagService, Dispatch, IdentitySeed, IdentityService,
    MembershipContext, MembershipService, RecoveryService, TaskEngine, TaskMappingService,
};
use obshell_domain::{
    entities::{AgentInfo, Dag, State, TaskScope},
    repositories::{ClusterAgentRepository, RosterRepository, TaskStore},
};
use obshell_infrastructure::{
    DatabaseManager, SqliteClusterAgentRepository, SqliteIdentityRepository,
    SqliteRosterRepository, SqliteTaskStore, StoreRole,
};
use obshell_worker::{register_builtin_tasks, SubTaskExecutor, SubTaskRunner, TaskRegistry};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower::ServiceExt;

pub const POLL: Duration = Duration::from_millis(20);
pub const VERSION: &str = "4.2.0";

pub async fn database(role: StoreRole) -> DatabaseManager {
    let db = DatabaseManager::in_memory(role).await.unwrap();
    db.migrate().await.unwrap();
    db
}

/// 所有代理共享的集群元数据库
pub struct ClusterDb {
    pub db: DatabaseManager,
    pub store: Arc<dyn TaskStore>,
    pub agents: Arc<dyn ClusterAgentRepository>,
}

impl ClusterDb {
    pub async fn new() -> Self {
        let db = database(StoreRole::Cluster).await;
        Self {
            store: Arc::new(SqliteTaskStore::new(db.pool().clone())),
            agents: Arc::new(SqliteClusterAgentRepository::new(db.pool().clone())),
            db,
        }
    }
}

/// 组装好的单个代理, 未绑定端口
pub struct TestAgent {
    pub agent: AgentInfo,
    pub state: AppState,
    pub local_store: Arc<dyn TaskStore>,
    pub roster: Arc<dyn RosterRepository>,
    engine_shutdown: broadcast::Sender<()>,
    engine: JoinHandle<()>,
    _db: DatabaseManager,
}

impl TestAgent {
    pub async fn start(agent: AgentInfo, password: &str, cluster: &ClusterDb) -> Self {
        let db = database(StoreRole::Local).await;
        let local_store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(db.pool().clone()));

        let identity = Arc::new(
            IdentityService::load_or_init(
                Arc::new(SqliteIdentityRepository::new(db.pool().clone())),
                IdentitySeed {
                    agent: agent.clone(),
                    zone: "zone1".to_string(),
                    version: VERSION.to_string(),
                    password: password.to_string(),
                },
                || KeyStore::generate_pem(1024),
            )
            .await
            .unwrap(),
        );
        let keys = Arc::new(KeyStore::from_pem(&identity.current().await.private_key_pem).unwrap());
        let roster: Arc<dyn RosterRepository> =
            Arc::new(SqliteRosterRepository::new(db.pool().clone()));
        let client = Arc::new(
            AgentClient::new(
                Credentials::Agent {
                    identity: identity.clone(),
                    roster: roster.clone(),
                },
                Duration::from_secs(5),
            )
            .unwrap(),
        );

        let registry = TaskRegistry::new();
        register_builtin_tasks(&registry).await;
        let ctx = MembershipContext {
            identity: identity.clone(),
            roster: roster.clone(),
            cluster_agents: cluster.agents.clone(),
            rpc: client.clone(),
        };
        register_membership_tasks(&registry, ctx.clone()).await;

        let runner = Arc::new(SubTaskRunner::new(
            local_store.clone(),
            registry.clone(),
            agent.clone(),
            POLL,
        ));
        let executor = Arc::new(SubTaskExecutor::new(runner, 8));
        let scheduler = Arc::new(DagScheduler::new(
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
        let engine = TaskEngine::new(scheduler, recovery, executor, POLL);
        let (engine_shutdown, rx) = broadcast::channel(1);
        let engine = tokio::spawn(async move { engine.run(rx).await });

        let local_dags = Arc::new(DagService::new(
            TaskScope::Local,
            local_store.clone(),
            registry.clone(),
            agent.clone(),
        ));
        let cluster_dags = Arc::new(DagService::new(
            TaskScope::Cluster,
            cluster.store.clone(),
            registry.clone(),
            agent.clone(),
        ));
        let membership = Arc::new(MembershipService::new(
            ctx,
            local_dags.clone(),
            cluster_dags.clone(),
        ));

        let state = AppState {
            config: ApiConfig::default(),
            started_at: Utc::now(),
            identity,
            keys,
            membership,
            local_dags,
            cluster_dags,
            mapping: Arc::new(TaskMappingService::new(local_store.clone(), agent.clone())),
            maintainer: None,
            client,
        };

        Self {
            agent,
            state,
            local_store,
            roster,
            engine_shutdown,
            engine,
            _db: db,
        }
    }

    pub fn app(&self) -> Router {
        create_app(self.state.clone())
    }

    /// 以代理密码签名并用本代理公钥封装的安全头
    pub fn seal(&self, header: &SecureHeader) -> String {
        seal(self.state.keys.public_key_pem(), header).unwrap()
    }

    pub async fn stop(self) {
        let _ = self.engine_shutdown.send(());
        self.engine.await.unwrap();
    }
}

/// 在 127.0.0.1 的随机端口上提供服务的代理
pub struct LiveAgent {
    pub inner: TestAgent,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<()>,
}

impl LiveAgent {
    pub async fn spawn(password: &str, cluster: &ClusterDb) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let inner = TestAgent::start(AgentInfo::new("127.0.0.1", port), password, cluster).await;

        let (shutdown, mut rx) = broadcast::channel::<()>(1);
        let app = inner.app();
        let server = tokio::spawn(async move {
            serve(listener, app, async move {
                let _ = rx.recv().await;
            })
            .await
            .unwrap();
        });
        Self {
            inner,
            shutdown,
            server,
        }
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.inner.agent
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.server.await.unwrap();
        self.inner.stop().await;
    }
}

/// 通过路由处理一个请求, 返回响应和解析后的 JSON 信封
pub async fn call(app: Router, request: Request<Body>) -> (Response<Body>, Value) {
    let response = app.oneshot(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (Response::from_parts(parts, Body::from(bytes)), json)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn signed(mut request: Request<Body>, sealed: String) -> Request<Body> {
    request
        .headers_mut()
        .insert(SECURE_HEADER, sealed.parse().unwrap());
    request
}

pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_dag_state(store: &Arc<dyn TaskStore>, dag_id: i64, state: State) -> Dag {
    let reached = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move { matches!(store.get_dag(dag_id).await, Ok(Some(dag)) if dag.state == state) }
    })
    .await;
    let dag = store.get_dag(dag_id).await.unwrap().unwrap();
    assert!(reached, "Dag {} 停留在 {} (期望 {})", dag_id, dag.state, state);
    dag
}
