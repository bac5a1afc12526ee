mod common;

use std::sync::Arc;
use std::time::Duration;

use obshell_api::{
    dag_handler::DagHandler,
    socket::{serve_unix, UnixSocketClient},
};
use obshell_dispatcher::{DagDetail, TemplateBuilder};
use obshell_domain::entities::{AgentInfo, AgentInstance, GenericId, State, TaskContext};
use obshell_errors::ObshellError;
use tokio::sync::broadcast;

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socket_requests_skip_signature() {
    let cluster = ClusterDb::new().await;
    let agent = TestAgent::start(AgentInfo::new("10.0.0.1", 2886), "pwd", &cluster).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run").join("obshell.sock");

    let (shutdown, rx) = broadcast::channel(1);
    let server = tokio::spawn(serve_unix(path.clone(), agent.app(), rx));
    assert!(
        wait_until(Duration::from_secs(5), || {
            let path = path.clone();
            async move { path.exists() }
        })
        .await
    );

    // 设置了密码, 但本地 socket 上的请求不需要安全头
    let client = UnixSocketClient::new(&path);
    let instance: AgentInstance = client.get("/api/v1/agent").await.unwrap();
    assert_eq!(instance.agent, agent.agent);

    let missing = GenericId::local(agent.agent.clone(), 4242);
    let err = client
        .get::<DagDetail>(&format!("/api/v1/task/dag/{missing}"))
        .await
        .unwrap_err();
    assert!(matches!(err, ObshellError::DagNotFound { .. }), "{err:?}");

    // DagHandler 通过 socket 跟踪到结束
    let template = TemplateBuilder::new("nap").add_node("sleep").build().unwrap();
    let dag = agent
        .state
        .local_dags
        .create(&template, TaskContext::new().with_param("sleep_ms", 50u64))
        .await
        .unwrap();
    let id = GenericId::local(agent.agent.clone(), dag.id);
    let mut lines = Vec::new();
    let detail = DagHandler::new(Arc::new(client.clone()))
        .with_interval(Duration::from_millis(20))
        .wait(&id, |line| lines.push(line.to_string()))
        .await
        .unwrap();
    assert_eq!(detail.state, State::Succeed);
    assert!(lines.iter().any(|l| l.contains("SUCCEED")), "{lines:?}");

    let _ = shutdown.send(());
    server.await.unwrap().unwrap();
    assert!(!path.exists());
    agent.stop().await;
}
