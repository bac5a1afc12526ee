mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use obshell_api::secure::{encrypt_body, generate_body_key, sign, SecureHeader};
use obshell_core::constants::TRACE_ID_HEADER;
use obshell_dispatcher::TemplateBuilder;
use obshell_domain::entities::{AgentInfo, Dag, GenericId, TaskContext};
use serde_json::json;

use common::*;

async fn single(password: &str) -> (ClusterDb, TestAgent) {
    let cluster = ClusterDb::new().await;
    let agent = TestAgent::start(AgentInfo::new("10.0.0.1", 2886), password, &cluster).await;
    (cluster, agent)
}

async fn sleeping_dag(agent: &TestAgent, sleep_ms: u64) -> Dag {
    let template = TemplateBuilder::new("sleep")
        .add_node("sleep")
        .build()
        .unwrap();
    agent
        .state
        .local_dags
        .create(&template, TaskContext::new().with_param("sleep_ms", sleep_ms))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_public_endpoints() {
    let (_cluster, agent) = single("pwd").await;

    let (response, body) = call(agent.app(), get("/api/v1/time")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body["successful"], true);
    assert!(body["data"]["timestamp_ms"].as_i64().unwrap() > 0);

    let (_, body) = call(agent.app(), get("/api/v1/info")).await;
    assert_eq!(body["data"]["agent"]["ip"], "10.0.0.1");
    assert_eq!(body["data"]["identity"], "SINGLE");

    let (_, body) = call(agent.app(), get("/api/v1/secret")).await;
    assert_eq!(
        body["data"]["public_key"],
        agent.state.keys.public_key_pem()
    );

    agent.stop().await;
}

#[tokio::test]
async fn test_trace_id_is_echoed() {
    let (_cluster, agent) = single("").await;

    let request = Request::builder()
        .uri("/api/v1/agent")
        .header(TRACE_ID_HEADER, "trace-123")
        .body(Body::empty())
        .unwrap();
    let (response, body) = call(agent.app(), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[TRACE_ID_HEADER], "trace-123");
    assert_eq!(body["trace_id"], "trace-123");

    // 未携带时生成新的追踪ID
    let (response, body) = call(agent.app(), get("/api/v1/agent")).await;
    let minted = response.headers()[TRACE_ID_HEADER].to_str().unwrap().to_string();
    assert!(!minted.is_empty());
    assert_eq!(body["trace_id"], minted);

    agent.stop().await;
}

#[tokio::test]
async fn test_dag_detail_by_generic_id() {
    let (_cluster, agent) = single("").await;
    let dag = sleeping_dag(&agent, 10).await;
    let id = GenericId::local(agent.agent.clone(), dag.id);

    let uri = format!("/api/v1/task/dag/{id}?show_details=true");
    let (response, body) = call(agent.app(), get(&uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body["data"]["dag_id"], dag.id);
    assert_eq!(body["data"]["name"], "sleep");
    assert_eq!(body["data"]["generic_id"], id.to_string());
    assert_eq!(body["data"]["nodes"].as_array().unwrap().len(), 1);

    let (_, body) = call(agent.app(), get("/api/v1/task/dag/agent/unfinish")).await;
    assert!(body["successful"].as_bool().unwrap());

    agent.stop().await;
}

#[tokio::test]
async fn test_task_errors_map_to_status() {
    let (_cluster, agent) = single("").await;

    let missing = GenericId::local(agent.agent.clone(), 9999);
    let (response, body) = call(agent.app(), get(&format!("/api/v1/task/dag/{missing}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body["successful"], false);
    assert_eq!(body["error"]["code"], "DagNotFound");

    let (response, body) = call(agent.app(), get("/api/v1/task/dag/not-an-id")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "IllegalArgument");

    let dag = sleeping_dag(&agent, 5_000).await;
    let id = GenericId::local(agent.agent.clone(), dag.id);
    let (response, body) = call(
        agent.app(),
        post_json(
            &format!("/api/v1/task/dag/{id}"),
            &json!({"operator": "explode"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "IllegalArgument");

    // 节点上只允许 PASS
    let node = agent
        .local_store
        .get_node_by_stage(dag.id, 1)
        .await
        .unwrap()
        .unwrap();
    let node_id = GenericId::local(agent.agent.clone(), node.id);
    let (response, body) = call(
        agent.app(),
        post_json(
            &format!("/api/v1/task/node/{node_id}"),
            &json!({"operator": "retry"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "OperatorNotSupported");

    let (response, body) = call(agent.app(), get("/api/v1/no/such/route")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NotFound");

    agent.stop().await;
}

#[tokio::test]
async fn test_request_without_header_is_rejected_when_password_set() {
    let (_cluster, agent) = single("pwd").await;

    let (response, body) = call(agent.app(), get("/api/v1/agent")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "Unauthorized");
    // 不暴露失败原因
    assert_eq!(body["error"]["message"], "认证失败");

    agent.stop().await;
}

#[tokio::test]
async fn test_signed_request_is_accepted() {
    let (_cluster, agent) = single("pwd").await;

    let header = SecureHeader::new("/api/v1/agent", "pwd").unwrap();
    let request = signed(get("/api/v1/agent"), agent.seal(&header));
    let (response, body) = call(agent.app(), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body["data"]["agent"]["port"], 2886);

    // 查询参数不参与签名
    let dag = sleeping_dag(&agent, 10).await;
    let id = GenericId::local(agent.agent.clone(), dag.id);
    let path = format!("/api/v1/task/dag/{id}");
    let header = SecureHeader::new(&path, "pwd").unwrap();
    let request = signed(
        get(&format!("{path}?show_details=false")),
        agent.seal(&header),
    );
    let (response, _) = call(agent.app(), request).await;
    assert_eq!(response.status(), StatusCode::OK);

    agent.stop().await;
}

#[tokio::test]
async fn test_bad_signatures_are_rejected() {
    let (_cluster, agent) = single("pwd").await;

    let wrong_password = SecureHeader::new("/api/v1/agent", "other").unwrap();
    let (response, _) = call(
        agent.app(),
        signed(get("/api/v1/agent"), agent.seal(&wrong_password)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let other_uri = SecureHeader::new("/api/v1/agents", "pwd").unwrap();
    let (response, _) = call(
        agent.app(),
        signed(get("/api/v1/agent"), agent.seal(&other_uri)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let ts = Utc::now().timestamp_millis() - 10 * 60 * 1000;
    let mut expired = SecureHeader::new("/api/v1/agent", "pwd").unwrap();
    expired.ts = ts;
    expired.auth = sign("pwd", ts, "/api/v1/agent").unwrap();
    let (response, _) = call(
        agent.app(),
        signed(get("/api/v1/agent"), agent.seal(&expired)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (response, _) = call(
        agent.app(),
        signed(get("/api/v1/agent"), "garbage".to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    agent.stop().await;
}

#[tokio::test]
async fn test_operate_with_encrypted_body() {
    let (_cluster, agent) = single("pwd").await;
    let dag = sleeping_dag(&agent, 5_000).await;
    let id = GenericId::local(agent.agent.clone(), dag.id);
    let path = format!("/api/v1/task/dag/{id}");

    let key = generate_body_key();
    let body = encrypt_body(&key, json!({"operator": "cancel"}).to_string().as_bytes()).unwrap();
    let header = SecureHeader::new(&path, "pwd")
        .unwrap()
        .with_body_key(key);
    let request = Request::builder()
        .method("POST")
        .uri(&path)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let (response, body) = call(agent.app(), signed(request, agent.seal(&header))).await;
    assert_eq!(response.status(), StatusCode::OK, "{body}");
    assert_eq!(body["data"]["operator"], "CANCEL");
    let state = body["data"]["state"].as_str().unwrap();
    assert!(state == "CANCELLING" || state == "CANCELED", "{state}");

    agent.stop().await;
}
