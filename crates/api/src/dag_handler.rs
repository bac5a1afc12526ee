//! 命令行侧的 Dag 观察者
//!
//! 按 generic id 轮询 Dag, 每个节点状态变化时输出一行进度, 失败时输出各
//! 代理上失败子任务的最后一行日志。升级过程中代理进程会被替换, 此时 TCP
//! 端口短暂不可用, 轮询改走本地 socket。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use obshell_core::constants::{API_PREFIX, DAG_POLL_RETRY, UPGRADE_DAG_POLL_RETRY};
use obshell_dispatcher::DagDetail;
use obshell_domain::entities::{AgentInfo, GenericId, Operator, State};
use obshell_errors::{ObshellError, ObshellResult};
use tracing::{debug, warn};

use crate::client::AgentClient;
use crate::models::OperatorRequest;
use crate::secure::ForwardType;
use crate::socket::UnixSocketClient;

#[async_trait]
pub trait DagQuery: Send + Sync {
    async fn get_dag(&self, id: &GenericId, show_details: bool) -> ObshellResult<DagDetail>;
    async fn operate(&self, id: &GenericId, operator: Operator) -> ObshellResult<DagDetail>;
}

fn dag_uri(id: &GenericId) -> String {
    format!("{API_PREFIX}/task/dag/{id}")
}

fn operator_body(operator: Operator) -> OperatorRequest {
    OperatorRequest {
        operator: operator.as_str().to_ascii_lowercase(),
    }
}

/// 经签名客户端访问某个代理
pub struct HttpDagQuery {
    client: Arc<AgentClient>,
    target: AgentInfo,
}

impl HttpDagQuery {
    pub fn new(client: Arc<AgentClient>, target: AgentInfo) -> Self {
        Self { client, target }
    }
}

#[async_trait]
impl DagQuery for HttpDagQuery {
    async fn get_dag(&self, id: &GenericId, show_details: bool) -> ObshellResult<DagDetail> {
        let uri = format!("{}?show_details={show_details}", dag_uri(id));
        self.client
            .request::<(), _>(&self.target, Method::GET, &uri, None, ForwardType::None)
            .await
    }

    async fn operate(&self, id: &GenericId, operator: Operator) -> ObshellResult<DagDetail> {
        self.client
            .post(&self.target, &dag_uri(id), &operator_body(operator))
            .await
    }
}

#[async_trait]
impl DagQuery for UnixSocketClient {
    async fn get_dag(&self, id: &GenericId, show_details: bool) -> ObshellResult<DagDetail> {
        self.get(&format!("{}?show_details={show_details}", dag_uri(id)))
            .await
    }

    async fn operate(&self, id: &GenericId, operator: Operator) -> ObshellResult<DagDetail> {
        self.post(&dag_uri(id), &operator_body(operator)).await
    }
}

pub struct DagHandler {
    primary: Arc<dyn DagQuery>,
    fallback: Option<Arc<dyn DagQuery>>,
    retry: u32,
    interval: Duration,
    upgrade_mode: bool,
    /// 已输出过的节点状态, 按 stage
    reported: HashMap<i32, State>,
}

impl DagHandler {
    pub fn new(primary: Arc<dyn DagQuery>) -> Self {
        Self {
            primary,
            fallback: None,
            retry: DAG_POLL_RETRY,
            interval: Duration::from_secs(1),
            upgrade_mode: false,
            reported: HashMap::new(),
        }
    }

    /// 升级模式: 容忍更长时间的不可用, 并在 TCP 失败后改用 `fallback`
    pub fn upgrade_mode(mut self, fallback: Arc<dyn DagQuery>) -> Self {
        self.fallback = Some(fallback);
        self.upgrade_mode = true;
        self.retry = UPGRADE_DAG_POLL_RETRY;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// 轮询直到 Dag 结束或等待人工操作, 每行进度交给 `output`
    pub async fn wait<F>(&mut self, id: &GenericId, mut output: F) -> ObshellResult<DagDetail>
    where
        F: FnMut(&str) + Send,
    {
        let mut failures = 0u32;
        let mut on_fallback = false;
        loop {
            let source = match (&self.fallback, on_fallback) {
                (Some(fallback), true) => fallback.clone(),
                _ => self.primary.clone(),
            };
            match source.get_dag(id, true).await {
                Ok(detail) => {
                    failures = 0;
                    for line in self.progress(&detail) {
                        output(&line);
                    }
                    if detail.is_finished || detail.is_awaiting_operator() {
                        if detail.state != State::Succeed {
                            for line in failure_report(&detail) {
                                output(&line);
                            }
                        }
                        return Ok(detail);
                    }
                }
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    failures += 1;
                    if failures > self.retry {
                        return Err(e);
                    }
                    if self.upgrade_mode && !on_fallback && self.fallback.is_some() {
                        warn!("查询 Dag {} 失败, 改用本地socket: {}", id, e);
                        on_fallback = true;
                    } else {
                        debug!("查询 Dag {} 失败 ({}/{}): {}", id, failures, self.retry, e);
                    }
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// 状态有变化的节点各输出一行
    pub fn progress(&mut self, detail: &DagDetail) -> Vec<String> {
        let mut lines = Vec::new();
        for node in &detail.nodes {
            if self.reported.get(&node.stage) == Some(&node.state) {
                continue;
            }
            if node.state == State::Pending && !self.reported.contains_key(&node.stage) {
                continue;
            }
            self.reported.insert(node.stage, node.state);
            lines.push(format!(
                "[{}/{}] {} ... {}",
                node.stage, detail.max_stage, node.name, node.state
            ));
        }
        lines
    }

    async fn operate(&self, id: &GenericId, operator: Operator) -> ObshellResult<DagDetail> {
        match self.primary.operate(id, operator).await {
            Ok(detail) => Ok(detail),
            Err(e) if self.upgrade_mode && !is_definitive(&e) => match &self.fallback {
                Some(fallback) => fallback.operate(id, operator).await,
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    pub async fn cancel(&self, id: &GenericId) -> ObshellResult<DagDetail> {
        self.operate(id, Operator::Cancel).await
    }

    pub async fn rollback(&self, id: &GenericId) -> ObshellResult<DagDetail> {
        self.operate(id, Operator::Rollback).await
    }

    pub async fn retry(&self, id: &GenericId) -> ObshellResult<DagDetail> {
        self.operate(id, Operator::Retry).await
    }

    pub async fn pass(&self, id: &GenericId) -> ObshellResult<DagDetail> {
        self.operate(id, Operator::Pass).await
    }
}

/// 对端已经给出结论的错误, 换一条通道也不会有不同结果
fn is_definitive(err: &ObshellError) -> bool {
    !matches!(err, ObshellError::Network(_) | ObshellError::Timeout(_))
}

/// 每个代理上失败子任务的最后一行日志
pub fn failure_report(detail: &DagDetail) -> Vec<String> {
    let mut by_agent: BTreeMap<AgentInfo, String> = BTreeMap::new();
    for node in &detail.nodes {
        for sub_task in &node.sub_tasks {
            if sub_task.state != State::Failed {
                continue;
            }
            let log = sub_task.last_log().unwrap_or("无日志").to_string();
            by_agent.insert(sub_task.executor.clone(), log);
        }
    }
    let mut lines = vec![format!(
        "Dag {} ({}) {}",
        detail.generic_id, detail.name, detail.state
    )];
    lines.extend(
        by_agent
            .into_iter()
            .map(|(agent, log)| format!("{agent}: {log}")),
    );
    lines
}
