//! 代理之间的 HTTP 客户端
//!
//! 每个请求都带有以接收方公钥封装的安全头, 公钥按代理缓存。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode};
use obshell_core::constants::{API_PREFIX, RPC_PREFIX, SECURE_HEADER, TRACE_ID_HEADER};
use obshell_dispatcher::IdentityService;
use obshell_domain::{
    entities::{AgentInfo, AgentInstance, Identity},
    ports::{
        AgentRpcClient, IdentityChange, JoinRequest, MappingAck, MirrorSnapshot, RemoteSubTask,
        RemoteTaskClient,
    },
    repositories::RosterRepository,
};
use obshell_errors::{ObshellError, ObshellResult};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::middleware::current_trace_id;
use crate::models::{AgentTarget, SecretInfo};
use crate::response::OcsAgentResponse;
use crate::secure::{self, ForwardType, SecureHeader};

/// 请求的签名身份
pub enum Credentials {
    /// 命令行等外部调用方, 只持有代理密码
    Password(String),
    /// 代理自身, 密码和令牌取自当前身份
    Agent {
        identity: Arc<IdentityService>,
        roster: Arc<dyn RosterRepository>,
    },
}

struct Sender {
    agent: Option<AgentInfo>,
    password: String,
    token: String,
}

pub struct AgentClient {
    http: reqwest::Client,
    credentials: Credentials,
    public_keys: RwLock<HashMap<AgentInfo, String>>,
}

impl AgentClient {
    pub fn new(credentials: Credentials, timeout: Duration) -> ObshellResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ObshellError::network(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            http,
            credentials,
            public_keys: RwLock::new(HashMap::new()),
        })
    }

    /// 目标代理的公钥, 首次使用时通过 `/api/v1/secret` 获取
    pub async fn public_key(&self, agent: &AgentInfo) -> ObshellResult<String> {
        if let Some(key) = self.public_keys.read().await.get(agent) {
            return Ok(key.clone());
        }
        let url = format!("{}{}/secret", agent.base_url(), API_PREFIX);
        let response = self
            .http
            .get(&url)
            .header(TRACE_ID_HEADER, trace_id())
            .send()
            .await
            .map_err(|e| transport_error(agent, e))?;
        let secret: SecretInfo = read_envelope(response).await?;
        self.public_keys
            .write()
            .await
            .insert(agent.clone(), secret.public_key.clone());
        Ok(secret.public_key)
    }

    /// 跟随者按自身令牌被主节点识别, 主节点访问跟随者时使用跟随者的令牌
    async fn sender(&self, target: &AgentInfo) -> ObshellResult<Sender> {
        match &self.credentials {
            Credentials::Password(password) => Ok(Sender {
                agent: None,
                password: password.clone(),
                token: String::new(),
            }),
            Credentials::Agent { identity, roster } => {
                let me = identity.current().await;
                let mut token = me.token.clone();
                if me.identity == Identity::Master && &me.agent != target {
                    if let Some(entry) = roster.get(target).await? {
                        if entry.identity == Identity::Follower {
                            token = entry.token;
                        }
                    }
                }
                Ok(Sender {
                    agent: Some(me.agent),
                    password: me.password,
                    token,
                })
            }
        }
    }

    /// 为发往 `target` 的请求签名, 转发时标明转发方
    pub async fn sign(
        &self,
        target: &AgentInfo,
        uri: &str,
        forward_type: ForwardType,
    ) -> ObshellResult<SecureHeader> {
        let sender = self.sender(target).await?;
        let mut header = SecureHeader::new(path_of(uri), &sender.password)?.with_token(sender.token);
        if forward_type != ForwardType::None {
            if let Some(agent) = sender.agent {
                header = header.forwarded(forward_type, agent);
            }
        }
        Ok(header)
    }

    /// 转发已签名的请求, 请求体原样发送
    #[allow(clippy::too_many_arguments)]
    pub async fn send_raw(
        &self,
        target: &AgentInfo,
        method: Method,
        path_and_query: &str,
        header: &SecureHeader,
        content_type: Option<&HeaderValue>,
        trace_id: &str,
        body: Bytes,
    ) -> ObshellResult<reqwest::Response> {
        let sealed = secure::seal(&self.public_key(target).await?, header)?;
        let mut request = self
            .http
            .request(method, format!("{}{}", target.base_url(), path_and_query))
            .header(SECURE_HEADER, sealed)
            .header(TRACE_ID_HEADER, trace_id)
            .body(body);
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        request.send().await.map_err(|e| transport_error(target, e))
    }

    pub async fn request<B, T>(
        &self,
        target: &AgentInfo,
        method: Method,
        uri: &str,
        body: Option<&B>,
        forward_type: ForwardType,
    ) -> ObshellResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut header = self.sign(target, uri, forward_type).await?;
        let payload = match body {
            Some(body) => {
                let plain = serde_json::to_vec(body)?;
                let key = secure::generate_body_key();
                let sealed = secure::encrypt_body(&key, &plain)?;
                header = header.with_body_key(key);
                Bytes::from(sealed)
            }
            None => Bytes::new(),
        };
        let content_type = HeaderValue::from_static("application/json");
        debug!("{} {}{}", method, target, uri);
        let response = self
            .send_raw(
                target,
                method,
                uri,
                &header,
                body.map(|_| &content_type),
                &trace_id(),
                payload,
            )
            .await?;
        read_envelope(response).await
    }

    pub async fn get<T: DeserializeOwned>(&self, target: &AgentInfo, uri: &str) -> ObshellResult<T> {
        self.request::<(), T>(target, Method::GET, uri, None, ForwardType::None)
            .await
    }

    pub async fn post<B, T>(&self, target: &AgentInfo, uri: &str, body: &B) -> ObshellResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(target, Method::POST, uri, Some(body), ForwardType::None)
            .await
    }
}

fn path_of(uri: &str) -> &str {
    uri.split_once('?').map_or(uri, |(path, _)| path)
}

fn trace_id() -> String {
    current_trace_id().unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn transport_error(agent: &AgentInfo, err: reqwest::Error) -> ObshellError {
    if err.is_timeout() {
        ObshellError::timeout(format!("请求 {agent} 超时: {err}"))
    } else {
        ObshellError::network(format!("请求 {agent} 失败: {err}"))
    }
}

async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> ObshellResult<T> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| ObshellError::network(format!("读取响应失败: {e}")))?;
    parse_envelope(status, &body)
}

/// 解析响应信封, 失败的响应还原为对应的错误
pub(crate) fn parse_envelope<T: DeserializeOwned>(
    status: StatusCode,
    body: &[u8],
) -> ObshellResult<T> {
    let envelope: OcsAgentResponse<serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| {
            ObshellError::unexpected_with_cause(format!("无法解析的响应 (HTTP {status})"), e)
        })?;
    if !envelope.successful {
        return Err(match envelope.error {
            Some(detail) => detail.into_error(),
            None => ObshellError::unexpected(format!("请求失败 (HTTP {status})")),
        });
    }
    let data = envelope.data.unwrap_or(serde_json::Value::Null);
    Ok(serde_json::from_value(data)?)
}

#[async_trait]
impl RemoteTaskClient for AgentClient {
    async fn dispatch_sub_task(&self, agent: &AgentInfo, task: &RemoteSubTask) -> ObshellResult<()> {
        self.post(agent, &format!("{RPC_PREFIX}/task/sub_task"), task)
            .await
    }

    async fn fetch_unsynced(&self, agent: &AgentInfo) -> ObshellResult<Vec<MirrorSnapshot>> {
        self.get(agent, &format!("{RPC_PREFIX}/task/mapping/unsynced"))
            .await
    }

    async fn ack_synced(&self, agent: &AgentInfo, acks: &[MappingAck]) -> ObshellResult<()> {
        let _: usize = self
            .post(agent, &format!("{RPC_PREFIX}/task/mapping/ack"), acks)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AgentRpcClient for AgentClient {
    async fn get_agent(&self, agent: &AgentInfo) -> ObshellResult<AgentInstance> {
        self.get(agent, &format!("{RPC_PREFIX}/agent")).await
    }

    async fn join_master(&self, master: &AgentInfo, request: &JoinRequest) -> ObshellResult<()> {
        self.post(master, &format!("{RPC_PREFIX}/agent/join"), request)
            .await
    }

    async fn leave_master(&self, master: &AgentInfo, follower: &AgentInfo) -> ObshellResult<()> {
        let body = AgentTarget {
            agent: follower.clone(),
        };
        self.post(master, &format!("{RPC_PREFIX}/agent/remove"), &body)
            .await
    }

    async fn change_identity(
        &self,
        agent: &AgentInfo,
        change: &IdentityChange,
    ) -> ObshellResult<()> {
        let action = if change.identity == Identity::Single {
            "demote"
        } else {
            "promote"
        };
        self.post(agent, &format!("{RPC_PREFIX}/agent/{action}"), change)
            .await
    }
}
