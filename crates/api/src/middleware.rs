use std::any::Any;
use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use obshell_core::{
    config::ApiConfig,
    constants::{API_PREFIX, SECURE_HEADER, TRACE_ID_HEADER},
};
use obshell_domain::entities::{AgentIdentity, AgentInfo, Identity};
use obshell_errors::{ObshellError, ObshellResult};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any as AnyOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::response::OcsAgentResponse;
use crate::routes::AppState;
use crate::secure::{decrypt_body, ForwardType, SecureHeader};

/// 单次请求的上下文
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub start: Instant,
}

tokio::task_local! {
    static REQUEST: RequestContext;
}

/// 当前请求的追踪id, 不在请求处理过程中时为 `None`
pub fn current_trace_id() -> Option<String> {
    REQUEST.try_with(|ctx| ctx.trace_id.clone()).ok()
}

pub fn elapsed_ms() -> Option<u64> {
    REQUEST
        .try_with(|ctx| ctx.start.elapsed().as_millis() as u64)
        .ok()
}

/// 通过本地 Unix socket 到达的请求
#[derive(Debug, Clone, Copy)]
pub struct LocalSocket;

/// 沿用调用方的追踪id, 没有时生成一个, 并写回响应头
pub async fn trace_context(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let header = HeaderValue::from_str(&trace_id).ok();
    if let Some(value) = &header {
        request.headers_mut().insert(TRACE_ID_HEADER, value.clone());
    }

    let ctx = RequestContext {
        trace_id,
        start: Instant::now(),
    };
    let mut response = REQUEST.scope(ctx, next.run(request)).await;
    if let Some(value) = header {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let trace_id = current_trace_id().unwrap_or_default();
    let start = Instant::now();

    debug!("开始处理请求: {} {} [{}]", method, uri, trace_id);

    let response = next.run(request).await;

    info!(
        "完成请求处理: {} {} - 状态: {} - 耗时: {:?} [{}]",
        method,
        uri,
        response.status(),
        start.elapsed(),
        trace_id
    );

    response
}

pub fn cors_layer(config: &ApiConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(AnyOrigin);
    if config.cors_origins.iter().any(|o| o == "*") {
        layer.allow_origin(AnyOrigin)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}

pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "未知panic".to_string()
    };
    error!("请求处理发生panic: {}", detail);
    OcsAgentResponse::<()>::failure(
        StatusCode::INTERNAL_SERVER_ERROR,
        "InternalError",
        "系统繁忙，请稍后重试",
    )
    .into_response()
}

const PUBLIC_PATHS: &[&str] = &[
    "/api/v1/time",
    "/api/v1/info",
    "/api/v1/git-info",
    "/api/v1/status",
    "/api/v1/secret",
];

/// 只能由维护者处理的接口
const MAINTAINER_PATHS: &[&str] = &["/api/v1/ob/scale_out", "/api/v1/ob/scale_in"];

fn is_public(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
}

enum Gate {
    Local(Request),
    Forwarded(Response),
}

/// 认证与转发
///
/// - 跟随者收到的 API 请求自动转发给主节点
/// - 主节点和集群代理校验签名、时间戳和 URI, 转发而来的请求还要校验转发方令牌
/// - 非维护者收到扩缩容请求时转发给维护者
/// - 本地 socket 上的请求视为可信, 不校验签名
pub async fn verify_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if is_public(request.uri().path()) {
        return next.run(request).await;
    }
    match authorize(&state, request).await {
        Ok(Gate::Local(request)) => next.run(request).await,
        Ok(Gate::Forwarded(response)) => response,
        Err(err) => err.into_response(),
    }
}

async fn authorize(state: &AppState, request: Request) -> ApiResult<Gate> {
    let path = request.uri().path().to_string();
    let me = state.identity.current().await;
    let trusted = request.extensions().get::<LocalSocket>().is_some()
        || (me.identity == Identity::Single && me.password.is_empty());
    let header = open_header(state, &request)?;
    let window_ms = (state.config.auth_expired_duration_seconds * 1000) as i64;

    if !trusted {
        let header = header
            .as_ref()
            .ok_or_else(|| ObshellError::unauthorized(format!("请求 {path} 缺少安全头")))?;
        check_signature(header, &path, &me.password, window_ms)?;
    }

    let manual = header
        .as_ref()
        .is_some_and(|h| h.forward_type == ForwardType::ManualForward);

    if me.identity.is_follower_like() && path.starts_with(API_PREFIX) && !manual {
        if let Some(master) = me.master.clone() {
            debug!("{} 转发给主节点 {}", path, master);
            let response = forward(state, request, &master, header, ForwardType::AutoForward).await?;
            return Ok(Gate::Forwarded(response));
        }
    }

    if let Some(header) = &header {
        if !trusted {
            check_token(state, &me, header).await?;
        }
    }

    if me.identity == Identity::ClusterAgent
        && request.method() == Method::POST
        && MAINTAINER_PATHS.contains(&path.as_str())
        && header.as_ref().map_or(true, |h| h.forward_agent.is_none())
    {
        if let Some(maintainer) = remote_maintainer(state, &me.agent).await? {
            debug!("{} 转发给维护者 {}", path, maintainer);
            let response =
                forward(state, request, &maintainer, header, ForwardType::ManualForward).await?;
            return Ok(Gate::Forwarded(response));
        }
    }

    let request = match header {
        Some(header) => accept_header(state, request, header).await?,
        None => request,
    };
    Ok(Gate::Local(request))
}

fn open_header(state: &AppState, request: &Request) -> ObshellResult<Option<SecureHeader>> {
    let Some(value) = request.headers().get(SECURE_HEADER) else {
        return Ok(None);
    };
    let sealed = value
        .to_str()
        .map_err(|_| ObshellError::unauthorized("安全头包含非法字符"))?;
    state
        .keys
        .open(sealed)
        .map(Some)
        .map_err(|e| ObshellError::unauthorized(format!("无法打开安全头: {e}")))
}

fn check_signature(
    header: &SecureHeader,
    path: &str,
    password: &str,
    window_ms: i64,
) -> ObshellResult<()> {
    if header.uri != path {
        return Err(ObshellError::unauthorized(format!(
            "签名URI {} 与请求 {} 不一致",
            header.uri, path
        )));
    }
    if header.is_expired(Utc::now().timestamp_millis(), window_ms) {
        return Err(ObshellError::unauthorized(format!(
            "签名时间戳 {} 已过期",
            header.ts
        )));
    }
    if !header.verify_auth(password) {
        return Err(ObshellError::unauthorized("签名校验失败"));
    }
    Ok(())
}

/// 转发方或跟随者的令牌校验
async fn check_token(state: &AppState, me: &AgentIdentity, header: &SecureHeader) -> ApiResult<()> {
    // 转发请求必须带上转发方
    if header.forward_type != ForwardType::None && header.forward_agent.is_none() {
        return Err(ObshellError::unauthorized(format!(
            "{:?} 请求缺少转发方",
            header.forward_type
        ))
        .into());
    }
    if me.identity.is_follower_like() {
        if header.token != me.token {
            return Err(ObshellError::unauthorized("跟随者令牌不匹配").into());
        }
        return Ok(());
    }
    let Some(forwarder) = &header.forward_agent else {
        return Ok(());
    };
    let expected = match me.identity {
        Identity::Master => state
            .membership
            .context()
            .roster
            .get(forwarder)
            .await?
            .map(|entry| entry.token),
        Identity::ClusterAgent | Identity::TakeOverMaster => state
            .membership
            .context()
            .cluster_agents
            .get(forwarder)
            .await?
            .map(|agent| agent.token),
        _ => return Ok(()),
    };
    match expected {
        Some(token) if token == header.token => Ok(()),
        _ => Err(ObshellError::unauthorized(format!("转发方 {forwarder} 令牌不匹配")).into()),
    }
}

/// 集群中的另一个维护者; 本代理就是维护者或者暂无维护者时为 `None`
async fn remote_maintainer(state: &AppState, me: &AgentInfo) -> ObshellResult<Option<AgentInfo>> {
    let Some(coordinator) = &state.maintainer else {
        return Ok(None);
    };
    if coordinator.is_maintainer() {
        return Ok(None);
    }
    Ok(coordinator.maintainer().await?.filter(|m| m != me))
}

fn body_limit(state: &AppState) -> usize {
    state.config.max_request_size_mb * 1024 * 1024
}

/// 记录已校验的安全头, 解密请求体
async fn accept_header(
    state: &AppState,
    request: Request,
    header: SecureHeader,
) -> ApiResult<Request> {
    let (mut parts, body) = request.into_parts();
    let body = match &header.keys {
        Some(key) => {
            let sealed = to_bytes(body, body_limit(state))
                .await
                .map_err(|e| ApiError::BadRequest(format!("读取请求体失败: {e}")))?;
            parts.headers.remove(CONTENT_LENGTH);
            if sealed.is_empty() {
                Body::empty()
            } else {
                let plain = decrypt_body(key, &sealed)
                    .map_err(|e| ObshellError::unauthorized(format!("请求体解密失败: {e}")))?;
                Body::from(plain)
            }
        }
        None => body,
    };
    parts.extensions.insert(header);
    Ok(Request::from_parts(parts, body))
}

/// 以本代理身份重新签名并转发, 请求体原样传递
async fn forward(
    state: &AppState,
    request: Request,
    target: &AgentInfo,
    incoming: Option<SecureHeader>,
    forward_type: ForwardType,
) -> ApiResult<Response> {
    let path = request.uri().path().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let signed = state.client.sign(target, &path, forward_type).await?;
    let header = match incoming {
        Some(mut header) => {
            header.token = signed.token;
            header.forward_type = signed.forward_type;
            header.forward_agent = signed.forward_agent;
            header
        }
        None => signed,
    };

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, body_limit(state))
        .await
        .map_err(|e| ApiError::BadRequest(format!("读取请求体失败: {e}")))?;
    let trace_id = current_trace_id().unwrap_or_default();
    let response = state
        .client
        .send_raw(
            target,
            parts.method,
            &path_and_query,
            &header,
            parts.headers.get(CONTENT_TYPE),
            &trace_id,
            body,
        )
        .await
        .map_err(|e| {
            warn!("转发 {} 到 {} 失败: {}", path, target, e);
            ApiError::Forward(e.to_string())
        })?;
    relay(response).await
}

async fn relay(response: reqwest::Response) -> ApiResult<Response> {
    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Forward(format!("读取转发响应失败: {e}")))?;
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Forward(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trace_id_outside_request_is_none() {
        assert!(current_trace_id().is_none());
        assert!(elapsed_ms().is_none());
    }

    #[tokio::test]
    async fn test_trace_id_inside_scope() {
        let ctx = RequestContext {
            trace_id: "trace-1".to_string(),
            start: Instant::now(),
        };
        let seen = REQUEST.scope(ctx, async { current_trace_id() }).await;
        assert_eq!(seen.as_deref(), Some("trace-1"));
    }

    #[tokio::test]
    async fn test_handle_panic_returns_envelope() {
        let response = handle_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "InternalError");
        assert!(!json["error"]["message"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn test_signature_checks() {
        let header = SecureHeader::new("/api/v1/agents", "pwd").unwrap();
        assert!(check_signature(&header, "/api/v1/agents", "pwd", 60_000).is_ok());
        assert!(check_signature(&header, "/api/v1/ob/init", "pwd", 60_000).is_err());
        assert!(check_signature(&header, "/api/v1/agents", "other", 60_000).is_err());

        let mut stale = header.clone();
        stale.ts -= 120_000;
        assert!(check_signature(&stale, "/api/v1/agents", "pwd", 60_000).is_err());
    }

    #[test]
    fn test_public_paths() {
        assert!(is_public("/api/v1/secret"));
        assert!(is_public("/api/v1/time"));
        assert!(!is_public("/api/v1/agents"));
        assert!(!is_public("/rpc/v1/agent"));
    }
}
