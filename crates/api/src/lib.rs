//! # OBShell Agent API
//!
//! 代理的 HTTP 边界, 基于 axum。
//!
//! ## 路由
//!
//! - `/api/v1/...` 对外接口: 代理信息、成员变更、任务查询与人工操作
//! - `/rpc/v1/...` 代理之间的内部调用: 加入/离开主节点、身份变更、子任务派发与同步
//!
//! ## 请求处理链
//!
//! ```text
//! TraceLayer -> trace_context -> request_logging -> CatchPanic -> verify_request -> handler
//! ```
//!
//! `verify_request` 负责安全头校验 (见 [`secure`]), 跟随者到主节点的自动转发,
//! 以及扩缩容请求到维护者的转发。
//!
//! ## 响应格式
//!
//! ```json
//! {"status": 200, "successful": true, "data": {...}, "trace_id": "...", "duration": 3}
//! {"status": 404, "successful": false, "error": {"code": "DagNotFound", "message": "..."}, "trace_id": "..."}
//! ```

pub mod client;
pub mod dag_handler;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod response;
pub mod routes;
pub mod secure;
pub mod socket;

use std::future::Future;

use axum::{extract::DefaultBodyLimit, Router};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use middleware::{cors_layer, handle_panic, request_logging, trace_context, trace_layer, verify_request};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();
    let mut app = create_routes(state.clone())
        .layer(axum::middleware::from_fn_with_state(state, verify_request))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(axum::middleware::from_fn(trace_context))
        .layer(DefaultBodyLimit::max(config.max_request_size_mb * 1024 * 1024))
        .layer(trace_layer());
    if config.cors_enabled {
        app = app.layer(cors_layer(&config));
    }
    app
}

/// 在 TCP 端口上提供服务, `shutdown` 完成后优雅退出
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("HTTP服务监听: {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
