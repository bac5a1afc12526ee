//! 本地 Unix socket
//!
//! 与 TCP 端口提供同一套路由, 只接受与代理进程同一用户的连接, 连接上的
//! 请求不需要签名。命令行在代理 TCP 端口不可用时通过它查询任务。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use axum::{
    body::Bytes,
    http::{
        header::{CONTENT_TYPE, HOST},
        Method, Request,
    },
    Extension, Router,
};
use http_body_util::{BodyExt, Full};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use obshell_core::constants::TRACE_ID_HEADER;
use obshell_errors::{ObshellError, ObshellResult};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::parse_envelope;
use crate::middleware::{current_trace_id, LocalSocket};

/// 在 `path` 上提供服务, 直到收到停止信号
pub async fn serve_unix(
    path: impl AsRef<Path>,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let path = path.as_ref().to_path_buf();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(&path)?;
    let app = app.layer(Extension(LocalSocket));
    let uid = nix::unistd::getuid().as_raw();
    info!("本地socket监听: {}", path.display());

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("接受本地连接失败: {}", e);
                        continue;
                    }
                };
                match stream.peer_cred() {
                    Ok(cred) if cred.uid() == uid => {}
                    Ok(cred) => {
                        warn!("拒绝来自 uid {} 的本地连接", cred.uid());
                        continue;
                    }
                    Err(e) => {
                        warn!("无法获取本地连接的对端凭证: {}", e);
                        continue;
                    }
                }

                let service = TowerToHyperService::new(app.clone());
                tokio::spawn(async move {
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("本地连接结束: {}", e);
                    }
                });
            }
        }
    }

    let _ = tokio::fs::remove_file(&path).await;
    info!("本地socket已关闭");
    Ok(())
}

/// 通过 Unix socket 访问本机代理
#[derive(Debug, Clone)]
pub struct UnixSocketClient {
    path: PathBuf,
}

impl UnixSocketClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn request<B, T>(&self, method: Method, uri: &str, body: Option<&B>) -> ObshellResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            ObshellError::network(format!("连接本地socket {} 失败: {e}", self.path.display()))
        })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ObshellError::network(format!("本地socket握手失败: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("本地socket连接结束: {}", e);
            }
        });

        let payload = match body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };
        let trace_id = current_trace_id().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "localhost")
            .header(TRACE_ID_HEADER, trace_id);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| ObshellError::internal(format!("构造本地请求失败: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ObshellError::network(format!("本地socket请求失败: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ObshellError::network(format!("读取本地socket响应失败: {e}")))?
            .to_bytes();
        parse_envelope(status, &bytes)
    }

    pub async fn get<T: DeserializeOwned>(&self, uri: &str) -> ObshellResult<T> {
        self.request::<(), T>(Method::GET, uri, None).await
    }

    pub async fn post<B, T>(&self, uri: &str, body: &B) -> ObshellResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::POST, uri, Some(body)).await
    }
}
