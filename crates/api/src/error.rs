use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use obshell_errors::ObshellError;
use tracing::{error, warn};

use crate::response::OcsAgentResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Obshell(#[from] ObshellError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源: {0}")]
    NotFound(String),

    /// 转发给其他代理失败, 对调用方表现为未知错误
    #[error("转发请求失败: {0}")]
    Forward(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Obshell(err) => status_of(err),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forward(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Obshell(err) => err.code(),
            ApiError::BadRequest(_) => "IllegalArgument",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Forward(_) => "Unexpected",
        }
    }

    /// 对外展示的消息, 认证失败和内部错误不暴露细节
    pub fn message(&self) -> String {
        match self {
            ApiError::Obshell(err) => err.user_message(),
            ApiError::BadRequest(msg) => format!("参数错误: {msg}"),
            ApiError::NotFound(path) => format!("{path} 不存在"),
            ApiError::Forward(_) => "系统繁忙，请稍后重试".to_string(),
        }
    }
}

fn status_of(err: &ObshellError) -> StatusCode {
    match err {
        ObshellError::IllegalArgument(_) | ObshellError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        ObshellError::OperatorNotSupported(_) => StatusCode::BAD_REQUEST,
        ObshellError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ObshellError::MaintenanceConflict(_)
        | ObshellError::Conflict(_)
        | ObshellError::NoAffectedRows(_) => StatusCode::CONFLICT,
        ObshellError::DagNotFound { .. }
        | ObshellError::NodeNotFound { .. }
        | ObshellError::SubTaskNotFound { .. } => StatusCode::NOT_FOUND,
        ObshellError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ObshellError::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        } else if status == StatusCode::UNAUTHORIZED {
            warn!("请求认证失败: {}", self);
        }
        OcsAgentResponse::<()>::failure(status, self.code(), self.message()).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ObshellError::illegal_argument("x"), StatusCode::BAD_REQUEST),
            (ObshellError::unauthorized("x"), StatusCode::UNAUTHORIZED),
            (ObshellError::maintenance_conflict("x"), StatusCode::CONFLICT),
            (ObshellError::dag_not_found(1), StatusCode::NOT_FOUND),
            (ObshellError::sub_task_not_found(1), StatusCode::NOT_FOUND),
            (ObshellError::operator_not_supported("x"), StatusCode::BAD_REQUEST),
            (ObshellError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (
                ObshellError::unexpected_with_cause("x", "y"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_unauthorized_hides_reason() {
        let err = ApiError::from(ObshellError::unauthorized("签名时间戳过期"));
        assert_eq!(err.code(), "Unauthorized");
        assert!(!err.message().contains("时间戳"));
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let err = ApiError::from(ObshellError::internal("连接池耗尽"));
        assert!(!err.message().contains("连接池"));
        assert_eq!(ApiError::Forward("connection refused".into()).code(), "Unexpected");
    }

    #[test]
    fn test_into_response_status() {
        let response = ApiError::from(ObshellError::dag_not_found("2-127.0.0.1-2886-9"))
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ApiError::BadRequest("bad".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
