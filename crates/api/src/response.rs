use axum::{http::StatusCode, response::IntoResponse, Json};
use obshell_errors::ObshellError;
use serde::{Deserialize, Serialize};

use crate::middleware::{current_trace_id, elapsed_ms};

/// 统一响应信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcsAgentResponse<T> {
    pub status: u16,
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub trace_id: String,
    /// 处理耗时, 毫秒
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    /// 还原对端返回的错误, 供代理间调用的调用方使用
    pub fn into_error(self) -> ObshellError {
        let ErrorDetail { code, message } = self;
        match code.as_str() {
            "IllegalArgument" => ObshellError::IllegalArgument(message),
            "Unauthorized" => ObshellError::Unauthorized(message),
            "MaintenanceInProgress" => ObshellError::MaintenanceConflict(message),
            "Conflict" => ObshellError::Conflict(message),
            "DagNotFound" => ObshellError::DagNotFound { id: message },
            "NodeNotFound" => ObshellError::NodeNotFound { id: message },
            "SubTaskNotFound" => ObshellError::SubTaskNotFound { id: message },
            "OperatorNotSupported" => ObshellError::OperatorNotSupported(message),
            "NoAffectedRows" => ObshellError::NoAffectedRows(message),
            "Timeout" => ObshellError::Timeout(message),
            "Cancelled" => ObshellError::Cancelled,
            _ => ObshellError::Unexpected {
                message,
                cause: Some(code),
            },
        }
    }
}

impl<T> OcsAgentResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            successful: true,
            data: Some(data),
            error: None,
            trace_id: current_trace_id().unwrap_or_default(),
            duration: elapsed_ms(),
        }
    }

    pub fn failure<C: Into<String>, M: Into<String>>(status: StatusCode, code: C, message: M) -> Self {
        Self {
            status: status.as_u16(),
            successful: false,
            data: None,
            error: Some(ErrorDetail {
                code: code.into(),
                message: message.into(),
            }),
            trace_id: current_trace_id().unwrap_or_default(),
            duration: None,
        }
    }
}

impl<T: Serialize> IntoResponse for OcsAgentResponse<T> {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> OcsAgentResponse<T> {
    OcsAgentResponse::success(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let response = success(vec![1, 2, 3]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["successful"], true);
        assert_eq!(json["data"], serde_json::json!([1, 2, 3]));
        assert!(json.get("error").is_none());
        assert!(json.get("trace_id").is_some());
    }

    #[test]
    fn test_failure_envelope_shape() {
        let response =
            OcsAgentResponse::<()>::failure(StatusCode::NOT_FOUND, "DagNotFound", "任务 x 不存在");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["successful"], false);
        assert_eq!(json["error"]["code"], "DagNotFound");
        assert!(json.get("data").is_none());
        assert!(json.get("duration").is_none());
    }

    #[test]
    fn test_error_detail_restores_kind() {
        let restored = ErrorDetail {
            code: "MaintenanceInProgress".to_string(),
            message: "Dag 3".to_string(),
        }
        .into_error();
        assert!(matches!(restored, ObshellError::MaintenanceConflict(_)));

        let restored = ErrorDetail {
            code: "SomethingNew".to_string(),
            message: "boom".to_string(),
        }
        .into_error();
        assert!(matches!(restored, ObshellError::Unexpected { .. }));
    }

    #[test]
    fn test_envelope_deserializes_without_optional_fields() {
        let parsed: OcsAgentResponse<String> =
            serde_json::from_str(r#"{"status":200,"successful":true,"data":"ok"}"#).unwrap();
        assert_eq!(parsed.data.as_deref(), Some("ok"));
        assert!(parsed.trace_id.is_empty());
    }
}
