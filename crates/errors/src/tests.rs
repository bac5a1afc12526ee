use crate::*;

#[test]
fn test_obshell_error_display() {
    let err = ObshellError::IllegalArgument("id is empty".to_string());
    assert_eq!(err.to_string(), "非法参数: id is empty");

    let err = ObshellError::dag_not_found("2-127.0.0.1-2886-1");
    assert_eq!(err.to_string(), "Dag未找到: 2-127.0.0.1-2886-1");

    let err = ObshellError::node_not_found(7);
    assert_eq!(err.to_string(), "Node未找到: 7");

    let err = ObshellError::Cancelled;
    assert_eq!(err.to_string(), "任务已取消");

    let err = ObshellError::no_affected_rows("sub_task 3");
    assert_eq!(err.to_string(), "没有记录被更新: sub_task 3");

    let err = ObshellError::unexpected_with_cause("forward failed", "connection refused");
    assert_eq!(err.to_string(), "未知错误: forward failed");
    match err {
        ObshellError::Unexpected { cause, .. } => {
            assert_eq!(cause.as_deref(), Some("connection refused"));
        }
        _ => panic!("Expected Unexpected"),
    }
}

#[test]
fn test_error_codes_are_stable() {
    assert_eq!(
        ObshellError::maintenance_conflict("dag 1").code(),
        "MaintenanceInProgress"
    );
    assert_eq!(ObshellError::unauthorized("bad ts").code(), "Unauthorized");
    assert_eq!(
        ObshellError::operator_not_supported("pass").code(),
        "OperatorNotSupported"
    );
    assert_eq!(ObshellError::sub_task_not_found(1).code(), "SubTaskNotFound");
    assert_eq!(ObshellError::unexpected("boom").code(), "Unexpected");
}

#[test]
fn test_error_classification() {
    assert!(ObshellError::no_affected_rows("x").is_retryable());
    assert!(ObshellError::network("x").is_retryable());
    assert!(!ObshellError::illegal_argument("x").is_retryable());
    assert!(!ObshellError::Cancelled.is_retryable());

    assert!(ObshellError::dag_not_found(1).is_not_found());
    assert!(ObshellError::sub_task_not_found(1).is_not_found());
    assert!(!ObshellError::conflict("x").is_not_found());

    assert!(ObshellError::internal("x").is_fatal());
    assert!(ObshellError::config_error("x").is_fatal());
    assert!(!ObshellError::timeout("x").is_fatal());
}

#[test]
fn test_unauthorized_user_message_hides_reason() {
    let err = ObshellError::unauthorized("timestamp expired at 1700000000000");
    assert_eq!(err.user_message(), "认证失败");
    assert!(!err.user_message().contains("timestamp"));
}

#[test]
fn test_serde_json_conversion() {
    let parse: Result<serde_json::Value, _> = serde_json::from_str("{invalid");
    let err: ObshellError = parse.unwrap_err().into();
    assert!(matches!(err, ObshellError::Serialization(_)));
}

#[test]
fn test_anyhow_conversion() {
    let err: ObshellError = anyhow::anyhow!("boom").into();
    assert!(matches!(err, ObshellError::Internal(ref m) if m == "boom"));
}
