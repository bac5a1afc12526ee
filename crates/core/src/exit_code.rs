//! 进程退出码
//!
//! 守护进程根据退出码决定是否重新拉起服务: 保留退出码表示不可恢复的原因,
//! 收到后停止重启; 其余退出码视为未知异常, 继续重启。

pub const SUCCESS: i32 = 0;
pub const UNKNOWN: i32 = 1;
pub const INVALID_AGENT: i32 = 2;
pub const IP_MISMATCH: i32 = 3;
pub const OB_START_FAILED: i32 = 4;
pub const OB_CONNECT_TIMEOUT: i32 = 5;
pub const PERMISSION_DENIED: i32 = 6;
pub const UPGRADE_BINARY_FAILED: i32 = 7;
pub const CONFIG_ERROR: i32 = 8;
pub const PORT_IN_USE: i32 = 9;

const RESERVED: [i32; 8] = [
    INVALID_AGENT,
    IP_MISMATCH,
    OB_START_FAILED,
    OB_CONNECT_TIMEOUT,
    PERMISSION_DENIED,
    UPGRADE_BINARY_FAILED,
    CONFIG_ERROR,
    PORT_IN_USE,
];

pub fn is_reserved(code: i32) -> bool {
    RESERVED.contains(&code)
}

pub fn describe(code: i32) -> &'static str {
    match code {
        SUCCESS => "正常退出",
        INVALID_AGENT => "无效的代理",
        IP_MISMATCH => "IP不匹配",
        OB_START_FAILED => "数据库启动失败",
        OB_CONNECT_TIMEOUT => "数据库连接超时",
        PERMISSION_DENIED => "权限不足",
        UPGRADE_BINARY_FAILED => "升级二进制失败",
        CONFIG_ERROR => "配置错误",
        PORT_IN_USE => "端口被占用",
        _ => "未知错误",
    }
}
