use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::constants::{AGENT_VERSION, DEFAULT_AGENT_PORT};

/// 代理自身配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub ip: String,
    pub port: u16,
    pub zone: String,
    pub version: String,
    /// 代理密码, 为空时单机模式下不校验请求
    pub password: String,
    pub rsa_key_bits: usize,
    pub socket_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: DEFAULT_AGENT_PORT,
            zone: "zone1".to_string(),
            version: AGENT_VERSION.to_string(),
            password: String::new(),
            rsa_key_bits: 2048,
            socket_path: "run/obshell.sock".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ip.parse::<IpAddr>().is_err() {
            return Err(anyhow::anyhow!("代理IP地址无效: {}", self.ip));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("代理端口必须大于0"));
        }
        if self.zone.is_empty() {
            return Err(anyhow::anyhow!("zone不能为空"));
        }
        if self.version.is_empty() {
            return Err(anyhow::anyhow!("版本号不能为空"));
        }
        if self.rsa_key_bits < 1024 {
            return Err(anyhow::anyhow!("RSA密钥长度不能小于1024"));
        }
        if self.socket_path.is_empty() {
            return Err(anyhow::anyhow!("Unix socket路径不能为空"));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}
