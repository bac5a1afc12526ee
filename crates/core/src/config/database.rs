use serde::{Deserialize, Serialize};

/// 元数据库配置
///
/// `local_url` 为本代理私有的元数据库, `cluster_url` 为集群共享的元数据库,
/// 同一集群的所有代理必须配置相同的 `cluster_url`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub local_url: String,
    pub cluster_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            local_url: "sqlite://data/obshell_local.db".to_string(),
            cluster_url: "sqlite://data/obshell_cluster.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, url) in [("local_url", &self.local_url), ("cluster_url", &self.cluster_url)] {
            if url.is_empty() {
                return Err(anyhow::anyhow!("数据库URL不能为空: {name}"));
            }
            if !url.starts_with("sqlite:") {
                return Err(anyhow::anyhow!("数据库URL必须是SQLite格式: {name}"));
            }
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.min_connections > self.max_connections {
            return Err(anyhow::anyhow!("最小连接数不能大于最大连接数"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }
}
