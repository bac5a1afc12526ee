use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{AgentInfo, TaskScope};
use crate::{ObshellError, ObshellResult};

/// 带归属信息的任务标识: `<scope>-<ip>-<port>-<id>`
///
/// 路由层据此判断请求由本地服务处理, 还是转发给拥有该元数据的代理。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenericId {
    pub scope: TaskScope,
    pub agent: AgentInfo,
    pub id: i64,
}

impl GenericId {
    pub fn new(scope: TaskScope, agent: AgentInfo, id: i64) -> Self {
        Self { scope, agent, id }
    }

    pub fn cluster(agent: AgentInfo, id: i64) -> Self {
        Self::new(TaskScope::Cluster, agent, id)
    }

    pub fn local(agent: AgentInfo, id: i64) -> Self {
        Self::new(TaskScope::Local, agent, id)
    }

    pub fn is_cluster(&self) -> bool {
        self.scope == TaskScope::Cluster
    }
}

impl fmt::Display for GenericId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.scope.code(),
            self.agent.ip,
            self.agent.port,
            self.id
        )
    }
}

impl FromStr for GenericId {
    type Err = ObshellError;

    fn from_str(s: &str) -> ObshellResult<Self> {
        let invalid = || ObshellError::illegal_argument(format!("无效的任务ID: {s}"));

        let (scope, rest) = s.split_once('-').ok_or_else(invalid)?;
        let mut parts = rest.rsplitn(3, '-');
        let id = parts.next().ok_or_else(invalid)?;
        let port = parts.next().ok_or_else(invalid)?;
        let ip = parts.next().ok_or_else(invalid)?;
        if ip.is_empty() {
            return Err(invalid());
        }

        let scope = TaskScope::from_code(scope.parse::<u8>().map_err(|_| invalid())?)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let id = id.parse::<i64>().map_err(|_| invalid())?;
        if id <= 0 {
            return Err(invalid());
        }

        Ok(Self::new(scope, AgentInfo::new(ip, port), id))
    }
}

impl Serialize for GenericId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GenericId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_id_is_bijective() {
        for text in [
            "1-127.0.0.1-2886-1",
            "2-10.10.10.10-2887-424242",
            "2-fe80::1-2886-9",
        ] {
            let id: GenericId = text.parse().unwrap();
            assert_eq!(id.to_string(), text);
        }

        let id = GenericId::cluster(AgentInfo::new("192.168.0.2", 2886), 77);
        assert_eq!(id.to_string().parse::<GenericId>().unwrap(), id);
        assert!(id.is_cluster());
    }

    #[test]
    fn test_generic_id_rejects_garbage() {
        for text in [
            "",
            "1",
            "3-127.0.0.1-2886-1",
            "1-127.0.0.1-2886",
            "1--2886-1",
            "1-127.0.0.1-port-1",
            "1-127.0.0.1-2886-abc",
            "1-127.0.0.1-2886-0",
        ] {
            assert!(text.parse::<GenericId>().is_err(), "{text} should fail");
        }
    }

    #[test]
    fn test_generic_id_serde_as_string() {
        let id = GenericId::local(AgentInfo::new("127.0.0.1", 2886), 5);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"2-127.0.0.1-2886-5\"");
        let back: GenericId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
