use std::collections::BTreeMap;

use obshell_core::constants::TASK_CONTEXT_VERSION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AgentInfo;
use crate::{ObshellError, ObshellResult};

/// 任务上下文
///
/// Dag 内所有子任务共享的键值集合, 也是子任务之间唯一持久化的数据通道:
/// - `params`: 创建 Dag 时给定的输入, 之后只读
/// - `data`: 前序子任务写入, 后续子任务读取
/// - `execute_agents`: 节点扇出时使用的执行代理列表
///
/// 序列化结果带版本号, 旧版本程序读取新版本上下文会直接失败。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub version: u32,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub execute_agents: Vec<AgentInfo>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            version: TASK_CONTEXT_VERSION,
            params: BTreeMap::new(),
            data: BTreeMap::new(),
            execute_agents: Vec::new(),
        }
    }

    pub fn with_param<K: Into<String>, V: Serialize>(mut self, key: K, value: V) -> Self {
        self.set_param(key, value);
        self
    }

    /// 从 JSON 对象构造参数集合, 非对象值视为非法参数
    pub fn from_params(params: Value) -> ObshellResult<Self> {
        let mut ctx = Self::new();
        match params {
            Value::Object(map) => {
                ctx.params = map.into_iter().collect();
                Ok(ctx)
            }
            Value::Null => Ok(ctx),
            other => Err(ObshellError::illegal_argument(format!(
                "任务参数必须是JSON对象: {other}"
            ))),
        }
    }

    pub fn set_param<K: Into<String>, V: Serialize>(&mut self, key: K, value: V) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.params.insert(key.into(), value);
    }

    pub fn get_param<T: DeserializeOwned>(&self, key: &str) -> ObshellResult<T> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| ObshellError::illegal_argument(format!("缺少任务参数: {key}")))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn set_data<K: Into<String>, V: Serialize>(&mut self, key: K, value: V) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.data.insert(key.into(), value);
    }

    pub fn get_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// 合并另一个上下文写入的 `data`, 已有键被覆盖
    pub fn merge_data(&mut self, other: &TaskContext) {
        for (key, value) in &other.data {
            self.data.insert(key.clone(), value.clone());
        }
    }

    pub fn with_execute_agents(mut self, agents: Vec<AgentInfo>) -> Self {
        self.execute_agents = agents;
        self
    }

    pub fn to_json(&self) -> ObshellResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> ObshellResult<Self> {
        let ctx: TaskContext = serde_json::from_str(text)?;
        if ctx.version > TASK_CONTEXT_VERSION {
            return Err(ObshellError::Serialization(format!(
                "任务上下文版本 {} 高于当前支持的版本 {}",
                ctx.version, TASK_CONTEXT_VERSION
            )));
        }
        Ok(ctx)
    }
}
