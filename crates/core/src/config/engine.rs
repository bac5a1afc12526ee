use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{MAINTAINER_MAX_ACTIVE_TIME_MS, MAINTAINER_UPDATE_INTERVAL_MS};

/// 任务引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 调度器扫描间隔, 不超过1秒
    pub scheduler_tick_ms: u64,
    pub maintainer_update_interval_ms: u64,
    pub maintainer_max_active_time_ms: u64,
    pub sync_interval_ms: u64,
    /// 子任务运行期间检查取消信号和刷新日志的间隔
    pub cancel_poll_interval_ms: u64,
    pub max_concurrent_sub_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_tick_ms: 1_000,
            maintainer_update_interval_ms: MAINTAINER_UPDATE_INTERVAL_MS,
            maintainer_max_active_time_ms: MAINTAINER_MAX_ACTIVE_TIME_MS,
            sync_interval_ms: 1_000,
            cancel_poll_interval_ms: 200,
            max_concurrent_sub_tasks: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler_tick_ms == 0 || self.scheduler_tick_ms > 1_000 {
            return Err(anyhow::anyhow!("调度间隔必须在1到1000毫秒之间"));
        }
        if self.maintainer_update_interval_ms == 0 {
            return Err(anyhow::anyhow!("维护者心跳间隔必须大于0"));
        }
        if self.maintainer_update_interval_ms >= self.maintainer_max_active_time_ms {
            return Err(anyhow::anyhow!("维护者心跳间隔必须小于心跳有效期"));
        }
        if self.sync_interval_ms == 0 {
            return Err(anyhow::anyhow!("同步间隔必须大于0"));
        }
        if self.cancel_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("取消检查间隔必须大于0"));
        }
        if self.max_concurrent_sub_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发子任务数必须大于0"));
        }
        Ok(())
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn maintainer_update_interval(&self) -> Duration {
        Duration::from_millis(self.maintainer_update_interval_ms)
    }

    pub fn maintainer_max_active_time(&self) -> Duration {
        Duration::from_millis(self.maintainer_max_active_time_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }
}
