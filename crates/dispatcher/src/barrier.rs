use obshell_domain::entities::{State, SubTask};

/// 节点屏障: 节点状态不单独保存, 而是由其下全部子任务的状态推出
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeProgress {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl NodeProgress {
    pub fn from_sub_tasks(sub_tasks: &[SubTask]) -> Self {
        let mut progress = Self {
            total: sub_tasks.len(),
            ..Self::default()
        };
        for sub_task in sub_tasks {
            match sub_task.state {
                State::Pending => progress.pending += 1,
                State::Ready => progress.ready += 1,
                State::Running | State::Cancelling => progress.running += 1,
                State::Succeed => progress.succeed += 1,
                State::Failed => progress.failed += 1,
                State::Canceled => progress.canceled += 1,
            }
        }
        progress
    }

    pub fn all_succeed(&self) -> bool {
        self.total > 0 && self.succeed == self.total
    }

    /// 有子任务被某个执行者持有
    pub fn in_flight(&self) -> bool {
        self.ready + self.running > 0
    }

    pub fn is_active(&self) -> bool {
        self.pending + self.ready + self.running > 0
    }

    /// 至少一个失败且其余子任务都已结束, 节点进入 FAILED
    pub fn is_failed(&self) -> bool {
        self.failed + self.canceled > 0 && !self.is_active()
    }

    pub fn node_state(&self) -> State {
        if self.all_succeed() {
            State::Succeed
        } else if self.is_failed() {
            State::Failed
        } else if self.in_flight() || self.succeed + self.failed + self.canceled > 0 {
            State::Running
        } else {
            State::Pending
        }
    }
}

/// 节点失败时失败的子任务
pub fn failed_sub_tasks(sub_tasks: &[SubTask]) -> Vec<&SubTask> {
    sub_tasks
        .iter()
        .filter(|s| matches!(s.state, State::Failed | State::Canceled))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use obshell_domain::entities::{AgentInfo, Operator, TaskContext};

    fn sub_task(id: i64, state: State) -> SubTask {
        SubTask {
            id,
            node_id: 1,
            name: "t".to_string(),
            struct_name: "noop".to_string(),
            executor: AgentInfo::new("127.0.0.1", 2886),
            execute_times: 1,
            state,
            operator: Operator::Run,
            context: TaskContext::new(),
            start_time: None,
            end_time: None,
            gmt_modify: Utc::now(),
        }
    }

    #[test]
    fn test_barrier_waits_for_every_sub_task() {
        let tasks = vec![
            sub_task(1, State::Succeed),
            sub_task(2, State::Running),
            sub_task(3, State::Succeed),
        ];
        let progress = NodeProgress::from_sub_tasks(&tasks);
        assert!(!progress.all_succeed());
        assert!(!progress.is_failed());
        assert_eq!(progress.node_state(), State::Running);

        let tasks = vec![
            sub_task(1, State::Succeed),
            sub_task(2, State::Succeed),
            sub_task(3, State::Succeed),
        ];
        assert_eq!(NodeProgress::from_sub_tasks(&tasks).node_state(), State::Succeed);
    }

    #[test]
    fn test_failure_waits_for_in_flight_peers() {
        let mut tasks = vec![
            sub_task(1, State::Succeed),
            sub_task(2, State::Failed),
            sub_task(3, State::Running),
        ];
        assert!(!NodeProgress::from_sub_tasks(&tasks).is_failed());

        tasks[2].state = State::Succeed;
        let progress = NodeProgress::from_sub_tasks(&tasks);
        assert!(progress.is_failed());
        assert_eq!(progress.node_state(), State::Failed);
        let failed = failed_sub_tasks(&tasks);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, 2);
    }

    #[test]
    fn test_failure_waits_for_pending_peers() {
        let tasks = vec![sub_task(1, State::Failed), sub_task(2, State::Pending)];
        let progress = NodeProgress::from_sub_tasks(&tasks);
        assert!(!progress.is_failed());
        assert!(progress.is_active());
        assert_eq!(progress.node_state(), State::Running);
    }

    #[test]
    fn test_empty_node_never_succeeds() {
        let progress = NodeProgress::from_sub_tasks(&[]);
        assert!(!progress.all_succeed());
        assert_eq!(progress.node_state(), State::Pending);
    }
}
