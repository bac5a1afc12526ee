use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obshell_domain::{
    entities::{
        AgentInfo, Dag, MaintenanceType, Node, Operator, State, SubTask, SubTaskLog,
        TaskCapabilities, TaskContext, TaskMapping,
    },
    repositories::{DagPlan, DagTransition, MirrorPlan, SubTaskSnapshot, TaskStore},
};
use obshell_errors::{ObshellError, ObshellResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

const DAG_COLUMNS: &str = "id, name, dag_type, stage, max_stage, state, operator, executor_ip, \
    executor_port, maintenance_type, is_finished, context, start_time, end_time, gmt_modify";
const NODE_COLUMNS: &str = "id, dag_id, name, stage, state, operator, capabilities, executors, \
    start_time, end_time, gmt_modify";
const SUB_TASK_COLUMNS: &str = "id, node_id, name, struct_name, executor_ip, executor_port, \
    execute_times, state, operator, context, start_time, end_time, gmt_modify";
const MAPPING_COLUMNS: &str =
    "id, remote_task_id, local_task_id, execute_times, is_sync, sync_version, gmt_modify";

/// 基于 SQLite 的 Dag / Node / SubTask 元数据库
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_dag(row: &SqliteRow) -> ObshellResult<Dag> {
        let context: String = row.try_get("context")?;
        Ok(Dag {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            dag_type: row.try_get("dag_type")?,
            stage: row.try_get("stage")?,
            max_stage: row.try_get("max_stage")?,
            state: row.try_get("state")?,
            operator: row.try_get("operator")?,
            executor: AgentInfo::new(
                row.try_get::<String, _>("executor_ip")?,
                row.try_get::<u16, _>("executor_port")?,
            ),
            maintenance_type: MaintenanceType::from_i64(row.try_get("maintenance_type")?)?,
            is_finished: row.try_get("is_finished")?,
            context: TaskContext::from_json(&context)?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            gmt_modify: row.try_get("gmt_modify")?,
        })
    }

    fn row_to_node(row: &SqliteRow) -> ObshellResult<Node> {
        let capabilities: String = row.try_get("capabilities")?;
        let executors: String = row.try_get("executors")?;
        Ok(Node {
            id: row.try_get("id")?,
            dag_id: row.try_get("dag_id")?,
            name: row.try_get("name")?,
            stage: row.try_get("stage")?,
            state: row.try_get("state")?,
            operator: row.try_get("operator")?,
            capabilities: serde_json::from_str::<TaskCapabilities>(&capabilities)?,
            executors: serde_json::from_str::<Vec<AgentInfo>>(&executors)?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            gmt_modify: row.try_get("gmt_modify")?,
        })
    }

    fn row_to_sub_task(row: &SqliteRow) -> ObshellResult<SubTask> {
        let context: String = row.try_get("context")?;
        Ok(SubTask {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            name: row.try_get("name")?,
            struct_name: row.try_get("struct_name")?,
            executor: AgentInfo::new(
                row.try_get::<String, _>("executor_ip")?,
                row.try_get::<u16, _>("executor_port")?,
            ),
            execute_times: row.try_get("execute_times")?,
            state: row.try_get("state")?,
            operator: row.try_get("operator")?,
            context: TaskContext::from_json(&context)?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            gmt_modify: row.try_get("gmt_modify")?,
        })
    }

    fn row_to_mapping(row: &SqliteRow) -> ObshellResult<TaskMapping> {
        Ok(TaskMapping {
            id: row.try_get("id")?,
            remote_task_id: row.try_get("remote_task_id")?,
            local_task_id: row.try_get("local_task_id")?,
            execute_times: row.try_get("execute_times")?,
            is_sync: row.try_get("is_sync")?,
            sync_version: row.try_get("sync_version")?,
            gmt_modify: row.try_get("gmt_modify")?,
        })
    }

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }

    fn end_time_for(state: State, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if state.is_terminal() {
            Some(now)
        } else {
            None
        }
    }

    /// 镜像子任务状态变化后, 在同一事务内把映射置为未同步; 普通子任务没有映射, 不受影响
    async fn mark_unsynced(
        tx: &mut Transaction<'_, Sqlite>,
        local_task_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE task_mapping
            SET is_sync = 0,
                sync_version = sync_version + 1,
                execute_times = (SELECT execute_times FROM sub_task_instance WHERE id = ?),
                gmt_modify = ?
            WHERE local_task_id = ?
            "#,
        )
        .bind(local_task_id)
        .bind(now)
        .bind(local_task_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_logs(
        tx: &mut Transaction<'_, Sqlite>,
        sub_task_id: i64,
        execute_times: i32,
        lines: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        for line in lines {
            sqlx::query(
                "INSERT INTO sub_task_log (sub_task_id, execute_times, log_content, created_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(sub_task_id)
            .bind(execute_times)
            .bind(line)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, plan), fields(name = %plan.name, dag_type = %plan.dag_type))]
    async fn create_dag(&self, plan: &DagPlan) -> ObshellResult<Dag> {
        if plan.nodes.is_empty() {
            return Err(ObshellError::illegal_argument("Dag至少需要一个节点"));
        }
        if plan.nodes.iter().any(|node| node.sub_tasks.is_empty()) {
            return Err(ObshellError::illegal_argument("节点至少需要一个子任务"));
        }

        let now = Utc::now();
        let context = plan.context.to_json()?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO dag_instance (name, dag_type, stage, max_stage, state, operator,
                                      executor_ip, executor_port, maintenance_type, is_finished,
                                      context, start_time, end_time, gmt_modify)
            SELECT ?, ?, 0, ?, ?, ?, ?, ?, ?, 0, ?, ?, NULL, ?
            WHERE ? = 0 OR NOT EXISTS (
                SELECT 1 FROM dag_instance WHERE is_finished = 0 AND maintenance_type != 0
            )
            "#,
        )
        .bind(&plan.name)
        .bind(plan.dag_type)
        .bind(plan.nodes.len() as i32)
        .bind(State::Pending)
        .bind(Operator::Run)
        .bind(&plan.executor.ip)
        .bind(plan.executor.port)
        .bind(plan.maintenance_type.as_i64())
        .bind(&context)
        .bind(now)
        .bind(now)
        .bind(plan.maintenance_type.as_i64())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::maintenance_conflict(format!(
                "无法创建 {}: 已有未结束的运维任务",
                plan.name
            )));
        }
        let dag_id = result.last_insert_rowid();

        for (index, node) in plan.nodes.iter().enumerate() {
            let node_id = sqlx::query(
                r#"
                INSERT INTO node_instance (dag_id, name, stage, state, operator, capabilities,
                                           executors, start_time, end_time, gmt_modify)
                VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?)
                "#,
            )
            .bind(dag_id)
            .bind(&node.name)
            .bind(index as i32 + 1)
            .bind(State::Pending)
            .bind(Operator::Run)
            .bind(serde_json::to_string(&node.capabilities)?)
            .bind(serde_json::to_string(&node.executors)?)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for sub_task in &node.sub_tasks {
                sqlx::query(
                    r#"
                    INSERT INTO sub_task_instance (node_id, name, struct_name, executor_ip,
                                                   executor_port, execute_times, state, operator,
                                                   context, start_time, end_time, gmt_modify)
                    VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, NULL, NULL, ?)
                    "#,
                )
                .bind(node_id)
                .bind(&sub_task.name)
                .bind(&sub_task.struct_name)
                .bind(&sub_task.executor.ip)
                .bind(sub_task.executor.port)
                .bind(State::Pending)
                .bind(Operator::Run)
                .bind(&context)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("创建Dag成功: {} (id: {})", plan.name, dag_id);

        self.get_dag(dag_id)
            .await?
            .ok_or_else(|| ObshellError::dag_not_found(dag_id))
    }

    async fn get_dag(&self, id: i64) -> ObshellResult<Option<Dag>> {
        let row = sqlx::query(&format!("SELECT {DAG_COLUMNS} FROM dag_instance WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_dag).transpose()
    }

    async fn list_unfinished_dags(&self) -> ObshellResult<Vec<Dag>> {
        let rows = sqlx::query(&format!(
            "SELECT {DAG_COLUMNS} FROM dag_instance WHERE is_finished = 0 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_dag).collect()
    }

    async fn find_maintenance_dag(
        &self,
        maintenance_type: Option<MaintenanceType>,
    ) -> ObshellResult<Option<Dag>> {
        let row = match maintenance_type {
            Some(t) => {
                sqlx::query(&format!(
                    "SELECT {DAG_COLUMNS} FROM dag_instance \
                     WHERE is_finished = 0 AND maintenance_type = ? ORDER BY id LIMIT 1"
                ))
                .bind(t.as_i64())
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {DAG_COLUMNS} FROM dag_instance \
                     WHERE is_finished = 0 AND maintenance_type != 0 ORDER BY id LIMIT 1"
                ))
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(Self::row_to_dag).transpose()
    }

    #[instrument(skip(self, transition), fields(
        dag_id = transition.dag_id,
        from = %transition.expected_state,
        to = %transition.state,
        stage = transition.stage,
    ))]
    async fn transition_dag(&self, transition: &DagTransition) -> ObshellResult<()> {
        let now = Utc::now();
        let context = transition
            .context
            .as_ref()
            .map(TaskContext::to_json)
            .transpose()?;
        let mut tx = self.pool.begin().await?;

        if transition.recheck_maintenance.is_some() {
            let other: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM dag_instance \
                 WHERE is_finished = 0 AND maintenance_type != 0 AND id != ? LIMIT 1",
            )
            .bind(transition.dag_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(other) = other {
                return Err(ObshellError::maintenance_conflict(format!(
                    "Dag {other} 正在运行"
                )));
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE dag_instance
            SET state = ?, stage = ?, operator = ?, is_finished = ?, end_time = ?,
                context = COALESCE(?, context), gmt_modify = ?
            WHERE id = ? AND state = ? AND stage = ? AND operator = ?
            "#,
        )
        .bind(transition.state)
        .bind(transition.stage)
        .bind(transition.operator)
        .bind(transition.is_finished)
        .bind(if transition.is_finished { Some(now) } else { None })
        .bind(&context)
        .bind(now)
        .bind(transition.dag_id)
        .bind(transition.expected_state)
        .bind(transition.expected_stage)
        .bind(transition.expected_operator)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::no_affected_rows(format!(
                "Dag {} 状态已变化",
                transition.dag_id
            )));
        }

        for (node_id, state) in &transition.node_states {
            sqlx::query(
                r#"
                UPDATE node_instance
                SET state = ?, operator = ?,
                    start_time = CASE WHEN ? = 'RUNNING' THEN COALESCE(start_time, ?) ELSE start_time END,
                    end_time = ?, gmt_modify = ?
                WHERE id = ?
                "#,
            )
            .bind(*state)
            .bind(transition.operator)
            .bind(*state)
            .bind(now)
            .bind(Self::end_time_for(*state, now))
            .bind(now)
            .bind(*node_id)
            .execute(&mut *tx)
            .await?;
        }

        for reset in &transition.sub_task_resets {
            if reset.from_states.is_empty() {
                continue;
            }
            let executed_filter = match reset.executed {
                Some(true) => " AND execute_times > 0",
                Some(false) => " AND execute_times = 0",
                None => "",
            };
            let sql = format!(
                "UPDATE sub_task_instance SET state = ?, operator = ?, end_time = ?, gmt_modify = ? \
                 WHERE node_id = ? AND state IN ({}){executed_filter}",
                Self::placeholders(reset.from_states.len())
            );
            let mut query = sqlx::query(&sql)
                .bind(reset.to_state)
                .bind(reset.operator)
                .bind(Self::end_time_for(reset.to_state, now))
                .bind(now)
                .bind(reset.node_id);
            for state in &reset.from_states {
                query = query.bind(*state);
            }
            query.execute(&mut *tx).await?;
        }

        if let (Some(node_id), Some(context)) = (transition.propagate_context_to, &context) {
            sqlx::query(
                "UPDATE sub_task_instance SET context = ?, gmt_modify = ? \
                 WHERE node_id = ? AND state = 'PENDING'",
            )
            .bind(context)
            .bind(now)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Dag {} 状态迁移: {} -> {} (stage {})",
            transition.dag_id, transition.expected_state, transition.state, transition.stage
        );
        Ok(())
    }

    async fn get_node(&self, id: i64) -> ObshellResult<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM node_instance WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn list_nodes(&self, dag_id: i64) -> ObshellResult<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_instance WHERE dag_id = ? ORDER BY stage"
        ))
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn get_node_by_stage(&self, dag_id: i64, stage: i32) -> ObshellResult<Option<Node>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_instance WHERE dag_id = ? AND stage = ?"
        ))
        .bind(dag_id)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn get_sub_task(&self, id: i64) -> ObshellResult<Option<SubTask>> {
        let row = sqlx::query(&format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_sub_task).transpose()
    }

    async fn list_sub_tasks(&self, node_id: i64) -> ObshellResult<Vec<SubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance WHERE node_id = ? ORDER BY id"
        ))
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_sub_task).collect()
    }

    async fn list_active_sub_tasks(&self, executor: &AgentInfo) -> ObshellResult<Vec<SubTask>> {
        let sql = format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance \
             WHERE executor_ip = ? AND executor_port = ? AND state IN ('READY', 'RUNNING') \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(&executor.ip)
            .bind(executor.port)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_sub_task).collect()
    }

    async fn list_pending_mirrors(&self) -> ObshellResult<Vec<SubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_task_instance \
             WHERE node_id = 0 AND state = ? ORDER BY id"
        ))
        .bind(State::Pending)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_sub_task).collect()
    }

    #[instrument(skip(self, executor, context))]
    async fn ready_sub_task(
        &self,
        id: i64,
        expected_execute_times: i32,
        operator: Operator,
        executor: &AgentInfo,
        context: &TaskContext,
    ) -> ObshellResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instance
            SET state = 'READY', operator = ?, execute_times = execute_times + 1,
                executor_ip = ?, executor_port = ?, context = ?, gmt_modify = ?
            WHERE id = ? AND state != 'READY' AND execute_times = ?
            "#,
        )
        .bind(operator)
        .bind(&executor.ip)
        .bind(executor.port)
        .bind(context.to_json()?)
        .bind(now)
        .bind(id)
        .bind(expected_execute_times)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::no_affected_rows(format!(
                "子任务 {id} 无法进入READY (execute_times={expected_execute_times})"
            )));
        }
        Self::mark_unsynced(&mut tx, id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_sub_task(&self, id: i64, execute_times: i32) -> ObshellResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instance
            SET state = 'RUNNING', start_time = ?, end_time = NULL, gmt_modify = ?
            WHERE id = ? AND state = 'READY' AND execute_times = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(execute_times)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::no_affected_rows(format!(
                "子任务 {id} 无法进入RUNNING (execute_times={execute_times})"
            )));
        }
        Self::mark_unsynced(&mut tx, id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, context, logs))]
    async fn finish_sub_task(
        &self,
        id: i64,
        execute_times: i32,
        state: State,
        context: &TaskContext,
        logs: &[String],
    ) -> ObshellResult<()> {
        if !state.is_terminal() {
            return Err(ObshellError::illegal_argument(format!(
                "子任务结束状态必须是终态: {state}"
            )));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        Self::insert_logs(&mut tx, id, execute_times, logs, now).await?;

        let result = sqlx::query(
            r#"
            UPDATE sub_task_instance
            SET state = ?, context = ?, end_time = ?, gmt_modify = ?
            WHERE id = ? AND state = 'RUNNING' AND execute_times = ?
            "#,
        )
        .bind(state)
        .bind(context.to_json()?)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(execute_times)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::no_affected_rows(format!(
                "子任务 {id} 无法结束 (execute_times={execute_times})"
            )));
        }
        Self::mark_unsynced(&mut tx, id, now).await?;
        tx.commit().await?;
        debug!("子任务 {} 第 {} 次执行结束: {}", id, execute_times, state);
        Ok(())
    }

    async fn transit_sub_task(
        &self,
        id: i64,
        from: &[State],
        to: State,
        operator: Operator,
    ) -> ObshellResult<()> {
        if from.is_empty() {
            return Err(ObshellError::illegal_argument("缺少子任务的起始状态"));
        }

        let now = Utc::now();
        let sql = format!(
            "UPDATE sub_task_instance SET state = ?, operator = ?, end_time = ?, gmt_modify = ? \
             WHERE id = ? AND state IN ({})",
            Self::placeholders(from.len())
        );
        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&sql)
            .bind(to)
            .bind(operator)
            .bind(Self::end_time_for(to, now))
            .bind(now)
            .bind(id);
        for state in from {
            query = query.bind(*state);
        }
        let result = query.execute(&mut *tx).await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::no_affected_rows(format!(
                "子任务 {id} 无法迁移到 {to}"
            )));
        }
        Self::mark_unsynced(&mut tx, id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_sub_task(&self, id: i64) -> ObshellResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instance
            SET operator = 'CANCEL', gmt_modify = ?
            WHERE id = ? AND state IN ('PENDING', 'READY', 'RUNNING') AND operator != 'CANCEL'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_snapshot(&self, id: i64, snapshot: &SubTaskSnapshot) -> ObshellResult<bool> {
        // 同一次执行的快照不能覆盖已被重置为 PENDING 的集群子任务,
        // 人工跳过的子任务也不能被跳过之前的执行结果覆盖
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instance
            SET state = ?, execute_times = ?, context = ?, start_time = ?, end_time = ?,
                gmt_modify = ?
            WHERE id = ?
              AND (execute_times < ? OR (execute_times = ? AND state != 'PENDING'))
              AND (operator != 'PASS' OR ? = 'PASS')
            "#,
        )
        .bind(snapshot.state)
        .bind(snapshot.execute_times)
        .bind(snapshot.context.to_json()?)
        .bind(snapshot.start_time)
        .bind(snapshot.end_time)
        .bind(Utc::now())
        .bind(id)
        .bind(snapshot.execute_times)
        .bind(snapshot.execute_times)
        .bind(snapshot.operator)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: i32,
        lines: &[String],
    ) -> ObshellResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        Self::insert_logs(&mut tx, sub_task_id, execute_times, lines, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: i32,
        lines: &[String],
    ) -> ObshellResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sub_task_log WHERE sub_task_id = ? AND execute_times = ?")
            .bind(sub_task_id)
            .bind(execute_times)
            .execute(&mut *tx)
            .await?;
        Self::insert_logs(&mut tx, sub_task_id, execute_times, lines, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_sub_task_logs(
        &self,
        sub_task_id: i64,
        execute_times: Option<i32>,
    ) -> ObshellResult<Vec<SubTaskLog>> {
        let rows = match execute_times {
            Some(times) => {
                sqlx::query(
                    "SELECT id, sub_task_id, execute_times, log_content, created_at \
                     FROM sub_task_log WHERE sub_task_id = ? AND execute_times = ? ORDER BY id",
                )
                .bind(sub_task_id)
                .bind(times)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, sub_task_id, execute_times, log_content, created_at \
                     FROM sub_task_log WHERE sub_task_id = ? ORDER BY id",
                )
                .bind(sub_task_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| -> ObshellResult<SubTaskLog> {
                Ok(SubTaskLog {
                    id: row.try_get("id")?,
                    sub_task_id: row.try_get("sub_task_id")?,
                    execute_times: row.try_get("execute_times")?,
                    log_content: row.try_get("log_content")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, plan), fields(struct_name = %plan.struct_name))]
    async fn create_mirror(
        &self,
        remote_task_id: i64,
        plan: &MirrorPlan,
    ) -> ObshellResult<SubTask> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT local_task_id FROM task_mapping WHERE remote_task_id = ?",
        )
        .bind(remote_task_id)
        .fetch_optional(&mut *tx)
        .await?;

        let local_task_id = match existing {
            Some(id) => id,
            None => {
                let local_task_id = sqlx::query(
                    r#"
                    INSERT INTO sub_task_instance (node_id, name, struct_name, executor_ip,
                                                   executor_port, execute_times, state, operator,
                                                   context, start_time, end_time, gmt_modify)
                    VALUES (0, ?, ?, ?, ?, ?, 'PENDING', ?, ?, NULL, NULL, ?)
                    "#,
                )
                .bind(&plan.name)
                .bind(&plan.struct_name)
                .bind(&plan.executor.ip)
                .bind(plan.executor.port)
                .bind(plan.execute_times)
                .bind(plan.operator)
                .bind(plan.context.to_json()?)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

                sqlx::query(
                    r#"
                    INSERT INTO task_mapping (remote_task_id, local_task_id, execute_times,
                                              is_sync, sync_version, gmt_modify)
                    VALUES (?, ?, ?, 1, 0, ?)
                    "#,
                )
                .bind(remote_task_id)
                .bind(local_task_id)
                .bind(plan.execute_times)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                debug!("创建镜像子任务 {} -> {}", remote_task_id, local_task_id);
                local_task_id
            }
        };

        tx.commit().await?;
        self.get_sub_task(local_task_id)
            .await?
            .ok_or_else(|| ObshellError::sub_task_not_found(local_task_id))
    }

    async fn get_mapping_by_remote(
        &self,
        remote_task_id: i64,
    ) -> ObshellResult<Option<TaskMapping>> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM task_mapping WHERE remote_task_id = ?"
        ))
        .bind(remote_task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn list_unsynced_mappings(&self) -> ObshellResult<Vec<TaskMapping>> {
        let rows = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM task_mapping WHERE is_sync = 0 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_mapping).collect()
    }

    async fn ack_mapping(&self, mapping_id: i64, sync_version: i64) -> ObshellResult<bool> {
        let result = sqlx::query(
            "UPDATE task_mapping SET is_sync = 1, gmt_modify = ? \
             WHERE id = ? AND sync_version = ? AND is_sync = 0",
        )
        .bind(Utc::now())
        .bind(mapping_id)
        .bind(sync_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_mirror(
        &self,
        local_task_id: i64,
        operator: Operator,
        context: &TaskContext,
    ) -> ObshellResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instance
            SET state = 'PENDING', operator = ?, context = ?, end_time = NULL, gmt_modify = ?
            WHERE id = ? AND node_id = 0 AND state IN ('SUCCEED', 'FAILED', 'CANCELED')
            "#,
        )
        .bind(operator)
        .bind(context.to_json()?)
        .bind(now)
        .bind(local_task_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ObshellError::no_affected_rows(format!(
                "镜像子任务 {local_task_id} 无法重置"
            )));
        }
        Self::mark_unsynced(&mut tx, local_task_id, now).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseManager, StoreRole};
    use obshell_domain::entities::DagType;
    use obshell_domain::repositories::{NodePlan, SubTaskPlan, SubTaskReset};

    async fn setup_store() -> SqliteTaskStore {
        let db = DatabaseManager::in_memory(StoreRole::Local).await.unwrap();
        db.migrate().await.unwrap();
        SqliteTaskStore::new(db.pool().clone())
    }

    fn agent() -> AgentInfo {
        AgentInfo::new("127.0.0.1", 2886)
    }

    fn plan(name: &str, maintenance_type: MaintenanceType, nodes: usize) -> DagPlan {
        DagPlan {
            name: name.to_string(),
            dag_type: DagType::Local,
            maintenance_type,
            executor: agent(),
            context: TaskContext::new().with_param("key", "value"),
            nodes: (0..nodes)
                .map(|i| NodePlan {
                    name: format!("node-{i}"),
                    capabilities: TaskCapabilities::all(),
                    executors: vec![agent()],
                    sub_tasks: vec![SubTaskPlan {
                        name: format!("task-{i}"),
                        struct_name: "noop".to_string(),
                        executor: agent(),
                    }],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_dag_persists_nodes_and_sub_tasks() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("demo", MaintenanceType::None, 2))
            .await
            .unwrap();

        assert_eq!(dag.stage, 0);
        assert_eq!(dag.max_stage, 2);
        assert_eq!(dag.state, State::Pending);
        assert_eq!(dag.operator, Operator::Run);
        assert!(!dag.is_finished);
        assert_eq!(dag.context.get_param::<String>("key").unwrap(), "value");

        let nodes = store.list_nodes(dag.id).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].stage, 1);
        assert_eq!(nodes[1].stage, 2);
        assert!(nodes[0].capabilities.can_rollback);

        let sub_tasks = store.list_sub_tasks(nodes[0].id).await.unwrap();
        assert_eq!(sub_tasks.len(), 1);
        assert_eq!(sub_tasks[0].execute_times, 0);
        assert_eq!(sub_tasks[0].state, State::Pending);
    }

    #[tokio::test]
    async fn test_create_dag_rejects_empty_plan() {
        let store = setup_store().await;
        let err = store
            .create_dag(&plan("empty", MaintenanceType::None, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ObshellError::IllegalArgument(_)));
    }

    #[tokio::test]
    async fn test_maintenance_lock_is_exclusive_per_store() {
        let store = setup_store().await;
        store
            .create_dag(&plan("join", MaintenanceType::Agent, 1))
            .await
            .unwrap();

        let err = store
            .create_dag(&plan("init", MaintenanceType::Global, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ObshellError::MaintenanceConflict(_)));

        // 非运维 Dag 不受运维锁影响
        store
            .create_dag(&plan("plain", MaintenanceType::None, 1))
            .await
            .unwrap();

        let found = store.find_maintenance_dag(None).await.unwrap().unwrap();
        assert_eq!(found.name, "join");
        assert!(store
            .find_maintenance_dag(Some(MaintenanceType::Global))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_finished_maintenance_dag_releases_lock() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("join", MaintenanceType::Agent, 1))
            .await
            .unwrap();

        let transition = DagTransition::from_dag(&dag)
            .state(State::Succeed)
            .finished(true);
        store.transition_dag(&transition).await.unwrap();

        store
            .create_dag(&plan("remove", MaintenanceType::Agent, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transition_dag_is_conditional() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("demo", MaintenanceType::None, 2))
            .await
            .unwrap();
        let node = store.get_node_by_stage(dag.id, 1).await.unwrap().unwrap();

        let transition = DagTransition::from_dag(&dag)
            .state(State::Running)
            .stage(1)
            .node_state(node.id, State::Running);
        store.transition_dag(&transition).await.unwrap();

        // 相同的前置条件第二次执行时不再命中
        let err = store.transition_dag(&transition).await.unwrap_err();
        assert!(matches!(err, ObshellError::NoAffectedRows(_)));

        let dag = store.get_dag(dag.id).await.unwrap().unwrap();
        assert_eq!(dag.state, State::Running);
        assert_eq!(dag.stage, 1);
        let node = store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(node.state, State::Running);
        assert!(node.start_time.is_some());
    }

    #[tokio::test]
    async fn test_transition_propagates_context_and_resets_sub_tasks() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("demo", MaintenanceType::None, 2))
            .await
            .unwrap();
        let first = store.get_node_by_stage(dag.id, 1).await.unwrap().unwrap();
        let second = store.get_node_by_stage(dag.id, 2).await.unwrap().unwrap();

        let mut context = dag.context.clone();
        context.set_data("from_first", 42);
        let transition = DagTransition::from_dag(&dag)
            .state(State::Running)
            .stage(2)
            .context(context)
            .propagate_context_to(second.id)
            .reset_sub_tasks(
                SubTaskReset::new(first.id, &[State::Pending], State::Succeed, Operator::Pass)
                    .executed(false),
            );
        store.transition_dag(&transition).await.unwrap();

        let target = &store.list_sub_tasks(second.id).await.unwrap()[0];
        assert_eq!(target.context.get_data::<i32>("from_first"), Some(42));
        let passed = &store.list_sub_tasks(first.id).await.unwrap()[0];
        assert_eq!(passed.state, State::Succeed);
        assert_eq!(passed.operator, Operator::Pass);
        assert!(passed.end_time.is_some());
    }

    #[tokio::test]
    async fn test_sub_task_lifecycle_guards_execute_times() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("demo", MaintenanceType::None, 1))
            .await
            .unwrap();
        let node = store.get_node_by_stage(dag.id, 1).await.unwrap().unwrap();
        let task = store.list_sub_tasks(node.id).await.unwrap().remove(0);

        store
            .ready_sub_task(task.id, 0, Operator::Run, &agent(), &task.context)
            .await
            .unwrap();
        // 执行次数已经变化, 第二个竞争者失败
        let err = store
            .ready_sub_task(task.id, 0, Operator::Run, &agent(), &task.context)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        assert!(store.start_sub_task(task.id, 0).await.is_err());
        store.start_sub_task(task.id, 1).await.unwrap();
        assert_eq!(store.list_active_sub_tasks(&agent()).await.unwrap().len(), 1);

        store
            .finish_sub_task(
                task.id,
                1,
                State::Succeed,
                &task.context,
                &["done".to_string()],
            )
            .await
            .unwrap();

        let task = store.get_sub_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, State::Succeed);
        assert_eq!(task.execute_times, 1);
        let logs = store.list_sub_task_logs(task.id, Some(1)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_content, "done");
        assert!(store.list_active_sub_tasks(&agent()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_sub_task_only_marks_active_once() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("demo", MaintenanceType::None, 1))
            .await
            .unwrap();
        let node = store.get_node_by_stage(dag.id, 1).await.unwrap().unwrap();
        let task = store.list_sub_tasks(node.id).await.unwrap().remove(0);

        assert!(store.cancel_sub_task(task.id).await.unwrap());
        assert!(!store.cancel_sub_task(task.id).await.unwrap());

        store
            .transit_sub_task(task.id, &[State::Pending], State::Canceled, Operator::Cancel)
            .await
            .unwrap();
        assert!(!store.cancel_sub_task(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mirror_mapping_tracks_changes() {
        let store = setup_store().await;
        let mirror_plan = MirrorPlan {
            name: "remote".to_string(),
            struct_name: "noop".to_string(),
            executor: agent(),
            operator: Operator::Run,
            execute_times: 0,
            context: TaskContext::new(),
        };

        let mirror = store.create_mirror(77, &mirror_plan).await.unwrap();
        assert!(mirror.is_mirror());
        // 重复派发返回同一个镜像
        let again = store.create_mirror(77, &mirror_plan).await.unwrap();
        assert_eq!(mirror.id, again.id);
        assert_eq!(store.list_pending_mirrors().await.unwrap().len(), 1);
        assert!(store.list_unsynced_mappings().await.unwrap().is_empty());

        store
            .ready_sub_task(mirror.id, 0, Operator::Run, &agent(), &mirror.context)
            .await
            .unwrap();
        let unsynced = store.list_unsynced_mappings().await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].execute_times, 1);
        let version = unsynced[0].sync_version;

        store.start_sub_task(mirror.id, 1).await.unwrap();
        // 过期版本的确认不生效
        assert!(!store.ack_mapping(unsynced[0].id, version).await.unwrap());
        let mapping = store.get_mapping_by_remote(77).await.unwrap().unwrap();
        assert!(store
            .ack_mapping(mapping.id, mapping.sync_version)
            .await
            .unwrap());
        assert!(store.list_unsynced_mappings().await.unwrap().is_empty());

        store
            .finish_sub_task(mirror.id, 1, State::Failed, &mirror.context, &[])
            .await
            .unwrap();
        store
            .reset_mirror(mirror.id, Operator::Retry, &mirror.context)
            .await
            .unwrap();
        let mirror = store.get_sub_task(mirror.id).await.unwrap().unwrap();
        assert_eq!(mirror.state, State::Pending);
        assert_eq!(mirror.operator, Operator::Retry);
    }

    #[tokio::test]
    async fn test_apply_snapshot_never_moves_backwards() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("demo", MaintenanceType::None, 1))
            .await
            .unwrap();
        let node = store.get_node_by_stage(dag.id, 1).await.unwrap().unwrap();
        let task = store.list_sub_tasks(node.id).await.unwrap().remove(0);

        let snapshot = SubTaskSnapshot {
            state: State::Running,
            operator: Operator::Run,
            execute_times: 1,
            context: TaskContext::new(),
            start_time: Some(Utc::now()),
            end_time: None,
        };
        assert!(store.apply_snapshot(task.id, &snapshot).await.unwrap());

        let stale = SubTaskSnapshot {
            execute_times: 0,
            state: State::Failed,
            ..snapshot.clone()
        };
        assert!(!store.apply_snapshot(task.id, &stale).await.unwrap());

        let task = store.get_sub_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, State::Running);
        assert_eq!(task.execute_times, 1);
    }

    #[tokio::test]
    async fn test_passed_sub_task_rejects_earlier_result() {
        let store = setup_store().await;
        let dag = store
            .create_dag(&plan("demo", MaintenanceType::None, 1))
            .await
            .unwrap();
        let node = store.get_node_by_stage(dag.id, 1).await.unwrap().unwrap();
        let task = store.list_sub_tasks(node.id).await.unwrap().remove(0);

        let failed = SubTaskSnapshot {
            state: State::Failed,
            operator: Operator::Run,
            execute_times: 1,
            context: TaskContext::new(),
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
        };
        assert!(store.apply_snapshot(task.id, &failed).await.unwrap());

        let transition = DagTransition::from_dag(&dag)
            .state(State::Ready)
            .operator(Operator::Pass)
            .reset_sub_tasks(SubTaskReset::new(
                node.id,
                &[State::Failed],
                State::Succeed,
                Operator::Pass,
            ));
        store.transition_dag(&transition).await.unwrap();

        // 确认丢失后同一份快照再次到达
        assert!(!store.apply_snapshot(task.id, &failed).await.unwrap());
        let task = store.get_sub_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, State::Succeed);
        assert_eq!(task.operator, Operator::Pass);

        // 镜像本身被跳过时照常写回
        let passed = SubTaskSnapshot {
            state: State::Succeed,
            operator: Operator::Pass,
            ..failed
        };
        assert!(store.apply_snapshot(task.id, &passed).await.unwrap());
    }
}
