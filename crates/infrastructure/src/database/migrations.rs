use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

/// 元数据库角色
///
/// 两种角色都持有 Dag / Node / SubTask 表; 本地库额外持有身份、成员表、
/// 任务映射和配置覆盖, 集群库额外持有集群成员与心跳。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Local,
    Cluster,
}

const TASK_TABLES: &[(&str, &str)] = &[
    (
        "dag_instance",
        r#"
        CREATE TABLE IF NOT EXISTS dag_instance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            dag_type TEXT NOT NULL,
            stage INTEGER NOT NULL DEFAULT 0,
            max_stage INTEGER NOT NULL,
            state TEXT NOT NULL,
            operator TEXT NOT NULL,
            executor_ip TEXT NOT NULL,
            executor_port INTEGER NOT NULL,
            maintenance_type INTEGER NOT NULL DEFAULT 0,
            is_finished INTEGER NOT NULL DEFAULT 0,
            context TEXT NOT NULL,
            start_time DATETIME NOT NULL,
            end_time DATETIME,
            gmt_modify DATETIME NOT NULL
        )
        "#,
    ),
    (
        "node_instance",
        r#"
        CREATE TABLE IF NOT EXISTS node_instance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dag_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            stage INTEGER NOT NULL,
            state TEXT NOT NULL,
            operator TEXT NOT NULL,
            capabilities TEXT NOT NULL,
            executors TEXT NOT NULL DEFAULT '[]',
            start_time DATETIME,
            end_time DATETIME,
            gmt_modify DATETIME NOT NULL,
            FOREIGN KEY (dag_id) REFERENCES dag_instance (id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "sub_task_instance",
        r#"
        CREATE TABLE IF NOT EXISTS sub_task_instance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id INTEGER NOT NULL DEFAULT 0,
            name TEXT NOT NULL,
            struct_name TEXT NOT NULL,
            executor_ip TEXT NOT NULL,
            executor_port INTEGER NOT NULL,
            execute_times INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            operator TEXT NOT NULL,
            context TEXT NOT NULL,
            start_time DATETIME,
            end_time DATETIME,
            gmt_modify DATETIME NOT NULL
        )
        "#,
    ),
    (
        "sub_task_log",
        r#"
        CREATE TABLE IF NOT EXISTS sub_task_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sub_task_id INTEGER NOT NULL,
            execute_times INTEGER NOT NULL,
            log_content TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    ),
];

const LOCAL_TABLES: &[(&str, &str)] = &[
    (
        "task_mapping",
        r#"
        CREATE TABLE IF NOT EXISTS task_mapping (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_task_id INTEGER NOT NULL UNIQUE,
            local_task_id INTEGER NOT NULL UNIQUE,
            execute_times INTEGER NOT NULL DEFAULT 0,
            is_sync INTEGER NOT NULL DEFAULT 1,
            sync_version INTEGER NOT NULL DEFAULT 0,
            gmt_modify DATETIME NOT NULL
        )
        "#,
    ),
    (
        "ob_config",
        r#"
        CREATE TABLE IF NOT EXISTS ob_config (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            gmt_modify DATETIME NOT NULL
        )
        "#,
    ),
    (
        "ocs_identity",
        r#"
        CREATE TABLE IF NOT EXISTS ocs_identity (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            zone TEXT NOT NULL,
            version TEXT NOT NULL,
            identity TEXT NOT NULL,
            master_ip TEXT,
            master_port INTEGER,
            password TEXT NOT NULL DEFAULT '',
            private_key TEXT NOT NULL,
            token TEXT NOT NULL,
            start_time DATETIME NOT NULL,
            pid INTEGER NOT NULL
        )
        "#,
    ),
    (
        "all_agent",
        r#"
        CREATE TABLE IF NOT EXISTS all_agent (
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            zone TEXT NOT NULL,
            version TEXT NOT NULL,
            identity TEXT NOT NULL,
            token TEXT NOT NULL,
            PRIMARY KEY (ip, port)
        )
        "#,
    ),
];

const CLUSTER_TABLES: &[(&str, &str)] = &[(
    "ocs_info",
    r#"
    CREATE TABLE IF NOT EXISTS ocs_info (
        ip TEXT NOT NULL,
        port INTEGER NOT NULL,
        zone TEXT NOT NULL,
        version TEXT NOT NULL,
        token TEXT NOT NULL,
        heartbeat_time INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (ip, port)
    )
    "#,
)];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_dag_instance_finished ON dag_instance(is_finished, maintenance_type)",
    "CREATE INDEX IF NOT EXISTS idx_node_instance_dag ON node_instance(dag_id, stage)",
    "CREATE INDEX IF NOT EXISTS idx_sub_task_instance_node ON sub_task_instance(node_id)",
    "CREATE INDEX IF NOT EXISTS idx_sub_task_instance_state ON sub_task_instance(state)",
    "CREATE INDEX IF NOT EXISTS idx_sub_task_log_sub_task ON sub_task_log(sub_task_id, execute_times)",
];

/// 运行数据库迁移
pub async fn run(pool: &SqlitePool, role: StoreRole) -> Result<()> {
    info!("运行SQLite数据库迁移: {:?}", role);

    let extra = match role {
        StoreRole::Local => LOCAL_TABLES,
        StoreRole::Cluster => CLUSTER_TABLES,
    };

    for (name, ddl) in TASK_TABLES.iter().chain(extra.iter()) {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("创建表 {name} 失败"))?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("创建索引失败: {ddl}"))?;
    }

    info!("数据库迁移完成");
    Ok(())
}
