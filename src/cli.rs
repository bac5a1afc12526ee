//! 命令行客户端: 通过本机代理的 TCP 端口 (升级时退回 Unix socket) 发起操作并跟踪 Dag

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use obshell_api::{
    client::{AgentClient, Credentials},
    dag_handler::{failure_report, DagHandler, DagQuery, HttpDagQuery},
    models::{AgentTarget, JoinMasterRequest},
    socket::UnixSocketClient,
};
use obshell_core::{exit_code, AppConfig};
use obshell_dispatcher::DagDetail;
use obshell_domain::{
    entities::{AgentInfo, AgentInstance, GenericId, State},
    repositories::ConfigRepository,
};
use obshell_infrastructure::{DatabaseManager, SqliteConfigRepository, StoreRole};
use serde_json::json;

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// 代理身份与成员
    Agent {
        #[command(subcommand)]
        action: AgentCommand,
    },
    /// 集群初始化与扩缩容
    Cluster {
        #[command(subcommand)]
        action: ClusterCommand,
    },
    /// 任务查询与人工操作
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// 本代理信息
    Info,
    /// 成员列表
    List,
    /// 加入主节点; 指定自身地址时成为主节点
    Join {
        #[arg(long)]
        master: AgentInfo,
    },
    /// 移除代理
    Remove {
        #[arg(long)]
        agent: AgentInfo,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// 把主节点和跟随者提升为集群代理
    Init,
    /// 扩容
    ScaleOut {
        #[arg(long)]
        agent: AgentInfo,
    },
    /// 缩容
    ScaleIn {
        #[arg(long)]
        agent: AgentInfo,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// 查看 Dag
    Show {
        id: GenericId,
        #[arg(long)]
        details: bool,
    },
    /// 跟踪 Dag 直到结束或等待人工处理
    Watch {
        id: GenericId,
        /// 升级期间容忍代理重启, 失败后改走本地socket
        #[arg(long)]
        upgrade: bool,
    },
    Cancel {
        id: GenericId,
    },
    Retry {
        id: GenericId,
    },
    Rollback {
        id: GenericId,
    },
    Pass {
        id: GenericId,
    },
    /// 未结束的 Dag
    Unfinished,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 设置代理级配置覆盖, 形如 `engine.scheduler_tick_ms 200`, 重启后生效
    Set { name: String, value: String },
    /// 列出配置覆盖
    List,
    /// 删除配置覆盖
    Delete { name: String },
}

/// 面向本机代理的命令行会话
pub struct Console {
    client: Arc<AgentClient>,
    target: AgentInfo,
    socket: UnixSocketClient,
}

impl Console {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = AgentClient::new(
            Credentials::Password(config.agent.password.clone()),
            Duration::from_secs(config.api.request_timeout_seconds),
        )
        .context("创建客户端失败")?;
        Ok(Self {
            client: Arc::new(client),
            target: AgentInfo::new(config.agent.ip.clone(), config.agent.port),
            socket: UnixSocketClient::new(&config.agent.socket_path),
        })
    }

    pub async fn run(&self, command: ClientCommand) -> Result<i32> {
        match command {
            ClientCommand::Agent { action } => self.agent(action).await,
            ClientCommand::Cluster { action } => self.cluster(action).await,
            ClientCommand::Task { action } => self.task(action).await,
        }
    }

    async fn agent(&self, command: AgentCommand) -> Result<i32> {
        match command {
            AgentCommand::Info => {
                let instance: AgentInstance = self.client.get(&self.target, "/api/v1/agent").await?;
                print_instance(&instance);
                Ok(exit_code::SUCCESS)
            }
            AgentCommand::List => {
                let members: Vec<AgentInstance> =
                    self.client.get(&self.target, "/api/v1/agents").await?;
                members.iter().for_each(print_instance);
                Ok(exit_code::SUCCESS)
            }
            AgentCommand::Join { master } => {
                let detail = self
                    .client
                    .post(&self.target, "/api/v1/agent/join", &JoinMasterRequest { master })
                    .await?;
                self.follow(detail).await
            }
            AgentCommand::Remove { agent } => {
                let detail = self
                    .client
                    .post(&self.target, "/api/v1/agent/remove", &AgentTarget { agent })
                    .await?;
                self.follow(detail).await
            }
        }
    }

    async fn cluster(&self, command: ClusterCommand) -> Result<i32> {
        let detail = match command {
            ClusterCommand::Init => {
                self.client
                    .post(&self.target, "/api/v1/ob/init", &json!({}))
                    .await?
            }
            ClusterCommand::ScaleOut { agent } => {
                self.client
                    .post(&self.target, "/api/v1/ob/scale_out", &AgentTarget { agent })
                    .await?
            }
            ClusterCommand::ScaleIn { agent } => {
                self.client
                    .post(&self.target, "/api/v1/ob/scale_in", &AgentTarget { agent })
                    .await?
            }
        };
        self.follow(detail).await
    }

    async fn task(&self, command: TaskCommand) -> Result<i32> {
        match command {
            TaskCommand::Show { id, details } => {
                let uri = format!("/api/v1/task/dag/{id}?show_details={details}");
                let detail: DagDetail = self.client.get(&self.target, &uri).await?;
                print_summary(&detail);
                if details {
                    let mut handler = self.handler(false);
                    handler.progress(&detail).iter().for_each(|l| println!("{l}"));
                }
                Ok(exit_code::SUCCESS)
            }
            TaskCommand::Watch { id, upgrade } => {
                let detail = self.handler(upgrade).wait(&id, |l| println!("{l}")).await?;
                Ok(outcome(&detail))
            }
            TaskCommand::Cancel { id } => {
                let detail = self.handler(false).cancel(&id).await?;
                print_summary(&detail);
                Ok(exit_code::SUCCESS)
            }
            TaskCommand::Retry { id } => {
                let detail = self.handler(false).retry(&id).await?;
                self.follow(detail).await
            }
            TaskCommand::Rollback { id } => {
                let detail = self.handler(false).rollback(&id).await?;
                self.follow(detail).await
            }
            TaskCommand::Pass { id } => {
                let detail = self.handler(false).pass(&id).await?;
                self.follow(detail).await
            }
            TaskCommand::Unfinished => {
                let dags: Vec<DagDetail> = self
                    .client
                    .get(&self.target, "/api/v1/task/dag/unfinish")
                    .await?;
                if dags.is_empty() {
                    println!("没有未结束的任务");
                }
                dags.iter().for_each(print_summary);
                Ok(exit_code::SUCCESS)
            }
        }
    }

    fn handler(&self, upgrade: bool) -> DagHandler {
        let primary: Arc<dyn DagQuery> =
            Arc::new(HttpDagQuery::new(self.client.clone(), self.target.clone()));
        let handler = DagHandler::new(primary);
        if upgrade {
            handler.upgrade_mode(Arc::new(self.socket.clone()))
        } else {
            handler
        }
    }

    async fn follow(&self, detail: DagDetail) -> Result<i32> {
        println!("已提交 {} ({})", detail.generic_id, detail.name);
        let detail = self
            .handler(false)
            .wait(&detail.generic_id, |l| println!("{l}"))
            .await?;
        Ok(outcome(&detail))
    }
}

/// 直接读写本地元数据库, 代理无需运行
pub async fn config(config: &AppConfig, command: ConfigCommand) -> Result<i32> {
    let db = DatabaseManager::new(&config.database.local_url, StoreRole::Local, &config.database)
        .await
        .context("打开本地元数据库失败")?;
    db.migrate().await.context("本地元数据库迁移失败")?;
    let repo = SqliteConfigRepository::new(db.pool().clone());

    match command {
        ConfigCommand::Set { name, value } => {
            repo.set(&name, &value).await?;
            println!("{name} = {value}");
        }
        ConfigCommand::List => {
            for (name, value) in repo.list().await? {
                println!("{name} = {value}");
            }
        }
        ConfigCommand::Delete { name } => {
            if !repo.delete(&name).await? {
                println!("{name} 未设置");
            }
        }
    }
    db.close().await;
    Ok(exit_code::SUCCESS)
}

fn outcome(detail: &DagDetail) -> i32 {
    if detail.state == State::Succeed {
        println!("{} 执行成功", detail.generic_id);
        exit_code::SUCCESS
    } else {
        exit_code::UNKNOWN
    }
}

fn print_instance(instance: &AgentInstance) {
    println!(
        "{}\t{}\t{}\t{}",
        instance.agent, instance.zone, instance.version, instance.identity
    );
}

/// 状态行, 有失败子任务时附带各代理的最后一行日志
fn print_summary(detail: &DagDetail) {
    failure_report(detail).iter().for_each(|l| println!("{l}"));
}
