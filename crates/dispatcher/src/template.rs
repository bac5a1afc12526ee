use obshell_domain::entities::{AgentInfo, DagType, MaintenanceType};
use obshell_errors::{ObshellError, ObshellResult};

/// 节点的执行代理
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeExecutors {
    /// 在创建 Dag 的代理上执行一次
    Local,
    /// 每个代理各执行一次
    Agents(Vec<AgentInfo>),
    /// 创建时从上下文的 `execute_agents` 展开
    Context,
}

#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub struct_name: String,
    pub executors: NodeExecutors,
}

/// Dag 模板: 名称、类型、运维锁和按执行顺序排列的节点
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub dag_type: DagType,
    pub maintenance_type: MaintenanceType,
    pub nodes: Vec<TemplateNode>,
}

pub struct TemplateBuilder {
    template: Template,
}

impl TemplateBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            template: Template {
                name: name.into(),
                dag_type: DagType::Local,
                maintenance_type: MaintenanceType::None,
                nodes: Vec::new(),
            },
        }
    }

    pub fn set_type(mut self, dag_type: DagType) -> Self {
        self.template.dag_type = dag_type;
        self
    }

    pub fn set_maintenance(mut self, maintenance_type: MaintenanceType) -> Self {
        self.template.maintenance_type = maintenance_type;
        self
    }

    pub fn add_node<S: Into<String>>(mut self, struct_name: S) -> Self {
        self.template.nodes.push(TemplateNode {
            struct_name: struct_name.into(),
            executors: NodeExecutors::Local,
        });
        self
    }

    pub fn add_node_with_agents<S: Into<String>>(
        mut self,
        struct_name: S,
        agents: Vec<AgentInfo>,
    ) -> Self {
        self.template.nodes.push(TemplateNode {
            struct_name: struct_name.into(),
            executors: NodeExecutors::Agents(agents),
        });
        self
    }

    pub fn add_node_for_context_agents<S: Into<String>>(mut self, struct_name: S) -> Self {
        self.template.nodes.push(TemplateNode {
            struct_name: struct_name.into(),
            executors: NodeExecutors::Context,
        });
        self
    }

    pub fn build(self) -> ObshellResult<Template> {
        if self.template.name.is_empty() {
            return Err(ObshellError::illegal_argument("模板名称不能为空"));
        }
        if self.template.nodes.is_empty() {
            return Err(ObshellError::illegal_argument(format!(
                "模板 {} 没有节点",
                self.template.name
            )));
        }
        for node in &self.template.nodes {
            if let NodeExecutors::Agents(agents) = &node.executors {
                if agents.is_empty() {
                    return Err(ObshellError::illegal_argument(format!(
                        "节点 {} 的执行代理列表为空",
                        node.struct_name
                    )));
                }
            }
        }
        Ok(self.template)
    }
}
