//! Task contract: the interface every pipeline task implements, the type
//! tags, and the registry that builds executable tasks from parsed nodes.

pub mod bridge;
pub mod http;
pub mod json_parse;
pub mod median;
pub mod multiply;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::dag::{ParseError, TaskNode};
use crate::result::{TaskError, TaskResult};
use crate::store::PipelineStore;
use crate::value::Value;

pub use bridge::BridgeTask;
pub use http::{HttpMethod, HttpTask};
pub use json_parse::JsonParseTask;
pub use median::MedianTask;
pub use multiply::MultiplyTask;

/// Closed set of task type tags recognised in pipeline sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    Http,
    JsonParse,
    Multiply,
    Bridge,
    Median,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::JsonParse => "jsonparse",
            Self::Multiply => "multiply",
            Self::Bridge => "bridge",
            Self::Median => "median",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "jsonparse" => Some(Self::JsonParse),
            "multiply" => Some(Self::Multiply),
            "bridge" => Some(Self::Bridge),
            "median" => Some(Self::Median),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ambient state handed to every task execution: the run's meta snapshot,
/// the runner configuration, the store (bridge lookups) and the shared
/// HTTP client.
#[derive(Clone)]
pub struct TaskContext {
    pub meta: Value,
    pub config: Arc<Config>,
    pub store: Arc<dyn PipelineStore>,
    pub client: reqwest::Client,
}

/// A single executable pipeline task.
///
/// `run` is a pure function from inputs and ambient context to one
/// [`TaskResult`]; it fails by returning an error result and never aborts
/// the pipeline.
#[async_trait]
pub trait Task: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn run(&self, ctx: &TaskContext, inputs: &[TaskResult]) -> TaskResult;
}

type TaskFactory = fn(&TaskNode) -> Result<Box<dyn Task>, ParseError>;

/// Maps type tags to task constructors. Sealed after construction: the
/// runner holds it behind an `Arc` and nothing registers at runtime.
pub struct TaskRegistry {
    factories: HashMap<TaskType, TaskFactory>,
}

impl TaskRegistry {
    /// Registry with the production task set.
    pub fn standard() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(TaskType::Http, |node| {
            Ok(Box::new(HttpTask::from_node(node)?))
        });
        registry.register(TaskType::JsonParse, |node| {
            Ok(Box::new(JsonParseTask::from_node(node)?))
        });
        registry.register(TaskType::Multiply, |node| {
            Ok(Box::new(MultiplyTask::from_node(node)?))
        });
        registry.register(TaskType::Bridge, |node| {
            Ok(Box::new(BridgeTask::from_node(node)?))
        });
        registry.register(TaskType::Median, |node| {
            Ok(Box::new(MedianTask::from_node(node)?))
        });
        registry
    }

    pub fn register(&mut self, task_type: TaskType, factory: TaskFactory) {
        self.factories.insert(task_type, factory);
    }

    pub fn build(&self, node: &TaskNode) -> Result<Box<dyn Task>, ParseError> {
        let factory =
            self.factories
                .get(&node.task_type)
                .ok_or_else(|| ParseError::UnknownTaskType {
                    dot_id: node.dot_id.clone(),
                    task_type: node.task_type.as_str().to_string(),
                })?;
        factory(node)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Gate for tasks that consume upstream values: when any parent failed,
/// the first parent error is surfaced verbatim as this task's result.
pub(crate) fn input_values(inputs: &[TaskResult]) -> Result<Vec<&Value>, TaskError> {
    for input in inputs {
        if let Some(error) = &input.error {
            return Err(error.clone());
        }
    }
    inputs
        .iter()
        .map(|input| {
            input
                .value
                .as_ref()
                .ok_or_else(|| TaskError::BadInput("input has neither value nor error".to_string()))
        })
        .collect()
}

pub(crate) fn require_option<'a>(
    node: &'a TaskNode,
    key: &'static str,
) -> Result<&'a str, ParseError> {
    node.options
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ParseError::InvalidOption {
            dot_id: node.dot_id.clone(),
            key,
            message: "option is required".to_string(),
        })
}

pub(crate) fn bool_option(
    node: &TaskNode,
    key: &'static str,
) -> Result<Option<bool>, ParseError> {
    match node.options.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ParseError::InvalidOption {
                dot_id: node.dot_id.clone(),
                key,
                message: format!("expected true or false, got \"{raw}\""),
            }),
    }
}

/// Parse a JSON-object option (e.g. `requestData`) into a value map.
/// Missing options yield an empty map.
pub(crate) fn json_map_option(
    node: &TaskNode,
    key: &'static str,
) -> Result<BTreeMap<String, Value>, ParseError> {
    match node.options.get(key) {
        None => Ok(BTreeMap::new()),
        Some(raw) => {
            let json: serde_json::Value =
                serde_json::from_str(raw).map_err(|err| ParseError::InvalidOption {
                    dot_id: node.dot_id.clone(),
                    key,
                    message: format!("invalid JSON: {err}"),
                })?;
            match Value::from_json(&json) {
                Value::Map(entries) => Ok(entries),
                other => Err(ParseError::InvalidOption {
                    dot_id: node.dot_id.clone(),
                    key,
                    message: format!("expected a JSON object, got {}", other.type_name()),
                }),
            }
        }
    }
}
