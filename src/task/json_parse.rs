//! JSON path extraction task.

use async_trait::async_trait;

use super::{bool_option, input_values, require_option, Task, TaskContext, TaskType};
use crate::dag::{ParseError, TaskNode};
use crate::result::{TaskError, TaskResult};
use crate::value::Value;

/// Parses a JSON document from its single input and walks a dot-separated
/// path through it.
///
/// With `lax=false` a missing key or out-of-range index is an error that
/// carries the raw input; with `lax=true` it resolves to `Null`.
#[derive(Clone, Debug)]
pub struct JsonParseTask {
    pub path: Vec<String>,
    pub lax: bool,
}

impl JsonParseTask {
    pub fn from_node(node: &TaskNode) -> Result<Self, ParseError> {
        let path = parse_path(require_option(node, "path")?);
        let lax = bool_option(node, "lax")?.unwrap_or(false);
        Ok(Self { path, lax })
    }

    fn resolve(&self, raw: &str) -> TaskResult {
        let document: serde_json::Value = match serde_json::from_str(raw) {
            Ok(document) => document,
            Err(err) => {
                return TaskResult::err(TaskError::BadInput(format!("invalid JSON: {err}")))
            }
        };

        let mut current = &document;
        for segment in &self.path {
            let next = match current {
                serde_json::Value::Object(entries) => entries.get(segment),
                serde_json::Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None if self.lax => return TaskResult::ok(Value::Null),
                None => {
                    let path = serde_json::to_string(&self.path)
                        .unwrap_or_else(|_| format!("{:?}", self.path));
                    return TaskResult::err(TaskError::PathNotFound {
                        path,
                        raw: raw.to_string(),
                    });
                }
            }
        }

        TaskResult::ok(Value::from_json(current))
    }
}

#[async_trait]
impl Task for JsonParseTask {
    fn task_type(&self) -> TaskType {
        TaskType::JsonParse
    }

    async fn run(&self, _ctx: &TaskContext, inputs: &[TaskResult]) -> TaskResult {
        if inputs.len() != 1 {
            return TaskResult::err(TaskError::WrongInputCardinality {
                task: "JsonParseTask",
                want: 1,
                got: inputs.len(),
            });
        }
        let values = match input_values(inputs) {
            Ok(values) => values,
            Err(error) => return TaskResult::err(error),
        };

        match values[0] {
            Value::String(raw) => self.resolve(raw),
            Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(raw) => self.resolve(raw),
                Err(_) => TaskResult::err(TaskError::BadInput(
                    "input bytes are not valid UTF-8".to_string(),
                )),
            },
            other => TaskResult::err(TaskError::BadInput(format!(
                "expected string or bytes input, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Split a dot-separated path. Segments containing literal dots are
/// double-quoted: `data."dotted.key".value`.
fn parse_path(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;

    for ch in text.chars() {
        match ch {
            '"' => in_quote = !in_quote,
            '.' if !in_quote => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments.retain(|segment| !segment.is_empty());
    segments
}
