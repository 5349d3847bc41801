//! Decimal multiplication task.

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{input_values, require_option, Task, TaskContext, TaskType};
use crate::dag::{ParseError, TaskNode};
use crate::result::{TaskError, TaskResult};
use crate::value::Value;

/// Multiplies its single input by a configured factor and emits the
/// product in canonical decimal form (`6257`, `6194.2`, `6225.6`).
#[derive(Clone, Debug)]
pub struct MultiplyTask {
    pub times: Decimal,
}

impl MultiplyTask {
    pub fn from_node(node: &TaskNode) -> Result<Self, ParseError> {
        let raw = require_option(node, "times")?;
        let times = Decimal::from_str(raw)
            .or_else(|_| Decimal::from_scientific(raw))
            .map_err(|err| ParseError::InvalidOption {
                dot_id: node.dot_id.clone(),
                key: "times",
                message: err.to_string(),
            })?;
        Ok(Self { times })
    }
}

#[async_trait]
impl Task for MultiplyTask {
    fn task_type(&self) -> TaskType {
        TaskType::Multiply
    }

    async fn run(&self, _ctx: &TaskContext, inputs: &[TaskResult]) -> TaskResult {
        if inputs.len() != 1 {
            return TaskResult::err(TaskError::WrongInputCardinality {
                task: "MultiplyTask",
                want: 1,
                got: inputs.len(),
            });
        }
        let values = match input_values(inputs) {
            Ok(values) => values,
            Err(error) => return TaskResult::err(error),
        };
        let input = match values[0].to_decimal() {
            Ok(decimal) => decimal,
            Err(error) => return TaskResult::err(error),
        };
        TaskResult::ok(Value::canonical_decimal(input * self.times))
    }
}
