//! Median aggregation over sibling task outputs.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{input_values, Task, TaskContext, TaskType};
use crate::dag::{ParseError, TaskNode};
use crate::result::{TaskError, TaskResult};
use crate::value::Value;

/// Emits the median of all inputs coerced to decimals, in canonical form.
/// Even input counts average the two middle values.
#[derive(Clone, Debug, Default)]
pub struct MedianTask;

impl MedianTask {
    pub fn from_node(_node: &TaskNode) -> Result<Self, ParseError> {
        Ok(Self)
    }
}

#[async_trait]
impl Task for MedianTask {
    fn task_type(&self) -> TaskType {
        TaskType::Median
    }

    async fn run(&self, _ctx: &TaskContext, inputs: &[TaskResult]) -> TaskResult {
        if inputs.is_empty() {
            return TaskResult::err(TaskError::WrongInputCardinality {
                task: "MedianTask",
                want: 1,
                got: 0,
            });
        }
        let values = match input_values(inputs) {
            Ok(values) => values,
            Err(error) => return TaskResult::err(error),
        };

        let mut decimals = Vec::with_capacity(values.len());
        for value in values {
            match value.to_decimal() {
                Ok(decimal) => decimals.push(decimal),
                Err(error) => return TaskResult::err(error),
            }
        }
        decimals.sort();

        let mid = decimals.len() / 2;
        let median = if decimals.len() % 2 == 1 {
            decimals[mid]
        } else {
            (decimals[mid - 1] + decimals[mid]) / Decimal::TWO
        };
        TaskResult::ok(Value::canonical_decimal(median))
    }
}
