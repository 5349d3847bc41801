//! Bridge task: POST to a named, operator-configured external adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{json_map_option, require_option, HttpMethod, HttpTask, Task, TaskContext, TaskType};
use crate::dag::{ParseError, TaskNode};
use crate::result::{TaskError, TaskResult};
use crate::store::StoreError;
use crate::value::Value;

/// Looks up a bridge URL by name and delegates to an inner [`HttpTask`]
/// POST whose body is `request_data` plus the run's meta under the
/// reserved `"meta"` key.
#[derive(Clone, Debug)]
pub struct BridgeTask {
    pub name: String,
    pub request_data: BTreeMap<String, Value>,
}

impl BridgeTask {
    pub fn from_node(node: &TaskNode) -> Result<Self, ParseError> {
        Ok(Self {
            name: require_option(node, "name")?.to_string(),
            request_data: json_map_option(node, "requestdata")?,
        })
    }

    /// New request body: the configured payload with the meta snapshot
    /// added. The shared meta is never mutated.
    fn with_meta(&self, meta: &Value) -> BTreeMap<String, Value> {
        let meta_value = match meta {
            Value::Map(entries) => Value::Map(entries.clone()),
            Value::Null => Value::Null,
            other => {
                warn!(
                    bridge = %self.name,
                    meta_type = other.type_name(),
                    "meta field on task run is malformed, discarding"
                );
                Value::Null
            }
        };
        let mut body = self.request_data.clone();
        body.insert("meta".to_string(), meta_value);
        body
    }
}

#[async_trait]
impl Task for BridgeTask {
    fn task_type(&self) -> TaskType {
        TaskType::Bridge
    }

    async fn run(&self, ctx: &TaskContext, inputs: &[TaskResult]) -> TaskResult {
        if !inputs.is_empty() {
            return TaskResult::err(TaskError::WrongInputCardinality {
                task: "BridgeTask",
                want: 0,
                got: inputs.len(),
            });
        }

        let bridge = match ctx.store.find_bridge(&self.name).await {
            Ok(bridge) => bridge,
            Err(StoreError::BridgeNotFound(name)) => {
                return TaskResult::err(TaskError::NoSuchBridge(name))
            }
            Err(err) => return TaskResult::err(TaskError::BridgeLookup(err.to_string())),
        };

        // The bridge URL comes from the operator's own database; some
        // operators run external adapters on their own hardware, so the
        // network policy does not apply here.
        let inner = HttpTask {
            url: bridge.url.clone(),
            method: HttpMethod::Post,
            request_data: self.with_meta(&ctx.meta),
            allow_unrestricted_network_access: Some(true),
        };
        let result = inner.run(ctx, inputs).await;
        if result.error.is_none() {
            debug!(
                bridge = %self.name,
                url = %bridge.url,
                answer = ?result.value,
                "bridge task fetched answer"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PipelineStore};
    use crate::task::test_support::context_with;
    use std::sync::Arc;

    fn bridge_task(name: &str) -> BridgeTask {
        BridgeTask {
            name: name.to_string(),
            request_data: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn unknown_bridge_name_errors() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context_with(Value::Null, store);
        let result = bridge_task("missing").run(&ctx, &[]).await;
        assert_eq!(
            result.error,
            Some(TaskError::NoSuchBridge("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn inputs_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context_with(Value::Null, store);
        let result = bridge_task("any")
            .run(&ctx, &[TaskResult::ok(Value::Null)])
            .await;
        assert!(matches!(
            result.error,
            Some(TaskError::WrongInputCardinality { want: 0, got: 1, .. })
        ));
    }

    #[test]
    fn meta_is_injected_under_the_reserved_key() {
        let mut meta_entries = BTreeMap::new();
        meta_entries.insert(
            "latestAnswer".to_string(),
            Value::String("10".to_string()),
        );
        let meta = Value::Map(meta_entries.clone());

        let mut task = bridge_task("adapter");
        task.request_data
            .insert("times".to_string(), Value::String("5".to_string()));

        let body = task.with_meta(&meta);
        assert_eq!(body.get("meta"), Some(&Value::Map(meta_entries)));
        assert_eq!(body.get("times"), Some(&Value::String("5".to_string())));
        // The task's own payload is untouched.
        assert!(!task.request_data.contains_key("meta"));
    }

    #[test]
    fn malformed_meta_is_discarded() {
        let task = bridge_task("adapter");
        let body = task.with_meta(&Value::String("not a map".to_string()));
        assert_eq!(body.get("meta"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn store_failures_other_than_missing_surface_as_lookup_errors() {
        // Deleting the backing store row mid-run is indistinguishable from
        // a missing bridge; exercise the NotFound path through the trait.
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
        let ctx = context_with(Value::Null, store);
        let result = bridge_task("gone").run(&ctx, &[]).await;
        assert!(matches!(result.error, Some(TaskError::NoSuchBridge(_))));
    }
}
