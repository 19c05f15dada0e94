//! A durable ordered map for handler bodies.
//!
//! User-visible storage over the same state runtime the rest of the
//! system commits through, so a handler step that writes here and a
//! workflow checkpoint commit share one durability story. Writes take an
//! optional idempotency key; inside a handler that is typically
//! `ctx.workflow().per_workflow_key(...)` or an `at_least_once` body.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};

use durablemcp_runtime::{RecordRef, RuntimeError, StateRuntime};

use crate::error::ServerError;

/// Record type holding one sorted map.
pub const SORTED_MAP_RECORD_KIND: &str = "durablemcp.v1.SortedMap";

/// Handle to one durable sorted map.
#[derive(Debug, Clone)]
pub struct SortedMap {
    record: RecordRef,
}

impl SortedMap {
    /// Reference the map with the given name.
    pub fn reference(id: impl Into<String>) -> Self {
        Self {
            record: RecordRef::new(SORTED_MAP_RECORD_KIND, id),
        }
    }

    /// Insert (or overwrite) entries.
    pub async fn insert(
        &self,
        runtime: &Arc<dyn StateRuntime>,
        idempotency_key: Option<String>,
        entries: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<(), ServerError> {
        let entries: Vec<(String, Value)> = entries.into_iter().collect();
        runtime
            .commit(
                &self.record,
                idempotency_key,
                Box::new(move |value| {
                    let map = entries_mut(value)?;
                    for (key, entry) in entries {
                        map.insert(key, entry);
                    }
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }

    /// Read one entry.
    pub async fn get(
        &self,
        runtime: &Arc<dyn StateRuntime>,
        key: &str,
    ) -> Result<Option<Value>, ServerError> {
        Ok(self.entries(runtime).await?.remove(key))
    }

    /// Remove one entry.
    pub async fn remove(
        &self,
        runtime: &Arc<dyn StateRuntime>,
        idempotency_key: Option<String>,
        key: &str,
    ) -> Result<(), ServerError> {
        let key = key.to_string();
        runtime
            .commit(
                &self.record,
                idempotency_key,
                Box::new(move |value| {
                    entries_mut(value)?.remove(&key);
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }

    /// Entries in key order, starting at `start` (inclusive) when given,
    /// up to `limit`.
    pub async fn range(
        &self,
        runtime: &Arc<dyn StateRuntime>,
        start: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, ServerError> {
        let entries = self.entries(runtime).await?;
        let range = match start {
            Some(start) => entries.range(start.to_string()..),
            None => entries.range::<String, _>(..),
        };
        Ok(range
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    /// Number of entries.
    pub async fn len(&self, runtime: &Arc<dyn StateRuntime>) -> Result<usize, ServerError> {
        Ok(self.entries(runtime).await?.len())
    }

    /// Whether the map is empty.
    pub async fn is_empty(&self, runtime: &Arc<dyn StateRuntime>) -> Result<bool, ServerError> {
        Ok(self.len(runtime).await? == 0)
    }

    async fn entries(
        &self,
        runtime: &Arc<dyn StateRuntime>,
    ) -> Result<BTreeMap<String, Value>, ServerError> {
        let Some(value) = runtime.read(&self.record).await? else {
            return Ok(BTreeMap::new());
        };
        match value.get("entries") {
            Some(entries) => Ok(serde_json::from_value(entries.clone())?),
            None => Ok(BTreeMap::new()),
        }
    }
}

fn entries_mut(value: &mut Value) -> Result<&mut serde_json::Map<String, Value>, RuntimeError> {
    if value.is_null() {
        *value = json!({"entries": {}});
    }
    value
        .get_mut("entries")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| RuntimeError::Storage("sorted map record has no entries".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use durablemcp_runtime::MemoryRuntime;

    fn runtime() -> Arc<dyn StateRuntime> {
        Arc::new(MemoryRuntime::new())
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let runtime = runtime();
        let map = SortedMap::reference("test");

        map.insert(&runtime, None, [("5 + 3".to_string(), json!("8"))])
            .await
            .unwrap();
        assert_eq!(map.get(&runtime, "5 + 3").await.unwrap(), Some(json!("8")));
        assert_eq!(map.len(&runtime).await.unwrap(), 1);

        map.remove(&runtime, None, "5 + 3").await.unwrap();
        assert_eq!(map.get(&runtime, "5 + 3").await.unwrap(), None);
        assert!(map.is_empty(&runtime).await.unwrap());
    }

    #[tokio::test]
    async fn keyed_insert_applies_once() {
        let runtime = runtime();
        let map = SortedMap::reference("test");

        for _ in 0..3 {
            map.insert(
                &runtime,
                Some("store-sum".into()),
                [("5 + 3".to_string(), json!("8"))],
            )
            .await
            .unwrap();
        }
        assert_eq!(map.len(&runtime).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn range_is_key_ordered() {
        let runtime = runtime();
        let map = SortedMap::reference("test");
        map.insert(
            &runtime,
            None,
            [
                ("c".to_string(), json!(3)),
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
            ],
        )
        .await
        .unwrap();

        let all = map.range(&runtime, None, 10).await.unwrap();
        let keys: Vec<_> = all.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let from_b = map.range(&runtime, Some("b"), 1).await.unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].0, "b");
    }
}
