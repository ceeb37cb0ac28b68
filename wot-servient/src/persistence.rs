//! Persistence writer interface
//!
//! The servient records interaction traffic through this narrow interface;
//! the actual time-series or relational engine is an external collaborator
//! and any implementation may be a NOP. Writer failures never break a
//! user-visible interaction: they are logged and swallowed at the call
//! sites via [`record_point`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;

/// Narrow writer contract the servient calls
#[async_trait]
pub trait PersistenceWriter: Send + Sync {
    /// Records a datum under a bucket and key; must tolerate any JSON value
    async fn write_point(&self, bucket: &str, key: &str, value: &Value) -> Result<()>;

    /// Returns a tabular result for the given query
    async fn execute_query(&self, query: &str) -> Result<Vec<Vec<Value>>>;

    /// Structured insert of one row into a table
    async fn insert_data(&self, table: &str, row: &[Value]) -> Result<()>;
}

/// Writer that discards everything
#[derive(Debug, Default)]
pub struct NopWriter;

#[async_trait]
impl PersistenceWriter for NopWriter {
    async fn write_point(&self, _bucket: &str, _key: &str, _value: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute_query(&self, _query: &str) -> Result<Vec<Vec<Value>>> {
        Ok(Vec::new())
    }

    async fn insert_data(&self, _table: &str, _row: &[Value]) -> Result<()> {
        Ok(())
    }
}

/// In-memory writer, useful in tests and as a cheap default recorder
#[derive(Debug, Default)]
pub struct MemoryWriter {
    points: Mutex<Vec<(String, String, Value)>>,
    rows: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded points
    pub async fn points(&self) -> Vec<(String, String, Value)> {
        self.points.lock().await.clone()
    }
}

#[async_trait]
impl PersistenceWriter for MemoryWriter {
    async fn write_point(&self, bucket: &str, key: &str, value: &Value) -> Result<()> {
        self.points
            .lock()
            .await
            .push((bucket.to_string(), key.to_string(), value.clone()));
        Ok(())
    }

    async fn execute_query(&self, _query: &str) -> Result<Vec<Vec<Value>>> {
        Ok(Vec::new())
    }

    async fn insert_data(&self, table: &str, row: &[Value]) -> Result<()> {
        self.rows
            .lock()
            .await
            .push((table.to_string(), row.to_vec()));
        Ok(())
    }
}

/// Flattens a nested JSON object into dot-separated keys. Non-object
/// values flatten to a single pair under the parent key.
pub fn flatten_value(key: &str, value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(map) => map
            .iter()
            .flat_map(|(child, val)| flatten_value(&format!("{}.{}", key, child), val))
            .collect(),
        other => vec![(key.to_string(), other.clone())],
    }
}

/// Records a point through the writer, logging and swallowing any failure.
pub async fn record_point(writer: &Arc<dyn PersistenceWriter>, bucket: &str, key: &str, value: &Value) {
    for (flat_key, flat_value) in flatten_value(key, value) {
        if let Err(err) = writer.write_point(bucket, &flat_key, &flat_value).await {
            tracing::warn!(bucket, key = %flat_key, "Persistence write failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_scalar() {
        let pairs = flatten_value("temperature", &json!(21.5));
        assert_eq!(pairs, vec![("temperature".to_string(), json!(21.5))]);
    }

    #[test]
    fn test_flatten_nested_object() {
        let pairs = flatten_value(
            "status",
            &json!({"water": {"level": 80, "hot": true}, "beans": 40}),
        );

        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"status.water.level"));
        assert!(keys.contains(&"status.water.hot"));
        assert!(keys.contains(&"status.beans"));
    }

    #[tokio::test]
    async fn test_memory_writer_records_points() {
        let writer = MemoryWriter::new();
        writer
            .write_point("property", "temperature", &json!(20))
            .await
            .unwrap();

        let points = writer.points().await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].1, "temperature");
    }

    #[tokio::test]
    async fn test_record_point_flattens_objects() {
        let mem = Arc::new(MemoryWriter::new());
        let writer: Arc<dyn PersistenceWriter> = mem.clone();

        record_point(&writer, "property", "status", &json!({"a": 1, "b": {"c": 2}})).await;

        let points = mem.points().await;
        let keys: Vec<&str> = points.iter().map(|(_, k, _)| k.as_str()).collect();
        assert_eq!(points.len(), 2);
        assert!(keys.contains(&"status.a"));
        assert!(keys.contains(&"status.b.c"));
    }
}
