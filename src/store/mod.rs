//! The property-graph interface the sync engine and the diff tool talk to.
//!
//! Every operation reports failures as [`StoreError`], which separates
//! connectivity problems (fatal) from timeouts and transient failures
//! (retryable) and from data errors (the query itself was rejected).

pub mod memory;
pub mod neo4j;

use crate::error::StoreError;
use crate::models::PropertyMap;
use crate::registry::{IndexSpec, NodeType, RelationshipType};
use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemoryStore;
pub use neo4j::Neo4jStore;

/// One relationship to merge, addressed by the key values of its endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub from: String,
    pub to: String,
    pub properties: PropertyMap,
}

impl EdgeRow {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            properties: PropertyMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Human-readable identity of the instance, e.g. its URI.
    fn describe(&self) -> String;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Merges nodes by `node.key`; properties of existing nodes are
    /// overwritten with the row's values. Returns the number of rows merged.
    async fn upsert_nodes(&self, node: &NodeType, rows: &[PropertyMap]) -> Result<u64, StoreError>;

    /// Merges relationships by (from, to, type). Rows whose endpoints do not
    /// exist are skipped; the return value counts only merged rows.
    async fn upsert_edges(&self, rel: &RelationshipType, rows: &[EdgeRow]) -> Result<u64, StoreError>;

    /// Every key value currently stored for `node`.
    async fn existing_keys(&self, node: &NodeType) -> Result<Vec<String>, StoreError>;

    async fn labels(&self) -> Result<Vec<String>, StoreError>;

    async fn relationship_types(&self) -> Result<Vec<String>, StoreError>;

    async fn count_nodes(&self, label: &str) -> Result<u64, StoreError>;

    async fn count_relationships(&self, rel_type: &str) -> Result<u64, StoreError>;

    /// The first `limit` nodes of `label` that carry `order_key`, ordered by it.
    async fn sample_nodes(
        &self,
        label: &str,
        order_key: &str,
        limit: usize,
    ) -> Result<Vec<PropertyMap>, StoreError>;

    /// Nodes of `label` whose `key` property is one of `keys`.
    async fn fetch_nodes(
        &self,
        label: &str,
        key: &str,
        keys: &[Value],
    ) -> Result<Vec<PropertyMap>, StoreError>;

    /// Deletes all relationships of one type. Returns how many were removed.
    async fn delete_relationship_type(&self, rel_type: &str) -> Result<u64, StoreError>;

    /// Deletes all nodes with `label` together with any relationship touching them.
    async fn delete_label(&self, label: &str) -> Result<u64, StoreError>;

    async fn create_index(&self, index: &IndexSpec) -> Result<(), StoreError>;

    async fn index_names(&self) -> Result<Vec<String>, StoreError>;

    async fn drop_index(&self, name: &str) -> Result<(), StoreError>;

    /// Removes every node, relationship, constraint and index.
    async fn drop_everything(&self) -> Result<(), StoreError>;
}
