use super::{EdgeRow, GraphStore};
use crate::error::StoreError;
use crate::models::PropertyMap;
use crate::registry::{IndexSpec, NodeType, RelationshipType};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

type NodeId = u64;

struct Node {
    label: String,
    /// (key property, key value) the node was merged on
    key: (String, String),
    properties: PropertyMap,
}

struct Edge {
    rel_type: String,
    from: NodeId,
    to: NodeId,
    properties: PropertyMap,
}

#[derive(Default)]
struct Graph {
    next_id: u64,
    nodes: BTreeMap<NodeId, Node>,
    /// (label, key property, key value) -> node
    node_index: FxHashMap<(String, String, String), NodeId>,
    edges: BTreeMap<u64, Edge>,
    /// (type, from, to) -> edge
    edge_index: FxHashMap<(String, NodeId, NodeId), u64>,
    indexes: BTreeMap<String, (String, String)>,
}

impl Graph {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn find(&self, label: &str, key: &str, value: &str) -> Option<NodeId> {
        self.node_index
            .get(&(label.to_string(), key.to_string(), value.to_string()))
            .copied()
    }

    fn remove_edge(&mut self, id: u64) -> bool {
        match self.edges.remove(&id) {
            Some(edge) => {
                self.edge_index.remove(&(edge.rel_type, edge.from, edge.to));
                true
            }
            None => false,
        }
    }

    fn remove_nodes(&mut self, ids: &FxHashSet<NodeId>) {
        let incident: Vec<u64> = self
            .edges
            .iter()
            .filter(|(_, e)| ids.contains(&e.from) || ids.contains(&e.to))
            .map(|(eid, _)| *eid)
            .collect();
        for eid in incident {
            self.remove_edge(eid);
        }
        for id in ids {
            if let Some(node) = self.nodes.remove(id) {
                let (key, value) = node.key;
                self.node_index.remove(&(node.label, key, value));
            }
        }
    }
}

/// An in-process graph with the same merge semantics as the Neo4j store.
///
/// Used for `--dry-run` and throughout the tests. Nodes have exactly one
/// label; a null property value removes the property, as `SET n += $props`
/// does in Cypher.
pub struct MemoryStore {
    name: String,
    graph: Mutex<Graph>,
    offline: AtomicBool,
    transient_failures: AtomicU32,
    rejected_keys: Mutex<FxHashSet<String>>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            graph: Mutex::new(Graph::default()),
            offline: AtomicBool::new(false),
            transient_failures: AtomicU32::new(0),
            rejected_keys: Mutex::new(FxHashSet::default()),
        }
    }

    /// Makes every subsequent call fail as if the server were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `count` write calls fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Any node upsert batch containing this key value is rejected as a data
    /// error, like a constraint violation would be.
    pub fn reject_key(&self, key: &str) {
        if let Ok(mut keys) = self.rejected_keys.lock() {
            keys.insert(key.to_string());
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Graph>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                uri: self.describe(),
                detail: "connection refused".to_string(),
            });
        }
        self.graph
            .lock()
            .map_err(|_| StoreError::Query("memory store poisoned".to_string()))
    }

    fn check_transient(&self) -> Result<(), StoreError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Transient(
                "Neo.TransientError.Transaction.DeadlockDetected".to_string(),
            ));
        }
        Ok(())
    }
}

fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn merge_properties(target: &mut PropertyMap, updates: &PropertyMap) {
    for (name, value) in updates {
        if value.is_null() {
            target.remove(name);
        } else {
            target.insert(name.clone(), value.clone());
        }
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn upsert_nodes(&self, node: &NodeType, rows: &[PropertyMap]) -> Result<u64, StoreError> {
        let mut graph = self.lock()?;
        self.check_transient()?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row
                .get(node.key)
                .filter(|v| !v.is_null())
                .map(key_string)
                .ok_or_else(|| {
                    StoreError::Query(format!("{} row without {}", node.label, node.key))
                })?;
            if self
                .rejected_keys
                .lock()
                .map(|r| r.contains(&key))
                .unwrap_or(false)
            {
                return Err(StoreError::Query(format!(
                    "Node({}) already exists with {} = {key:?}",
                    node.label, node.key
                )));
            }
            keys.push(key);
        }

        for (row, key) in rows.iter().zip(keys) {
            let id = match graph.find(node.label, node.key, &key) {
                Some(id) => id,
                None => {
                    let id = graph.next_id();
                    graph.nodes.insert(
                        id,
                        Node {
                            label: node.label.to_string(),
                            key: (node.key.to_string(), key.clone()),
                            properties: PropertyMap::new(),
                        },
                    );
                    graph
                        .node_index
                        .insert((node.label.to_string(), node.key.to_string(), key), id);
                    id
                }
            };
            if let Some(stored) = graph.nodes.get_mut(&id) {
                merge_properties(&mut stored.properties, row);
            }
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_edges(&self, rel: &RelationshipType, rows: &[EdgeRow]) -> Result<u64, StoreError> {
        let mut graph = self.lock()?;
        self.check_transient()?;

        let mut merged = 0;
        for row in rows {
            let (Some(from), Some(to)) = (
                graph.find(rel.from.label, rel.from.key, &row.from),
                graph.find(rel.to.label, rel.to.key, &row.to),
            ) else {
                continue;
            };
            let index_key = (rel.name.to_string(), from, to);
            let existing = graph.edge_index.get(&index_key).copied();
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = graph.next_id();
                    graph.edges.insert(
                        id,
                        Edge {
                            rel_type: rel.name.to_string(),
                            from,
                            to,
                            properties: PropertyMap::new(),
                        },
                    );
                    graph.edge_index.insert(index_key, id);
                    id
                }
            };
            if let Some(edge) = graph.edges.get_mut(&id) {
                merge_properties(&mut edge.properties, &row.properties);
            }
            merged += 1;
        }
        Ok(merged)
    }

    async fn existing_keys(&self, node: &NodeType) -> Result<Vec<String>, StoreError> {
        let graph = self.lock()?;
        Ok(graph
            .nodes
            .values()
            .filter(|n| n.label == node.label)
            .filter_map(|n| n.properties.get(node.key).map(key_string))
            .collect())
    }

    async fn labels(&self) -> Result<Vec<String>, StoreError> {
        let graph = self.lock()?;
        let labels: BTreeSet<_> = graph.nodes.values().map(|n| n.label.clone()).collect();
        Ok(labels.into_iter().collect())
    }

    async fn relationship_types(&self) -> Result<Vec<String>, StoreError> {
        let graph = self.lock()?;
        let types: BTreeSet<_> = graph.edges.values().map(|e| e.rel_type.clone()).collect();
        Ok(types.into_iter().collect())
    }

    async fn count_nodes(&self, label: &str) -> Result<u64, StoreError> {
        let graph = self.lock()?;
        Ok(graph.nodes.values().filter(|n| n.label == label).count() as u64)
    }

    async fn count_relationships(&self, rel_type: &str) -> Result<u64, StoreError> {
        let graph = self.lock()?;
        Ok(graph.edges.values().filter(|e| e.rel_type == rel_type).count() as u64)
    }

    async fn sample_nodes(
        &self,
        label: &str,
        order_key: &str,
        limit: usize,
    ) -> Result<Vec<PropertyMap>, StoreError> {
        let graph = self.lock()?;
        let mut matching: Vec<(String, &PropertyMap)> = graph
            .nodes
            .values()
            .filter(|n| n.label == label)
            .filter_map(|n| n.properties.get(order_key).map(|v| (key_string(v), &n.properties)))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, props)| props.clone())
            .collect())
    }

    async fn fetch_nodes(
        &self,
        label: &str,
        key: &str,
        keys: &[Value],
    ) -> Result<Vec<PropertyMap>, StoreError> {
        let graph = self.lock()?;
        let wanted: FxHashSet<String> = keys.iter().map(key_string).collect();
        Ok(graph
            .nodes
            .values()
            .filter(|n| n.label == label)
            .filter(|n| {
                n.properties
                    .get(key)
                    .is_some_and(|v| wanted.contains(&key_string(v)))
            })
            .map(|n| n.properties.clone())
            .collect())
    }

    async fn delete_relationship_type(&self, rel_type: &str) -> Result<u64, StoreError> {
        let mut graph = self.lock()?;
        let ids: Vec<u64> = graph
            .edges
            .iter()
            .filter(|(_, e)| e.rel_type == rel_type)
            .map(|(id, _)| *id)
            .collect();
        let count = ids.len() as u64;
        for id in ids {
            graph.remove_edge(id);
        }
        Ok(count)
    }

    async fn delete_label(&self, label: &str) -> Result<u64, StoreError> {
        let mut graph = self.lock()?;
        let ids: FxHashSet<NodeId> = graph
            .nodes
            .iter()
            .filter(|(_, n)| n.label == label)
            .map(|(id, _)| *id)
            .collect();
        graph.remove_nodes(&ids);
        Ok(ids.len() as u64)
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<(), StoreError> {
        let mut graph = self.lock()?;
        graph
            .indexes
            .entry(index.name.to_string())
            .or_insert_with(|| (index.label.to_string(), index.property.to_string()));
        Ok(())
    }

    async fn index_names(&self) -> Result<Vec<String>, StoreError> {
        let graph = self.lock()?;
        Ok(graph.indexes.keys().cloned().collect())
    }

    async fn drop_index(&self, name: &str) -> Result<(), StoreError> {
        let mut graph = self.lock()?;
        graph.indexes.remove(name);
        Ok(())
    }

    async fn drop_everything(&self) -> Result<(), StoreError> {
        let mut graph = self.lock()?;
        *graph = Graph::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AUTHOR, AUTHORED, MANAGED_INDEXES, PAPER};
    use serde_json::json;

    fn props(value: Value) -> PropertyMap {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn upsert_is_merge_by_key() {
        let store = MemoryStore::new("t");
        store
            .upsert_nodes(&PAPER, &[props(json!({"id": "p1", "title": "A", "venue": "X"}))])
            .await
            .unwrap();
        store
            .upsert_nodes(&PAPER, &[props(json!({"id": "p1", "title": "B", "venue": null}))])
            .await
            .unwrap();

        assert_eq!(store.count_nodes("Paper").await.unwrap(), 1);
        let nodes = store.fetch_nodes("Paper", "id", &[json!("p1")]).await.unwrap();
        assert_eq!(nodes[0]["title"], json!("B"));
        assert!(!nodes[0].contains_key("venue"));
    }

    #[tokio::test]
    async fn edges_require_endpoints_and_merge() {
        let store = MemoryStore::new("t");
        store
            .upsert_nodes(&PAPER, &[props(json!({"id": "p1"}))])
            .await
            .unwrap();
        store
            .upsert_nodes(&AUTHOR, &[props(json!({"name": "Ada"}))])
            .await
            .unwrap();

        let rows = vec![EdgeRow::new("Ada", "p1"), EdgeRow::new("Ghost", "p1")];
        assert_eq!(store.upsert_edges(&AUTHORED, &rows).await.unwrap(), 1);
        assert_eq!(store.upsert_edges(&AUTHORED, &rows).await.unwrap(), 1);
        assert_eq!(store.count_relationships("AUTHORED").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_label_detaches_edges() {
        let store = MemoryStore::new("t");
        store
            .upsert_nodes(&PAPER, &[props(json!({"id": "p1"}))])
            .await
            .unwrap();
        store
            .upsert_nodes(&AUTHOR, &[props(json!({"name": "Ada"}))])
            .await
            .unwrap();
        store
            .upsert_edges(&AUTHORED, &[EdgeRow::new("Ada", "p1")])
            .await
            .unwrap();

        assert_eq!(store.delete_label("Paper").await.unwrap(), 1);
        assert_eq!(store.count_relationships("AUTHORED").await.unwrap(), 0);
        assert_eq!(store.count_nodes("Author").await.unwrap(), 1);

        // re-creating the node must not resurrect the old identity
        store
            .upsert_nodes(&PAPER, &[props(json!({"id": "p1"}))])
            .await
            .unwrap();
        assert_eq!(store.count_nodes("Paper").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sample_is_ordered_by_key() {
        let store = MemoryStore::new("t");
        let rows: Vec<_> = ["c", "a", "b"]
            .iter()
            .map(|id| props(json!({"id": id})))
            .collect();
        store.upsert_nodes(&PAPER, &rows).await.unwrap();
        let sample = store.sample_nodes("Paper", "id", 2).await.unwrap();
        let ids: Vec<_> = sample.iter().map(|p| p["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new("t");
        store.set_offline(true);
        let err = store.count_nodes("Paper").await.unwrap_err();
        assert!(err.is_connectivity());
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn rejected_key_fails_whole_batch() {
        let store = MemoryStore::new("t");
        store.reject_key("bad");
        let rows = vec![props(json!({"id": "ok"})), props(json!({"id": "bad"}))];
        let err = store.upsert_nodes(&PAPER, &rows).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
        assert_eq!(store.count_nodes("Paper").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_consumed() {
        let store = MemoryStore::new("t");
        store.fail_next_writes(1);
        let rows = vec![props(json!({"id": "p"}))];
        assert!(store.upsert_nodes(&PAPER, &rows).await.unwrap_err().is_retryable());
        assert_eq!(store.upsert_nodes(&PAPER, &rows).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn indexes_and_drop_everything() {
        let store = MemoryStore::new("t");
        for index in &MANAGED_INDEXES {
            store.create_index(index).await.unwrap();
        }
        store
            .upsert_nodes(&PAPER, &[props(json!({"id": "p"}))])
            .await
            .unwrap();
        assert_eq!(store.index_names().await.unwrap().len(), 6);

        store.drop_everything().await.unwrap();
        assert!(store.index_names().await.unwrap().is_empty());
        assert!(store.labels().await.unwrap().is_empty());
    }
}
