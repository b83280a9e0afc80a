use super::{EdgeRow, GraphStore};
use crate::config;
use crate::environments::ConnectionSettings;
use crate::error::StoreError;
use crate::models::PropertyMap;
use crate::registry::{IndexSpec, NodeType, RelationshipType};
use async_trait::async_trait;
use neo4rs::{query, BoltNull, BoltType, Graph, Query};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A Neo4j instance reached over Bolt.
pub struct Neo4jStore {
    graph: Graph,
    uri: String,
    op_timeout: Duration,
}

impl Neo4jStore {
    /// Connects and verifies the connection with `RETURN 1`, retrying while
    /// the server is unreachable. Rejected credentials fail immediately.
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, StoreError> {
        let max_retries = config::CONNECT_MAX_RETRIES;
        let delay = Duration::from_secs(config::CONNECT_RETRY_DELAY_SECS);
        let uri = settings.uri.clone();

        for attempt in 1..=max_retries {
            let outcome = match Graph::new(&settings.uri, &settings.user, &settings.password) {
                Ok(graph) => match graph.run(query("RETURN 1;")).await {
                    Ok(_) => {
                        return Ok(Self {
                            graph,
                            uri,
                            op_timeout: Duration::from_secs(config::STORE_OP_TIMEOUT_SECS),
                        })
                    }
                    Err(e) => classify(&uri, e),
                },
                Err(e) => classify(&uri, e),
            };

            if !outcome.is_retryable() || attempt == max_retries {
                return Err(outcome);
            }
            info!(attempt, uri = %uri, "Cannot connect to Neo4j, retrying: {outcome}");
            tokio::time::sleep(delay).await;
        }

        Err(StoreError::Unavailable {
            uri,
            detail: format!("no connection after {max_retries} attempts"),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, neo4rs::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(&self.uri, e)),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    async fn run_cypher(&self, q: Query) -> Result<(), StoreError> {
        self.timed(self.graph.run(q)).await
    }

    /// Runs a query that returns a single `cnt` column and yields its value.
    async fn query_count(&self, q: Query) -> Result<u64, StoreError> {
        let uri = self.uri.clone();
        self.timed(async move {
            let mut result = self.graph.execute(q).await?;
            match result.next().await? {
                Some(row) => Ok(row.get::<i64>("cnt").ok()),
                None => Ok(None),
            }
        })
        .await
        .map(|cnt| cnt.unwrap_or(0).max(0) as u64)
        .inspect_err(|e| debug!(uri = %uri, error = %e, "Count query failed"))
    }

    /// Collects one string column from every row.
    async fn query_strings(&self, q: Query, column: &str) -> Result<Vec<String>, StoreError> {
        self.timed(async move {
            let mut result = self.graph.execute(q).await?;
            let mut values = Vec::new();
            while let Some(row) = result.next().await? {
                if let Ok(value) = row.get::<String>(column) {
                    values.push(value);
                }
            }
            Ok(values)
        })
        .await
    }

    /// Collects a `props` map column from every row.
    async fn query_properties(&self, q: Query) -> Result<Vec<PropertyMap>, StoreError> {
        let uri = self.uri.clone();
        self.timed(async move {
            let mut result = self.graph.execute(q).await?;
            let mut maps = Vec::new();
            while let Some(row) = result.next().await? {
                match row.get::<PropertyMap>("props") {
                    Ok(props) => maps.push(props),
                    Err(e) => warn!(uri = %uri, error = %e, "Skipping node with unreadable properties"),
                }
            }
            Ok(maps)
        })
        .await
    }

    /// Repeats a `... LIMIT $batch ... RETURN count(*) AS cnt` delete until it
    /// removes nothing, so no single transaction grows unbounded.
    async fn delete_in_batches(&self, cypher: &str) -> Result<u64, StoreError> {
        let mut total = 0;
        loop {
            let deleted = self
                .query_count(query(cypher).param("batch", config::DELETE_BATCH_SIZE))
                .await?;
            total += deleted;
            if deleted == 0 {
                return Ok(total);
            }
            debug!(uri = %self.uri, deleted, total, "Delete batch committed");
        }
    }
}

/// Backtick-quotes a label, type or property name for interpolation.
fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn classify(uri: &str, err: neo4rs::Error) -> StoreError {
    match err {
        neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError => StoreError::Unavailable {
            uri: uri.to_string(),
            detail: err.to_string(),
        },
        neo4rs::Error::AuthenticationError(detail) => StoreError::AuthenticationRejected {
            uri: uri.to_string(),
            detail,
        },
        other => {
            let message = other.to_string();
            if message.contains("TransientError") {
                StoreError::Transient(message)
            } else if message.contains("Security") || message.contains("Unauthorized") {
                StoreError::AuthenticationRejected {
                    uri: uri.to_string(),
                    detail: message,
                }
            } else {
                StoreError::Query(message)
            }
        }
    }
}

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => BoltType::from(s.as_str()),
        Value::Array(items) => BoltType::from(items.iter().map(to_bolt).collect::<Vec<_>>()),
        Value::Object(map) => BoltType::from(
            map.iter()
                .map(|(k, v)| (k.clone(), to_bolt(v)))
                .collect::<HashMap<String, BoltType>>(),
        ),
    }
}

fn props_to_bolt(props: &PropertyMap) -> BoltType {
    BoltType::from(
        props
            .iter()
            .map(|(k, v)| (k.clone(), to_bolt(v)))
            .collect::<HashMap<String, BoltType>>(),
    )
}

fn node_upsert_cypher(node: &NodeType) -> String {
    format!(
        "UNWIND $rows AS row \
         MERGE (n:{label} {{{key}: row.key}}) \
         SET n += row.props, n.updated_at = timestamp() \
         RETURN count(n) AS cnt",
        label = quote(node.label),
        key = quote(node.key),
    )
}

fn edge_upsert_cypher(rel: &RelationshipType) -> String {
    format!(
        "UNWIND $rows AS row \
         MATCH (a:{from} {{{from_key}: row.from}}) \
         MATCH (b:{to} {{{to_key}: row.to}}) \
         MERGE (a)-[r:{rel}]->(b) \
         SET r += row.props \
         RETURN count(r) AS cnt",
        from = quote(rel.from.label),
        from_key = quote(rel.from.key),
        to = quote(rel.to.label),
        to_key = quote(rel.to.key),
        rel = quote(rel.name),
    )
}

#[async_trait]
impl GraphStore for Neo4jStore {
    fn describe(&self) -> String {
        self.uri.clone()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run_cypher(query("RETURN 1;")).await
    }

    async fn upsert_nodes(&self, node: &NodeType, rows: &[PropertyMap]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let params: Vec<BoltType> = rows
            .iter()
            .map(|row| {
                let key = row.get(node.key).map_or(BoltType::Null(BoltNull), to_bolt);
                let mut entry: HashMap<String, BoltType> = HashMap::with_capacity(2);
                entry.insert("key".to_string(), key);
                entry.insert("props".to_string(), props_to_bolt(row));
                BoltType::from(entry)
            })
            .collect();
        self.query_count(query(&node_upsert_cypher(node)).param("rows", params))
            .await
    }

    async fn upsert_edges(&self, rel: &RelationshipType, rows: &[EdgeRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let params: Vec<BoltType> = rows
            .iter()
            .map(|row| {
                let mut entry: HashMap<String, BoltType> = HashMap::with_capacity(3);
                entry.insert("from".to_string(), BoltType::from(row.from.as_str()));
                entry.insert("to".to_string(), BoltType::from(row.to.as_str()));
                entry.insert("props".to_string(), props_to_bolt(&row.properties));
                BoltType::from(entry)
            })
            .collect();
        self.query_count(query(&edge_upsert_cypher(rel)).param("rows", params))
            .await
    }

    async fn existing_keys(&self, node: &NodeType) -> Result<Vec<String>, StoreError> {
        let cypher = format!(
            "MATCH (n:{label}) WHERE n.{key} IS NOT NULL RETURN toString(n.{key}) AS key",
            label = quote(node.label),
            key = quote(node.key),
        );
        self.query_strings(query(&cypher), "key").await
    }

    async fn labels(&self) -> Result<Vec<String>, StoreError> {
        self.query_strings(query("CALL db.labels() YIELD label RETURN label"), "label")
            .await
    }

    async fn relationship_types(&self) -> Result<Vec<String>, StoreError> {
        self.query_strings(
            query("CALL db.relationshipTypes() YIELD relationshipType RETURN relationshipType"),
            "relationshipType",
        )
        .await
    }

    async fn count_nodes(&self, label: &str) -> Result<u64, StoreError> {
        let cypher = format!("MATCH (n:{}) RETURN count(n) AS cnt", quote(label));
        self.query_count(query(&cypher)).await
    }

    async fn count_relationships(&self, rel_type: &str) -> Result<u64, StoreError> {
        let cypher = format!("MATCH ()-[r:{}]->() RETURN count(r) AS cnt", quote(rel_type));
        self.query_count(query(&cypher)).await
    }

    async fn sample_nodes(
        &self,
        label: &str,
        order_key: &str,
        limit: usize,
    ) -> Result<Vec<PropertyMap>, StoreError> {
        let cypher = format!(
            "MATCH (n:{label}) WHERE n.{key} IS NOT NULL \
             WITH n ORDER BY n.{key} LIMIT $limit \
             RETURN properties(n) AS props",
            label = quote(label),
            key = quote(order_key),
        );
        self.query_properties(query(&cypher).param("limit", limit as i64))
            .await
    }

    async fn fetch_nodes(
        &self,
        label: &str,
        key: &str,
        keys: &[Value],
    ) -> Result<Vec<PropertyMap>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let cypher = format!(
            "MATCH (n:{label}) WHERE n.{key} IN $keys RETURN properties(n) AS props",
            label = quote(label),
            key = quote(key),
        );
        let keys: Vec<BoltType> = keys.iter().map(to_bolt).collect();
        self.query_properties(query(&cypher).param("keys", keys))
            .await
    }

    async fn delete_relationship_type(&self, rel_type: &str) -> Result<u64, StoreError> {
        let cypher = format!(
            "MATCH ()-[r:{}]->() WITH r LIMIT $batch DELETE r RETURN count(*) AS cnt",
            quote(rel_type)
        );
        self.delete_in_batches(&cypher).await
    }

    async fn delete_label(&self, label: &str) -> Result<u64, StoreError> {
        let cypher = format!(
            "MATCH (n:{}) WITH n LIMIT $batch DETACH DELETE n RETURN count(*) AS cnt",
            quote(label)
        );
        self.delete_in_batches(&cypher).await
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<(), StoreError> {
        let cypher = format!(
            "CREATE INDEX {name} IF NOT EXISTS FOR (n:{label}) ON (n.{property})",
            name = quote(index.name),
            label = quote(index.label),
            property = quote(index.property),
        );
        self.run_cypher(query(&cypher)).await
    }

    async fn index_names(&self) -> Result<Vec<String>, StoreError> {
        self.query_strings(
            query("SHOW INDEXES YIELD name, type WHERE type <> 'LOOKUP' RETURN name"),
            "name",
        )
        .await
    }

    async fn drop_index(&self, name: &str) -> Result<(), StoreError> {
        let cypher = format!("DROP INDEX {} IF EXISTS", quote(name));
        self.run_cypher(query(&cypher)).await
    }

    async fn drop_everything(&self) -> Result<(), StoreError> {
        let nodes = self
            .delete_in_batches(
                "MATCH (n) WITH n LIMIT $batch DETACH DELETE n RETURN count(*) AS cnt",
            )
            .await?;
        info!(uri = %self.uri, nodes, "Deleted all nodes");

        let constraints = self
            .query_strings(query("SHOW CONSTRAINTS YIELD name RETURN name"), "name")
            .await?;
        for name in &constraints {
            self.run_cypher(query(&format!("DROP CONSTRAINT {} IF EXISTS", quote(name))))
                .await?;
        }

        // constraint-backed indexes are gone by now
        let indexes = self.index_names().await?;
        for name in &indexes {
            self.drop_index(name).await?;
        }
        info!(
            uri = %self.uri,
            constraints = constraints.len(),
            indexes = indexes.len(),
            "Dropped schema"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AUTHORED, MANAGED_INDEXES, PAPER};
    use serde_json::json;

    #[test]
    fn identifiers_are_backtick_quoted() {
        assert_eq!(quote("Paper"), "`Paper`");
        assert_eq!(quote("we`ird"), "`we``ird`");
    }

    #[test]
    fn node_upsert_merges_on_key() {
        let cypher = node_upsert_cypher(&PAPER);
        assert!(cypher.starts_with("UNWIND $rows AS row"));
        assert!(cypher.contains("MERGE (n:`Paper` {`id`: row.key})"));
        assert!(cypher.contains("SET n += row.props"));
        assert!(cypher.contains("RETURN count(n) AS cnt"));
    }

    #[test]
    fn edge_upsert_matches_endpoints() {
        let cypher = edge_upsert_cypher(&AUTHORED);
        assert!(cypher.contains("MATCH (a:`Author` {`name`: row.from})"));
        assert!(cypher.contains("MATCH (b:`Paper` {`id`: row.to})"));
        assert!(cypher.contains("MERGE (a)-[r:`AUTHORED`]->(b)"));
    }

    #[test]
    fn json_values_convert_to_bolt() {
        assert!(matches!(to_bolt(&json!(null)), BoltType::Null(_)));
        assert!(matches!(to_bolt(&json!(true)), BoltType::Boolean(_)));
        assert!(matches!(to_bolt(&json!(3)), BoltType::Integer(_)));
        assert!(matches!(to_bolt(&json!(2.5)), BoltType::Float(_)));
        assert!(matches!(to_bolt(&json!("x")), BoltType::String(_)));
        assert!(matches!(to_bolt(&json!([1, 2])), BoltType::List(_)));
        assert!(matches!(to_bolt(&json!({"a": 1})), BoltType::Map(_)));
    }

    #[test]
    fn managed_index_statements() {
        for index in &MANAGED_INDEXES {
            let cypher = format!(
                "CREATE INDEX {} IF NOT EXISTS FOR (n:{}) ON (n.{})",
                quote(index.name),
                quote(index.label),
                quote(index.property)
            );
            assert!(cypher.contains("IF NOT EXISTS"));
        }
    }
}
