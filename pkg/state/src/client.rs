use pkg_constants::state::{NODES_PREFIX, PODS_PREFIX};
use pkg_types::node::Node;
use pkg_types::pod::Pod;
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::watch::{EventLog, EventType};

pub fn node_key(name: &str) -> String {
    format!("{}{}", NODES_PREFIX, name)
}

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}{}/{}", PODS_PREFIX, namespace, name)
}

/// Split a pod registry key into `(namespace, name)`.
pub fn parse_pod_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(PODS_PREFIX)?;
    let (namespace, name) = rest.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

/// Extract the node name from a node registry key.
pub fn parse_node_key(key: &str) -> Option<&str> {
    key.strip_prefix(NODES_PREFIX).filter(|n| !n.is_empty())
}

/// Persistent state store backed by SlateDB on a local filesystem.
/// Every mutation is recorded in `event_log` for watchers.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    pub event_log: EventLog,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            db,
            event_log: EventLog::new(),
        })
    }

    /// Store a value under the given key and emit a `Put` event.
    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB put failed: {}", e))?;
        self.event_log
            .emit(EventType::Put, key.to_string(), Some(value.to_vec()))
            .await;
        Ok(())
    }

    /// Retrieve the value for a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
        }
    }

    /// Delete a key. Emits a `Delete` event only if the key existed.
    /// Returns whether it existed.
    pub async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        if self.get(key).await?.is_none() {
            return Ok(false);
        }
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB delete failed: {}", e))?;
        self.event_log
            .emit(EventType::Delete, key.to_string(), None)
            .await;
        Ok(true)
    }

    /// List all key-value pairs whose keys start with `prefix`.
    /// Returns them as `(key_string, raw_bytes)`.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

        while let Some(kv) = iter
            .next()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan failed: {}", e))?
        {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            results.push((key, kv.value.to_vec()));
        }
        Ok(results)
    }

    // --- Nodes ---

    pub async fn put_node(&self, node: &Node) -> anyhow::Result<()> {
        let data = serde_json::to_vec(node)?;
        self.put(&node_key(&node.name), &data).await
    }

    pub async fn get_node(&self, name: &str) -> anyhow::Result<Option<Node>> {
        match self.get(&node_key(name)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_node(&self, name: &str) -> anyhow::Result<bool> {
        self.delete(&node_key(name)).await
    }

    pub async fn list_nodes(&self) -> anyhow::Result<Vec<Node>> {
        self.list_decoded(NODES_PREFIX).await
    }

    // --- Pods ---

    pub async fn put_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let data = serde_json::to_vec(pod)?;
        self.put(&pod_key(&pod.namespace, &pod.name), &data).await
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>> {
        match self.get(&pod_key(namespace, name)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> anyhow::Result<bool> {
        self.delete(&pod_key(namespace, name)).await
    }

    pub async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
        self.list_decoded(PODS_PREFIX).await
    }

    async fn list_decoded<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> anyhow::Result<Vec<T>> {
        let entries = self.list_prefix(prefix).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice(&value) {
                Ok(obj) => objects.push(obj),
                Err(e) => warn!("Skipping undecodable entry {}: {}", key, e),
            }
        }
        Ok(objects)
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::ResourceKind;

    #[test]
    fn registry_keys_round_trip() {
        let key = pod_key("team-a", "web-0");
        assert_eq!(key, "/registry/pods/team-a/web-0");
        assert_eq!(parse_pod_key(&key), Some(("team-a", "web-0")));
        assert_eq!(parse_pod_key("/registry/pods/team-a/"), None);
        assert_eq!(parse_node_key(&node_key("node-1")), Some("node-1"));
        assert_eq!(parse_node_key("/registry/nodes/"), None);
    }

    #[tokio::test]
    async fn typed_objects_persist_and_emit_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_str().unwrap()).await.unwrap();
        let mut rx = store.event_log.subscribe();

        let mut node = Node::new("node-1");
        node.labels.insert("zone".to_string(), "zone-0".to_string());
        store.put_node(&node).await.unwrap();
        store.put_pod(&Pod::new("default", "web")).await.unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].topology_value("zone"), Some("zone-0"));
        assert!(store.get_pod("default", "web").await.unwrap().is_some());

        assert_eq!(rx.recv().await.unwrap().kind(), Some(ResourceKind::Node));
        assert_eq!(rx.recv().await.unwrap().kind(), Some(ResourceKind::Pod));

        assert!(store.delete_pod("default", "web").await.unwrap());
        assert!(!store.delete_pod("default", "web").await.unwrap());
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.event_type, EventType::Delete);
        assert_eq!(store.event_log.current_seq().await, 3);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn list_reports_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_str().unwrap()).await.unwrap();
        store.put_node(&Node::new("node-1")).await.unwrap();
        let reader = store.clone();
        store.close().await.unwrap();

        assert!(reader.list_nodes().await.is_err());
        assert!(reader.list_pods().await.is_err());
    }
}
