//! Metadata store: the shared source of truth for instances, vertex
//! placement, endpoints and the desired connection graph.
//!
//! Two backends share one implementation of [`MetadataStore`]: an in-memory
//! snapshot for tests and embedded use, and a JSON file for single-host
//! deployments where the CLI and several workers share a path. The file is
//! re-read on every call so other processes' writes are visible; writes
//! replace it atomically through a temporary file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vertexmesh_transport::ConnectionKey;

use crate::endpoint::EndpointIdentity;
use crate::error::{Result, RuntimeError};

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique instance name.
    pub name: String,
    /// Address other workers dial.
    pub address: String,
    /// Listening port.
    pub port: u16,
}

/// Placement and construction data of a vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexRecord {
    /// Vertex name.
    pub vertex_name: String,
    /// Instance hosting the vertex.
    pub instance_name: String,
    /// Definition the vertex is built from.
    pub definition: String,
    /// Construction parameter.
    #[serde(default)]
    pub parameter: Vec<u8>,
}

/// Where a vertex can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexLocation {
    /// Hosting instance.
    pub instance: String,
    /// Instance address.
    pub address: String,
    /// Instance port.
    pub port: u16,
}

/// Complete store contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSnapshot {
    /// Instances by name.
    pub instances: BTreeMap<String, InstanceRecord>,
    /// Vertices by name.
    pub vertices: BTreeMap<String, VertexRecord>,
    /// Endpoints by vertex name.
    pub endpoints: BTreeMap<String, Vec<EndpointIdentity>>,
    /// Desired connection graph.
    pub connections: BTreeSet<ConnectionKey>,
}

/// Operations workers and clients need from the metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Registers or replaces an instance.
    async fn register_instance(&self, record: InstanceRecord) -> Result<()>;

    /// Looks up an instance.
    async fn instance(&self, name: &str) -> Result<Option<InstanceRecord>>;

    /// Removes an instance. Returns whether it existed.
    async fn remove_instance(&self, name: &str) -> Result<bool>;

    /// Registers or replaces a vertex record.
    async fn register_vertex(&self, record: VertexRecord) -> Result<()>;

    /// Looks up a vertex record.
    async fn vertex(&self, name: &str) -> Result<Option<VertexRecord>>;

    /// Resolves where a vertex is hosted. `None` when the vertex or its
    /// instance is unknown.
    async fn resolve_vertex(&self, name: &str) -> Result<Option<VertexLocation>>;

    /// Vertices assigned to an instance.
    async fn vertices_on(&self, instance: &str) -> Result<Vec<VertexRecord>>;

    /// Removes a vertex record. Returns whether it existed.
    async fn remove_vertex(&self, name: &str) -> Result<bool>;

    /// Replaces the endpoint list of a vertex.
    async fn register_endpoints(&self, vertex: &str, endpoints: Vec<EndpointIdentity>)
        -> Result<()>;

    /// Endpoints of a vertex.
    async fn endpoints(&self, vertex: &str) -> Result<Vec<EndpointIdentity>>;

    /// Drops the endpoint list of a vertex.
    async fn remove_endpoints(&self, vertex: &str) -> Result<()>;

    /// Adds a desired connection. Returns false if it was already present.
    async fn add_connection(&self, key: &ConnectionKey) -> Result<bool>;

    /// Removes a desired connection. Returns whether it existed.
    async fn remove_connection(&self, key: &ConnectionKey) -> Result<bool>;

    /// Whether a desired connection exists.
    async fn connection_exists(&self, key: &ConnectionKey) -> Result<bool>;

    /// Desired connections whose from side is `vertex`.
    async fn connections_from(&self, vertex: &str) -> Result<Vec<ConnectionKey>>;

    /// Desired connections whose to side is `vertex`.
    async fn connections_to(&self, vertex: &str) -> Result<Vec<ConnectionKey>>;

    /// Every desired connection.
    async fn connections(&self) -> Result<Vec<ConnectionKey>>;
}

/// Storage of a whole [`MetadataSnapshot`].
#[async_trait]
pub trait SnapshotBackend: Send + Sync + 'static {
    /// Reads the current snapshot.
    async fn load(&self) -> Result<MetadataSnapshot>;

    /// Replaces the current snapshot.
    async fn store(&self, snapshot: MetadataSnapshot) -> Result<()>;
}

/// Snapshot held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: parking_lot::RwLock<MetadataSnapshot>,
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn load(&self) -> Result<MetadataSnapshot> {
        Ok(self.state.read().clone())
    }

    async fn store(&self, snapshot: MetadataSnapshot) -> Result<()> {
        *self.state.write() = snapshot;
        Ok(())
    }
}

/// Snapshot kept as a JSON file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

#[async_trait]
impl SnapshotBackend for FileBackend {
    async fn load(&self) -> Result<MetadataSnapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(data) if data.is_empty() => Ok(MetadataSnapshot::default()),
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                RuntimeError::metadata(format!("corrupt store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MetadataSnapshot::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, snapshot: MetadataSnapshot) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(&snapshot)?;
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        tokio::fs::write(&tmp_path, &encoded).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

/// [`MetadataStore`] over any [`SnapshotBackend`].
///
/// Writes are serialized by an async lock so read-modify-write cycles from
/// this process never interleave.
#[derive(Debug)]
pub struct SnapshotStore<B> {
    backend: B,
    write_lock: tokio::sync::Mutex<()>,
}

/// In-memory metadata store.
pub type InMemoryMetadataStore = SnapshotStore<MemoryBackend>;

/// JSON-file metadata store.
pub type FileMetadataStore = SnapshotStore<FileBackend>;

impl InMemoryMetadataStore {
    /// Empty in-memory store.
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::default())
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMetadataStore {
    /// Store backed by `path`. The file is created on first write.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::with_backend(FileBackend {
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.backend.path
    }
}

impl<B: SnapshotBackend> SnapshotStore<B> {
    /// Store over `backend`.
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current contents.
    pub async fn snapshot(&self) -> Result<MetadataSnapshot> {
        self.backend.load().await
    }

    async fn read<R>(&self, f: impl FnOnce(&MetadataSnapshot) -> R + Send) -> Result<R> {
        let snapshot = self.backend.load().await?;
        Ok(f(&snapshot))
    }

    async fn write<R>(&self, f: impl FnOnce(&mut MetadataSnapshot) -> R + Send) -> Result<R>
    where
        R: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.backend.load().await?;
        let out = f(&mut snapshot);
        self.backend.store(snapshot).await?;
        Ok(out)
    }
}

#[async_trait]
impl<B: SnapshotBackend> MetadataStore for SnapshotStore<B> {
    async fn register_instance(&self, record: InstanceRecord) -> Result<()> {
        debug!(instance = %record.name, addr = %record.address, port = record.port, "registering instance");
        self.write(|s| {
            s.instances.insert(record.name.clone(), record);
        })
        .await
    }

    async fn instance(&self, name: &str) -> Result<Option<InstanceRecord>> {
        self.read(|s| s.instances.get(name).cloned()).await
    }

    async fn remove_instance(&self, name: &str) -> Result<bool> {
        self.write(|s| s.instances.remove(name).is_some()).await
    }

    async fn register_vertex(&self, record: VertexRecord) -> Result<()> {
        self.write(|s| {
            s.vertices.insert(record.vertex_name.clone(), record);
        })
        .await
    }

    async fn vertex(&self, name: &str) -> Result<Option<VertexRecord>> {
        self.read(|s| s.vertices.get(name).cloned()).await
    }

    async fn resolve_vertex(&self, name: &str) -> Result<Option<VertexLocation>> {
        self.read(|s| {
            let vertex = s.vertices.get(name)?;
            let instance = s.instances.get(&vertex.instance_name)?;
            Some(VertexLocation {
                instance: instance.name.clone(),
                address: instance.address.clone(),
                port: instance.port,
            })
        })
        .await
    }

    async fn vertices_on(&self, instance: &str) -> Result<Vec<VertexRecord>> {
        self.read(|s| {
            s.vertices
                .values()
                .filter(|v| v.instance_name == instance)
                .cloned()
                .collect()
        })
        .await
    }

    async fn remove_vertex(&self, name: &str) -> Result<bool> {
        self.write(|s| s.vertices.remove(name).is_some()).await
    }

    async fn register_endpoints(
        &self,
        vertex: &str,
        endpoints: Vec<EndpointIdentity>,
    ) -> Result<()> {
        self.write(|s| {
            s.endpoints.insert(vertex.to_string(), endpoints);
        })
        .await
    }

    async fn endpoints(&self, vertex: &str) -> Result<Vec<EndpointIdentity>> {
        self.read(|s| s.endpoints.get(vertex).cloned().unwrap_or_default())
            .await
    }

    async fn remove_endpoints(&self, vertex: &str) -> Result<()> {
        self.write(|s| {
            s.endpoints.remove(vertex);
        })
        .await
    }

    async fn add_connection(&self, key: &ConnectionKey) -> Result<bool> {
        self.write(|s| s.connections.insert(key.clone())).await
    }

    async fn remove_connection(&self, key: &ConnectionKey) -> Result<bool> {
        self.write(|s| s.connections.remove(key)).await
    }

    async fn connection_exists(&self, key: &ConnectionKey) -> Result<bool> {
        self.read(|s| s.connections.contains(key)).await
    }

    async fn connections_from(&self, vertex: &str) -> Result<Vec<ConnectionKey>> {
        self.read(|s| {
            s.connections
                .iter()
                .filter(|k| k.from_vertex == vertex)
                .cloned()
                .collect()
        })
        .await
    }

    async fn connections_to(&self, vertex: &str) -> Result<Vec<ConnectionKey>> {
        self.read(|s| {
            s.connections
                .iter()
                .filter(|k| k.to_vertex == vertex)
                .cloned()
                .collect()
        })
        .await
    }

    async fn connections(&self) -> Result<Vec<ConnectionKey>> {
        self.read(|s| s.connections.iter().cloned().collect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointDirection, EndpointMode};

    fn key(from: &str, to: &str) -> ConnectionKey {
        ConnectionKey::new(from, "out", to, "in")
    }

    async fn populate(store: &dyn MetadataStore) {
        store
            .register_instance(InstanceRecord {
                name: "w1".into(),
                address: "127.0.0.1".into(),
                port: 7001,
            })
            .await
            .unwrap();
        for (vertex, instance) in [("a", "w1"), ("b", "w1"), ("c", "w2")] {
            store
                .register_vertex(VertexRecord {
                    vertex_name: vertex.into(),
                    instance_name: instance.into(),
                    definition: "relay".into(),
                    parameter: vec![1, 2],
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_resolve_requires_instance() {
        let store = InMemoryMetadataStore::new();
        populate(&store).await;
        let loc = store.resolve_vertex("a").await.unwrap().unwrap();
        assert_eq!(loc.instance, "w1");
        assert_eq!(loc.port, 7001);
        assert!(store.resolve_vertex("c").await.unwrap().is_none());
        assert!(store.resolve_vertex("zz").await.unwrap().is_none());
        assert_eq!(store.vertices_on("w1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_desired_graph_queries() {
        let store = InMemoryMetadataStore::new();
        assert!(store.add_connection(&key("a", "b")).await.unwrap());
        assert!(!store.add_connection(&key("a", "b")).await.unwrap());
        store.add_connection(&key("a", "c")).await.unwrap();
        store.add_connection(&key("c", "b")).await.unwrap();

        assert_eq!(store.connections_from("a").await.unwrap().len(), 2);
        assert_eq!(store.connections_to("b").await.unwrap().len(), 2);
        assert!(store.connection_exists(&key("c", "b")).await.unwrap());
        assert!(store.remove_connection(&key("c", "b")).await.unwrap());
        assert!(!store.remove_connection(&key("c", "b")).await.unwrap());
        assert_eq!(store.connections().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_endpoints_replace_and_remove() {
        let store = InMemoryMetadataStore::new();
        let id = EndpointIdentity {
            vertex_name: "a".into(),
            endpoint_name: "out".into(),
            direction: EndpointDirection::Output,
            mode: EndpointMode::Async,
            fusable: true,
        };
        store.register_endpoints("a", vec![id.clone()]).await.unwrap();
        assert_eq!(store.endpoints("a").await.unwrap(), vec![id]);
        store.remove_endpoints("a").await.unwrap();
        assert!(store.endpoints("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let writer = FileMetadataStore::open(&path);
        let reader = FileMetadataStore::open(&path);

        assert!(reader.connections().await.unwrap().is_empty());
        populate(&writer).await;
        writer.add_connection(&key("a", "b")).await.unwrap();

        assert!(reader.connection_exists(&key("a", "b")).await.unwrap());
        let record = reader.vertex("a").await.unwrap().unwrap();
        assert_eq!(record.parameter, vec![1, 2]);
        assert!(reader.remove_instance("w1").await.unwrap());
        assert!(writer.resolve_vertex("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = FileMetadataStore::open(&path);
        let err = store.connections().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Metadata { .. }));
    }
}
