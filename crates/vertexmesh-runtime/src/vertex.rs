//! Vertex definitions and the table of vertices hosted by a worker.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use vertexmesh_transport::ConnectStatus;

use crate::endpoint::{EndpointSet, InputEndpoint, OutputEndpoint};
use crate::error::{Result, RuntimeError};

/// A unit of computation that exposes named endpoints.
pub trait Vertex: Send + Sync + 'static {
    /// Applies the construction parameter and registers endpoints.
    fn initialize(&mut self, parameter: &[u8], endpoints: &mut EndpointSet) -> Result<()>;

    /// Releases resources when the hosting worker unloads the vertex.
    fn dispose(&self) {}
}

/// Builds a fresh, uninitialized vertex.
pub type VertexFactory = Arc<dyn Fn() -> Box<dyn Vertex> + Send + Sync>;

/// Definitions a worker can instantiate, keyed by definition name.
#[derive(Clone, Default)]
pub struct VertexCatalog {
    factories: HashMap<String, VertexFactory>,
}

impl std::fmt::Debug for VertexCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexCatalog")
            .field("definitions", &self.definitions())
            .finish()
    }
}

impl VertexCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `definition`, replacing any previous one.
    pub fn register<F, V>(&mut self, definition: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> V + Send + Sync + 'static,
        V: Vertex,
    {
        self.factories.insert(
            definition.into(),
            Arc::new(move || Box::new(factory()) as Box<dyn Vertex>),
        );
        self
    }

    /// Whether `definition` is known.
    pub fn contains(&self, definition: &str) -> bool {
        self.factories.contains_key(definition)
    }

    /// Sorted definition names.
    pub fn definitions(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    fn instantiate(&self, definition: &str) -> Result<Box<dyn Vertex>> {
        self.factories
            .get(definition)
            .map(|factory| factory())
            .ok_or_else(|| RuntimeError::UnknownDefinition {
                definition: definition.to_string(),
            })
    }
}

/// A vertex instance and its registered endpoints.
pub struct HostedVertex {
    name: String,
    definition: String,
    parameter: Vec<u8>,
    vertex: Box<dyn Vertex>,
    endpoints: EndpointSet,
}

impl std::fmt::Debug for HostedVertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedVertex")
            .field("name", &self.name)
            .field("definition", &self.definition)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl HostedVertex {
    /// Instantiates `definition` from `catalog` and runs its initializer.
    pub fn create(
        catalog: &VertexCatalog,
        name: &str,
        definition: &str,
        parameter: &[u8],
    ) -> Result<Self> {
        let mut vertex = catalog.instantiate(definition)?;
        let mut endpoints = EndpointSet::new(name);
        vertex
            .initialize(parameter, &mut endpoints)
            .map_err(|e| match e {
                e @ RuntimeError::DuplicateEndpoint { .. } => e,
                other => RuntimeError::VertexInit {
                    vertex: name.to_string(),
                    reason: other.to_string(),
                },
            })?;
        Ok(Self {
            name: name.to_string(),
            definition: definition.to_string(),
            parameter: parameter.to_vec(),
            vertex,
            endpoints,
        })
    }

    /// Vertex name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Definition the vertex was built from.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Construction parameter.
    pub fn parameter(&self) -> &[u8] {
        &self.parameter
    }

    /// Registered endpoints.
    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }
}

/// Vertices hosted by this worker, by name.
#[derive(Debug, Default)]
pub struct VertexTable {
    vertices: DashMap<String, Arc<HostedVertex>>,
}

impl VertexTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and hosts a vertex. Fails if the name is already hosted.
    pub fn load(
        &self,
        catalog: &VertexCatalog,
        name: &str,
        definition: &str,
        parameter: &[u8],
    ) -> Result<Arc<HostedVertex>> {
        if self.vertices.contains_key(name) {
            return Err(RuntimeError::VertexAlreadyLoaded {
                vertex: name.to_string(),
            });
        }
        let hosted = Arc::new(HostedVertex::create(catalog, name, definition, parameter)?);
        match self.vertices.entry(name.to_string()) {
            Entry::Occupied(_) => {
                hosted.vertex.dispose();
                Err(RuntimeError::VertexAlreadyLoaded {
                    vertex: name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(hosted.clone());
                info!(vertex = %name, definition = %definition, "vertex loaded");
                Ok(hosted)
            }
        }
    }

    /// Looks up a hosted vertex.
    pub fn get(&self, name: &str) -> Option<Arc<HostedVertex>> {
        self.vertices.get(name).map(|v| v.value().clone())
    }

    /// Whether `name` is hosted here.
    pub fn contains(&self, name: &str) -> bool {
        self.vertices.contains_key(name)
    }

    /// Resolves an input endpoint, mapping misses to the wire status.
    pub fn input(
        &self,
        vertex: &str,
        endpoint: &str,
    ) -> std::result::Result<InputEndpoint, ConnectStatus> {
        let hosted = self.get(vertex).ok_or(ConnectStatus::VertexNotFound)?;
        hosted
            .endpoints
            .input(endpoint)
            .cloned()
            .ok_or(ConnectStatus::VertexEndpointNotFound)
    }

    /// Resolves an output endpoint, mapping misses to the wire status.
    pub fn output(
        &self,
        vertex: &str,
        endpoint: &str,
    ) -> std::result::Result<OutputEndpoint, ConnectStatus> {
        let hosted = self.get(vertex).ok_or(ConnectStatus::VertexNotFound)?;
        hosted
            .endpoints
            .output(endpoint)
            .cloned()
            .ok_or(ConnectStatus::VertexEndpointNotFound)
    }

    /// Unhosts a vertex and disposes it.
    pub fn unload(&self, name: &str) -> Option<Arc<HostedVertex>> {
        let (_, hosted) = self.vertices.remove(name)?;
        hosted.vertex.dispose();
        debug!(vertex = %name, "vertex unloaded");
        Some(hosted)
    }

    /// Sorted names of hosted vertices.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.vertices.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of hosted vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Whether nothing is hosted.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Unloads every vertex, returning what was hosted.
    pub fn dispose_all(&self) -> Vec<Arc<HostedVertex>> {
        self.names()
            .iter()
            .filter_map(|name| self.unload(name))
            .collect()
    }
}
