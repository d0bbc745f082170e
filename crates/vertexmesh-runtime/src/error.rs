//! Error types for the runtime.

use thiserror::Error;
use vertexmesh_transport::TransportError;

/// Errors raised by vertex hosting, the metadata store and configuration.
///
/// Connection attempts never surface these: they are mapped to a
/// [`vertexmesh_transport::ConnectStatus`] at the handshake boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The metadata store could not serve a request.
    #[error("metadata store error: {reason}")]
    Metadata {
        /// What went wrong.
        reason: String,
    },

    /// No factory is registered under the definition name.
    #[error("unknown vertex definition: {definition}")]
    UnknownDefinition {
        /// Requested definition.
        definition: String,
    },

    /// A vertex with this name is already hosted here.
    #[error("vertex {vertex} is already loaded")]
    VertexAlreadyLoaded {
        /// Vertex name.
        vertex: String,
    },

    /// The vertex rejected its parameter or failed to set up.
    #[error("vertex {vertex} failed to initialize: {reason}")]
    VertexInit {
        /// Vertex name.
        vertex: String,
        /// Failure detail.
        reason: String,
    },

    /// Two endpoints of the same direction share a name.
    #[error("vertex {vertex} already has an endpoint named {endpoint}")]
    DuplicateEndpoint {
        /// Vertex name.
        vertex: String,
        /// Endpoint name.
        endpoint: String,
    },

    /// The configuration is inconsistent.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Shorthand for [`RuntimeError::Metadata`].
    pub fn metadata(reason: impl Into<String>) -> Self {
        RuntimeError::Metadata {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used across the runtime crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;
