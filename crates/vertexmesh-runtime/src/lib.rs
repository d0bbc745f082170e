#![warn(missing_docs)]

//! VertexMesh runtime: hosts vertices, establishes endpoint connections
//! between workers, pumps data over them and keeps the live graph
//! reconciled with the desired one.

pub mod builtin;
pub mod cli;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod metastore;
pub mod pump;
pub mod reconcile;
pub mod registry;
pub mod services;
pub mod vertex;
pub mod worker;

pub use client::Client;
pub use config::{BindAddr, TlsFiles, WorkerConfig};
pub use endpoint::{
    AsyncInputEndpoint, AsyncOutputEndpoint, EndpointDirection, EndpointIdentity, EndpointMode,
    EndpointSet, FusableOutputEndpoint, InputEndpoint, OutputEndpoint, SyncInputEndpoint,
    SyncOutputEndpoint,
};
pub use error::{Result, RuntimeError};
pub use metastore::{
    FileMetadataStore, InMemoryMetadataStore, InstanceRecord, MetadataSnapshot, MetadataStore,
    VertexLocation, VertexRecord,
};
pub use reconcile::{RetryOutcome, RetryPolicy};
pub use registry::{ConnectionRegistry, DialGuard, Registration, RegistryMap};
pub use services::{ServiceOptions, WorkerServices};
pub use vertex::{HostedVertex, Vertex, VertexCatalog, VertexTable};
pub use worker::Worker;
