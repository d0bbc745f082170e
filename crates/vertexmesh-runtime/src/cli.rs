//! `vmesh` command line: runs a worker or edits the desired graph.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use vertexmesh_transport::{ConnectStatus, ConnectionKey, Direction};

use crate::builtin;
use crate::client::Client;
use crate::config::WorkerConfig;
use crate::metastore::{FileMetadataStore, MetadataStore};
use crate::worker::Worker;

/// Top-level arguments.
#[derive(Debug, Parser)]
#[command(name = "vmesh")]
#[command(about = "VertexMesh worker and control CLI", long_about = None)]
pub struct Cli {
    /// Worker configuration file (`.toml` or `.json`).
    #[arg(short, long, env = "VMESH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Metadata file; overrides `metadata_path` from the configuration.
    #[arg(short, long, env = "VMESH_METADATA", global = true)]
    pub metadata: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a worker until interrupted.
    Worker,
    /// Ask an instance to host a vertex.
    Load {
        /// Target instance.
        #[arg(short, long)]
        instance: String,
        /// Vertex name.
        #[arg(short, long)]
        vertex: String,
        /// Definition to build it from.
        #[arg(short, long)]
        definition: String,
        /// Construction parameter, passed as UTF-8 bytes.
        #[arg(short, long, default_value = "")]
        param: String,
    },
    /// Add a desired connection and ask its driving worker to establish it.
    Connect {
        /// Output vertex.
        from: String,
        /// Output endpoint.
        from_endpoint: String,
        /// Input vertex.
        to: String,
        /// Input endpoint.
        to_endpoint: String,
        /// Let the input side drive the handshake.
        #[arg(short, long)]
        reverse: bool,
    },
    /// Remove a desired connection and stop its pumps.
    Disconnect {
        /// Output vertex.
        from: String,
        /// Output endpoint.
        from_endpoint: String,
        /// Input vertex.
        to: String,
        /// Input endpoint.
        to_endpoint: String,
    },
    /// Print instances, vertices and desired connections.
    Status,
}

impl Cli {
    /// Configuration named by `--config`, or the defaults.
    pub fn load_config(&self) -> Result<WorkerConfig> {
        match &self.config {
            Some(path) => WorkerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(WorkerConfig::default()),
        }
    }

    fn metadata_path(&self, config: &WorkerConfig) -> PathBuf {
        self.metadata
            .clone()
            .unwrap_or_else(|| config.metadata_path.clone())
    }

    /// Executes the subcommand.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let store = Arc::new(FileMetadataStore::open(self.metadata_path(&config)));
        match self.command {
            Command::Worker => run_worker(&config, store).await,
            Command::Status => status(&store).await,
            Command::Load {
                ref instance,
                ref vertex,
                ref definition,
                ref param,
            } => {
                let client = Client::new(store.clone(), config.service_options()?);
                let status = client
                    .load_vertex(instance, vertex, definition, param.as_bytes())
                    .await?;
                if status != ConnectStatus::Success {
                    bail!("loading {} on {} failed: {}", vertex, instance, status);
                }
                println!("loaded {} ({}) on {}", vertex, definition, instance);
                Ok(())
            }
            Command::Connect {
                ref from,
                ref from_endpoint,
                ref to,
                ref to_endpoint,
                reverse,
            } => {
                let client = Client::new(store.clone(), config.service_options()?);
                let key = ConnectionKey::new(from, from_endpoint, to, to_endpoint);
                let direction = if reverse {
                    Direction::Reverse
                } else {
                    Direction::Forward
                };
                let status = client.connect(&key, direction).await?;
                if status == ConnectStatus::Success {
                    println!("connected {}", key);
                } else {
                    println!("{} recorded, not yet live: {}", key, status);
                }
                Ok(())
            }
            Command::Disconnect {
                ref from,
                ref from_endpoint,
                ref to,
                ref to_endpoint,
            } => {
                let client = Client::new(store.clone(), config.service_options()?);
                let key = ConnectionKey::new(from, from_endpoint, to, to_endpoint);
                if client.disconnect(&key).await? {
                    println!("disconnected {}", key);
                } else {
                    println!("{} was not desired", key);
                }
                Ok(())
            }
        }
    }
}

async fn run_worker(config: &WorkerConfig, store: Arc<FileMetadataStore>) -> Result<()> {
    let worker = Worker::start(config, store, builtin::catalog()).await?;
    tracing::info!(
        instance = %worker.instance_name(),
        addr = %worker.local_addr(),
        "press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;
    worker.shutdown().await?;
    Ok(())
}

async fn status(store: &FileMetadataStore) -> Result<()> {
    let snapshot = store.snapshot().await?;
    println!("Instances:");
    for instance in snapshot.instances.values() {
        println!("  {:<20} {}:{}", instance.name, instance.address, instance.port);
    }
    println!("Vertices:");
    for vertex in snapshot.vertices.values() {
        let endpoints = snapshot
            .endpoints
            .get(&vertex.vertex_name)
            .map(|list| list.len())
            .unwrap_or(0);
        println!(
            "  {:<20} {:<12} on {:<16} endpoints={}",
            vertex.vertex_name, vertex.definition, vertex.instance_name, endpoints
        );
    }
    println!("Connections:");
    for key in store.connections().await? {
        println!("  {}", key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_connect_reverse() {
        let cli = Cli::parse_from(["vmesh", "connect", "a", "out", "b", "in", "--reverse"]);
        match cli.command {
            Command::Connect {
                from,
                to_endpoint,
                reverse,
                ..
            } => {
                assert_eq!(from, "a");
                assert_eq!(to_endpoint, "in");
                assert!(reverse);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_load_with_global_metadata() {
        let cli = Cli::parse_from([
            "vmesh",
            "load",
            "--instance",
            "w1",
            "--vertex",
            "src",
            "--definition",
            "counter",
            "--param",
            "3",
            "--metadata",
            "/tmp/meta.json",
        ]);
        assert_eq!(cli.metadata, Some(PathBuf::from("/tmp/meta.json")));
        assert!(matches!(cli.command, Command::Load { ref param, .. } if param == "3"));
    }

    #[test]
    fn test_parse_worker_with_config() {
        let cli = Cli::parse_from(["vmesh", "--config", "w.toml", "--json-logs", "worker"]);
        assert!(matches!(cli.command, Command::Worker));
        assert!(cli.json_logs);
        assert_eq!(cli.config, Some(PathBuf::from("w.toml")));
    }

    #[test]
    fn test_metadata_flag_overrides_config() {
        let cli = Cli::parse_from(["vmesh", "--metadata", "m.json", "status"]);
        let config = WorkerConfig::default();
        assert_eq!(cli.metadata_path(&config), PathBuf::from("m.json"));
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_edits_file_store() {
        let dir = TempDir::new().unwrap();
        let meta = dir.path().join("meta.json");
        let meta_arg = meta.to_str().unwrap();

        let cli = Cli::parse_from(["vmesh", "-m", meta_arg, "connect", "a", "out", "b", "in"]);
        cli.run().await.unwrap();
        let store = FileMetadataStore::open(&meta);
        let key = ConnectionKey::new("a", "out", "b", "in");
        assert!(store.connection_exists(&key).await.unwrap());

        let cli = Cli::parse_from(["vmesh", "-m", meta_arg, "status"]);
        cli.run().await.unwrap();

        let cli = Cli::parse_from(["vmesh", "-m", meta_arg, "disconnect", "a", "out", "b", "in"]);
        cli.run().await.unwrap();
        assert!(!store.connection_exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_on_unknown_instance_fails() {
        let dir = TempDir::new().unwrap();
        let meta = dir.path().join("meta.json");
        let cli = Cli::parse_from([
            "vmesh",
            "-m",
            meta.to_str().unwrap(),
            "load",
            "-i",
            "ghost",
            "-v",
            "x",
            "-d",
            "echo",
        ]);
        assert!(cli.run().await.is_err());
    }
}
