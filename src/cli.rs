//! Command-line interface.
//!
//! One binary, three roles. Every setting doubles as an environment
//! variable so containerized deployments configure the service without
//! flags: `SERVICE_HOST`, `SERVICE_PORT`, `BACKEND_URL`, `GATEWAY_URL`,
//! `SERVICE_NAME`, `NODE_TYPE`.

use clap::{Parser, Subcommand};

/// Service role to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Role {
    /// Connection-pool frontend: scan, zip-info and ranged reads over
    /// HTTP and WebSocket.
    Gateway,
    /// Differential scanner: discovers archives and submits member rows.
    Scanner,
    /// Parser worker: pulls leased rows, fetches and decodes members.
    Worker,
}

#[derive(Debug, Parser)]
#[command(name = "ndspipe")]
#[command(version)]
#[command(about = "MRO/MDT archive ingestion pipeline over FTP/SFTP network data servers")]
pub struct Cli {
    #[command(subcommand)]
    pub role: Role,

    /// Host to bind (gateway) and advertise in node registration.
    #[arg(long, env = "SERVICE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind (gateway) and advertise in node registration.
    #[arg(long, env = "SERVICE_PORT", default_value_t = 10002)]
    pub port: u16,

    /// Base URL of the metadata-store service.
    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: String,

    /// Base URL of the gateway; required by scanner and worker.
    #[arg(long, env = "GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Instance name used in node registration.
    #[arg(long, env = "SERVICE_NAME", default_value = "ndspipe")]
    pub service_name: String,

    /// Node type reported to the backend; defaults per role.
    #[arg(long, env = "NODE_TYPE")]
    pub node_type: Option<String>,

    /// Analytics ingest URL; decoded rows are discarded (counted and
    /// logged) when absent.
    #[arg(long, env = "ANALYTICS_URL")]
    pub analytics_url: Option<String>,

    /// Concurrent worker units; defaults to 2 × available parallelism − 1.
    #[arg(long, env = "WORKER_CAPACITY")]
    pub capacity: Option<usize>,
}

impl Cli {
    /// Node type reported at registration, per role unless overridden.
    pub fn node_type(&self) -> &str {
        if let Some(node_type) = &self.node_type {
            return node_type;
        }
        match self.role {
            Role::Gateway => "NDSGateway",
            Role::Scanner => "NDSScanner",
            Role::Worker => "NDSParser",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_invocation_parses() {
        let cli = Cli::parse_from([
            "ndspipe",
            "--backend-url",
            "http://backend:10001",
            "--gateway-url",
            "http://gateway:10002",
            "scanner",
        ]);
        assert_eq!(cli.role, Role::Scanner);
        assert_eq!(cli.node_type(), "NDSScanner");
        assert_eq!(cli.port, 10002);
    }

    #[test]
    fn node_type_override_wins() {
        let cli = Cli::parse_from([
            "ndspipe",
            "--backend-url",
            "http://backend:10001",
            "--node-type",
            "CustomNode",
            "gateway",
        ]);
        assert_eq!(cli.node_type(), "CustomNode");
    }
}
