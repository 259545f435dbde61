//! CLI entry point for a `chorus-node` process: parses the configuration
//! options, opens a directory lock on the data directory, constructs a
//! [`Node`], and runs it until interrupted.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use chorus::config::NodeConfig;
use chorus::errors::Result;
use chorus::node::Node;
use chorus::peer_directory::{DnsPeerDirectory, PeerDirectory};
use chorus::peer_rpc_http::{router, HttpPeerTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NodeConfig::parse();

    let own_ip = local_ip_best_effort();
    tracing::info!(node = %own_ip, dir = ?config.dir, service = %config.service_name, "starting chorus-node");

    let peer_directory: Arc<dyn PeerDirectory> = Arc::new(DnsPeerDirectory::new(config.service_name.clone(), own_ip.clone())?);
    let transport: Arc<dyn chorus::peer_rpc::PeerTransport> = Arc::new(HttpPeerTransport::new(config.rpc_timeout(), config.port));

    let port = config.port;
    let node = Node::new(own_ip, config, transport, peer_directory).await?;
    node.start();

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let app = router(node.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.abort();
    node.stop().await;

    Ok(())
}

/// Best-effort local IP discovery for this node's own identity. In a real
/// Docker Swarm deployment the container's routable IP is what peers see
/// via `tasks.<SERVICE_NAME>`; this walks local interfaces and falls back
/// to loopback for single-node/dev runs.
fn local_ip_best_effort() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
