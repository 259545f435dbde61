//! `PeerDirectory`: DNS-based peer discovery. Resolves the `A` records of
//! `tasks.<SERVICE_NAME>`, the Docker Swarm "tasks" subdomain, and
//! opportunistically reverse-resolves a `PTR` record per peer for
//! diagnostics. PTR failures are swallowed; only the `A` lookup failing is
//! reported to the caller. A startup-time failure of that lookup does not
//! abort the process; the caller treats an empty peer set as "cluster of
//! one" and retries on the next monitoring cycle.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub ip: String,
    pub hostname: Option<String>,
}

#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// The current membership, as discovered right now. Does not cache;
    /// callers wanting stability across calls within one monitoring cycle
    /// should capture the result once.
    async fn discover(&self) -> Result<Vec<ContainerInfo>>;

    /// This node's own address, as it would appear in a peer's discovery.
    async fn own_ip(&self) -> Result<String>;
}

pub struct DnsPeerDirectory {
    resolver: TokioAsyncResolver,
    service_name: String,
    own_ip: String,
}

impl DnsPeerDirectory {
    pub fn new(service_name: String, own_ip: String) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(DnsPeerDirectory {
            resolver,
            service_name,
            own_ip,
        })
    }

    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(answer) => answer.iter().next().map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                tracing::debug!(%ip, error = %e, "ptr lookup failed, continuing without hostname");
                None
            }
        }
    }
}

#[async_trait]
impl PeerDirectory for DnsPeerDirectory {
    async fn discover(&self) -> Result<Vec<ContainerInfo>> {
        let record = format!("tasks.{}", self.service_name);
        let lookup = match self.resolver.lookup_ip(&record).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(%record, error = %e, "dns resolution failed, proceeding with empty peer set");
                return Ok(vec![]);
            }
        };

        let mut out = vec![];
        for ip in lookup.iter() {
            let hostname = self.reverse_lookup(ip).await;
            out.push(ContainerInfo {
                ip: ip.to_string(),
                hostname,
            });
        }
        Ok(out)
    }

    async fn own_ip(&self) -> Result<String> {
        Ok(self.own_ip.clone())
    }
}

/// Stand-in directory for tests and single-node operation: returns a fixed
/// membership list without touching a real resolver. The integration-test
/// harness in `tests/` layers a mutable version of this over a shared
/// `Vec<ContainerInfo>` to simulate nodes joining/leaving.
pub struct StaticPeerDirectory {
    pub members: Vec<ContainerInfo>,
    pub own_ip: String,
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn discover(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.members.clone())
    }

    async fn own_ip(&self) -> Result<String> {
        Ok(self.own_ip.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_returns_fixed_membership() {
        let dir = StaticPeerDirectory {
            members: vec![ContainerInfo {
                ip: "10.0.0.2".to_string(),
                hostname: None,
            }],
            own_ip: "10.0.0.1".to_string(),
        };
        assert_eq!(dir.discover().await.unwrap().len(), 1);
        assert_eq!(dir.own_ip().await.unwrap(), "10.0.0.1");
    }
}
