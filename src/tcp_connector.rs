use crate::traits::TcpConnector;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::debug;
use tokio::net::{TcpStream, lookup_host};

/// Production implementation of TcpConnector that creates real TCP connections
#[derive(Debug)]
pub struct RealTcpConnector;

#[async_trait]
impl TcpConnector for RealTcpConnector {
    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let resolved = lookup_host(addr)
            .await
            .map_err(|e| anyhow!("failed to resolve {}: {}", addr, e))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", addr))?;

        debug!("Dialing peer {} at {}", addr, resolved);
        let stream = TcpStream::connect(resolved).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
