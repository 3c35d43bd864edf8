//! TCP listener with connection backpressure.
//!
//! A semaphore bounds the number of live client connections. When the limit
//! is reached, accepting waits until a connection finishes.

use super::error::ProxyError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// A bounded TCP listener.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind `addr`, allowing at most `max_connections` live connections.
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, ProxyError> {
        let inner = TcpListener::bind(addr).await.map_err(|source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let local_addr = inner.local_addr()?;
        info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a connection once a slot is free.
    ///
    /// The returned permit must live as long as the connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ProxyError> {
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Shutdown)?;

        let (stream, peer) = self.inner.accept().await?;

        debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.inner.local_addr()?)
    }

    /// Currently free connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Configured connection limit.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot, released when dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
