//! Proxy service lifecycle.
//!
//! The service owns:
//! - The certificate authority (root created on start, uninstalled on stop)
//! - The cache store (survives stop/start)
//! - While running: the acceptor task, the cache sweeper, and a shutdown
//!   channel shared by both
//!
//! # Architecture
//!
//! One acceptor loop hands each accepted TCP connection to its own Tokio
//! task. A semaphore in the listener bounds the number of live
//! connections. Stopping closes the listening socket and aborts in-flight
//! connections; clients observe an unexpected close.
//!
//! # Example
//!
//! ```ignore
//! use mitm_cache_proxy::proxy::{ProxyConfig, ProxyService};
//!
//! let mut service = ProxyService::new(ProxyConfig::default());
//! let addr = service.start().await?;
//! // ...
//! service.stop().await?;
//! ```

use super::connection::{handle_connection, ConnectionContext, Diagnostics};
use super::error::ProxyError;
use super::listener::Listener;
use super::tls::create_tls_connector;
use crate::ca::{CaSettings, CertificateAuthority};
use crate::cache::{spawn_sweeper, CacheStore, DEFAULT_SWEEP_INTERVAL};
use crate::config::{Config, ConfigError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8081;

/// Default bound on live client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 512;

/// Pause after a failed accept (e.g. descriptor exhaustion) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime settings for the proxy service.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Maximum live client connections.
    pub max_connections: usize,
    /// Diagnostic dump switches.
    pub diagnostics: Diagnostics,
    /// Whether responses are cached.
    pub cache_enabled: bool,
    /// Interval between cache sweeps.
    pub sweep_interval: Duration,
    /// Certificate authority settings.
    pub ca: CaSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            diagnostics: Diagnostics::default(),
            cache_enabled: true,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ca: CaSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Derive runtime settings from a configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration holds an invalid value.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            listen_addr: config.validate()?,
            max_connections: config.proxy.max_connections,
            diagnostics: Diagnostics {
                dump_headers: config.diagnostics.dump_headers,
                dump_post_data: config.diagnostics.dump_post_data,
                dump_response_data: config.diagnostics.dump_response_data,
            },
            cache_enabled: config.cache.enabled,
            sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
            ca: CaSettings {
                cert_dir: config.ca.cert_dir.clone(),
                validity_days: config.ca.validity_days,
            },
        })
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

/// The intercepting, caching proxy.
pub struct ProxyService {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    cache: Arc<CacheStore>,
    running: Option<Running>,
}

impl ProxyService {
    /// Create a stopped service.
    pub fn new(config: ProxyConfig) -> Self {
        let ca = Arc::new(CertificateAuthority::new(config.ca.clone()));
        Self {
            config,
            ca,
            cache: Arc::new(CacheStore::new()),
            running: None,
        }
    }

    /// Install the root certificate, bind, and begin accepting and sweeping.
    ///
    /// Returns the bound address. Failure leaves the service stopped with
    /// nothing installed.
    pub async fn start(&mut self) -> Result<SocketAddr, ProxyError> {
        if self.running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        self.ca.ensure_root()?;

        let listener = match Listener::bind(self.config.listen_addr, self.config.max_connections)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.ca.uninstall();
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.ca.uninstall();
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = ConnectionContext {
            ca: self.ca.clone(),
            cache: self.config.cache_enabled.then(|| self.cache.clone()),
            connector: create_tls_connector(),
            diagnostics: self.config.diagnostics,
            output_lock: Arc::new(Mutex::new(())),
        };

        let acceptor = tokio::spawn(accept_loop(listener, ctx, shutdown_rx.clone()));
        let sweeper = self.config.cache_enabled.then(|| {
            spawn_sweeper(
                self.cache.clone(),
                self.config.sweep_interval,
                shutdown_rx,
            )
        });

        info!("Proxy listening on {}", local_addr);
        if let Some(path) = self.ca.root_cert_path() {
            info!("Root certificate installed at {}", path.display());
        }

        self.running = Some(Running {
            shutdown_tx,
            acceptor,
            sweeper,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting, stop sweeping, and uninstall every certificate.
    ///
    /// In-flight connections are abandoned.
    pub async fn stop(&mut self) -> Result<(), ProxyError> {
        let running = self.running.take().ok_or(ProxyError::NotRunning)?;

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.acceptor.await {
            warn!("Acceptor task ended abnormally: {}", e);
        }
        if let Some(sweeper) = running.sweeper {
            if let Err(e) = sweeper.await {
                warn!("Cache sweeper ended abnormally: {}", e);
            }
        }

        self.ca.uninstall();
        info!("Proxy on {} stopped", running.local_addr);
        Ok(())
    }

    /// Alias of [`stop`](Self::stop).
    pub async fn pause(&mut self) -> Result<(), ProxyError> {
        self.stop().await
    }

    /// Alias of [`start`](Self::start).
    pub async fn resume(&mut self) -> Result<SocketAddr, ProxyError> {
        self.start().await
    }

    /// Whether the service is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// The response cache.
    pub fn cache(&self) -> Arc<CacheStore> {
        self.cache.clone()
    }

    /// The certificate authority.
    pub fn certificate_authority(&self) -> Arc<CertificateAuthority> {
        self.ca.clone()
    }
}

/// Accept connections until shutdown, then abort the ones still open.
async fn accept_loop(
    listener: Listener,
    ctx: ConnectionContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer, permit)) => {
                        let ctx = ctx.clone();
                        let span = tracing::info_span!(
                            "connection",
                            id = %Uuid::new_v4(),
                            peer = %peer
                        );
                        connections.spawn(
                            async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, peer, ctx).await {
                                    if e.is_disconnect() {
                                        debug!("Connection ended: {}", e);
                                    } else {
                                        error!("Connection error: {}", e);
                                    }
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        if back_off(&mut shutdown_rx).await {
                            info!("Proxy shutting down");
                            break;
                        }
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy shutting down");
                    break;
                }
            }
        }
    }

    // Dropping the listener closes the socket before in-flight work is cut.
    drop(listener);
    connections.shutdown().await;
}

/// Wait out [`ACCEPT_ERROR_BACKOFF`]. Returns true if shutdown was requested
/// meanwhile.
async fn back_off(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

impl Drop for ProxyService {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
            running.acceptor.abort();
            if let Some(sweeper) = running.sweeper {
                sweeper.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8081".parse().unwrap());
        assert!(config.cache_enabled);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.proxy.listen_port = 9090;
        config.cache.enabled = false;
        config.diagnostics.dump_headers = true;

        let proxy = ProxyConfig::from_config(&config).unwrap();
        assert_eq!(proxy.listen_addr.port(), 9090);
        assert!(!proxy.cache_enabled);
        assert!(proxy.diagnostics.dump_headers);
    }

    #[test]
    fn test_from_config_rejects_bad_address() {
        let mut config = Config::default();
        config.proxy.listen_address = "localhost:80".to_string();
        assert!(ProxyConfig::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut service = ProxyService::new(test_config());
        assert!(!service.is_running());

        let addr = service.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(service.local_addr(), Some(addr));
        assert!(service.certificate_authority().root_cert_pem().is_some());

        service.stop().await.unwrap();
        assert!(!service.is_running());
        assert!(service.certificate_authority().root_cert_pem().is_none());

        // Listening socket is closed.
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_double_start_and_stop_rejected() {
        let mut service = ProxyService::new(test_config());
        assert!(matches!(service.stop().await, Err(ProxyError::NotRunning)));

        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(ProxyError::AlreadyRunning)
        ));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let mut service = ProxyService::new(test_config());
        service.start().await.unwrap();
        let cache = service.cache();

        service.pause().await.unwrap();
        assert!(!service.is_running());

        service.resume().await.unwrap();
        assert!(service.is_running());
        assert!(Arc::ptr_eq(&cache, &service.cache()));
        service.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_off_waits_before_retry() {
        let (_tx, mut rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        assert!(!back_off(&mut rx).await);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_off_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { back_off(&mut rx).await });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_nothing_installed() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut service = ProxyService::new(ProxyConfig {
            listen_addr: occupied.local_addr().unwrap(),
            ..Default::default()
        });

        let result = service.start().await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));
        assert!(!service.is_running());
        assert!(service.certificate_authority().root_cert_pem().is_none());
    }
}
