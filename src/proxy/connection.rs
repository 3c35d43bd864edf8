//! Per-connection request handling.
//!
//! One accepted client connection carries exactly one exchange:
//!
//! 1. Read the request line
//! 2. For `CONNECT`: drain the tunnel headers, reply `200 Connection
//!    established`, then accept TLS on the same socket with a leaf issued
//!    for the requested domain and read the inner request line
//! 3. Probe the cache (GET only), otherwise fetch from the origin
//! 4. Relay status, headers and body, buffering the body when the response
//!    may be cached
//! 5. Close the connection
//!
//! Responses on intercepted tunnels are never stored.

use super::error::ProxyError;
use super::relay::{reason_phrase, relay_headers, write_connect_established, write_head};
use super::request::{
    parse_request_line, read_body, read_header_lines, read_line, ClientRequest, RequestLine,
};
use super::tls::create_tls_acceptor;
use super::upstream;
use crate::ca::CertificateAuthority;
use crate::cache::{policy, CacheEntry, CacheKey, CacheStore, Cacheability};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Diagnostic dump switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Log request and response heads.
    pub dump_headers: bool,
    /// Log POST bodies.
    pub dump_post_data: bool,
    /// Log response bodies.
    pub dump_response_data: bool,
}

impl Diagnostics {
    /// Whether any dump is enabled.
    pub fn any(&self) -> bool {
        self.dump_headers || self.dump_post_data || self.dump_response_data
    }
}

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Issues leaf certificates for intercepted domains.
    pub ca: Arc<CertificateAuthority>,
    /// Response cache, `None` when caching is disabled.
    pub cache: Option<Arc<CacheStore>>,
    /// Connector for HTTPS origins.
    pub connector: TlsConnector,
    /// Diagnostic dump switches.
    pub diagnostics: Diagnostics,
    /// Serializes diagnostic output across connections while dumping.
    pub output_lock: Arc<Mutex<()>>,
}

/// Handle one client connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
) -> Result<(), ProxyError> {
    // Dumps from concurrent connections must not interleave.
    let output_lock = ctx.output_lock.clone();
    let _output = if ctx.diagnostics.any() {
        Some(output_lock.lock().await)
    } else {
        None
    };

    let mut client = BufReader::new(stream);
    let Some(first_line) = read_line(&mut client).await? else {
        debug!("Client {} closed before sending a request", peer);
        return Ok(());
    };
    let request_line = parse_request_line(&first_line)?;

    if !request_line.is_connect() {
        let result = exchange(&mut client, &request_line, None, peer, &ctx).await;
        client.shutdown().await.ok();
        return result;
    }

    let (host, port) = parse_host_port(&request_line.target)?;
    debug!("CONNECT request to {}:{}", host, port);

    read_header_lines(&mut client).await?;
    write_connect_established(&mut client).await?;

    // Issuing a new leaf generates a key and writes a file.
    let ca = ctx.ca.clone();
    let domain = host.clone();
    let leaf = tokio::task::spawn_blocking(move || ca.certificate_for(&domain)).await??;
    let acceptor = create_tls_acceptor(&leaf.domain, leaf.certified_key.clone());
    let tls = acceptor
        .accept(client)
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    debug!("TLS established with client for {}:{}", host, port);

    let mut tunnel = BufReader::new(tls);
    let Some(inner_line) = read_line(&mut tunnel).await? else {
        debug!("Client {} closed tunnel to {} without a request", peer, host);
        return Ok(());
    };
    let inner_line = parse_request_line(&inner_line)?;
    let base = tunnel_base(&host, port);

    let result = exchange(&mut tunnel, &inner_line, Some(&base), peer, &ctx).await;
    tunnel.shutdown().await.ok();
    result
}

/// Run one request/response exchange on an established client stream.
async fn exchange<S>(
    client: &mut BufReader<S>,
    request_line: &RequestLine,
    tunnel_base: Option<&str>,
    peer: SocketAddr,
    ctx: &ConnectionContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let diagnostics = ctx.diagnostics;
    let header_lines = read_header_lines(client).await?;
    let request = ClientRequest::from_parts(request_line, header_lines, tunnel_base)?;

    if diagnostics.dump_headers {
        request.dump();
    }

    let key = CacheKey::new(
        request.absolute_uri(),
        request.user_agent.clone().unwrap_or_default(),
    );

    let mut body = Bytes::new();
    if request.method == Method::GET {
        if let Some(cache) = &ctx.cache {
            match cache.lookup(&key) {
                Some(entry) => {
                    debug!("Cache hit for {}", key.absolute_uri);
                    return serve_cached(client, &entry, diagnostics).await;
                }
                None => debug!("Cache miss for {}", key.absolute_uri),
            }
        }
    } else if request.method == Method::POST && request.content_length > 0 {
        body = read_body(client, request.content_length).await?;
        if diagnostics.dump_post_data {
            info!("{}", String::from_utf8_lossy(&body));
        }
    }

    info!(
        "Requesting {} on behalf of client {}",
        key.absolute_uri, peer
    );

    let upstream_request = request.to_upstream(body)?;
    let response = upstream::fetch(&request.uri, upstream_request, &ctx.connector).await?;

    let status_code = response.status().as_u16();
    let status_text = reason_phrase(&response);
    let headers = relay_headers(response.headers());

    write_head(
        client,
        status_code,
        &status_text,
        &headers,
        diagnostics.dump_headers,
    )
    .await?;

    let cacheability = match (&ctx.cache, tunnel_base) {
        (Some(_), None) if request.method == Method::GET => {
            policy::evaluate(&headers, Utc::now())
        }
        _ => Cacheability::NotCacheable,
    };
    let mut captured = cacheability.is_cacheable().then(BytesMut::new);

    let mut incoming = response.into_body();
    while let Some(frame) = incoming.frame().await {
        let frame = frame?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if diagnostics.dump_response_data {
            info!("{}", String::from_utf8_lossy(&data));
        }
        if let Some(buf) = captured.as_mut() {
            buf.extend_from_slice(&data);
        }
        client.write_all(&data).await?;
    }
    client.flush().await?;

    if let (Some(cache), Some(buf), Cacheability::Cacheable { expires }) =
        (&ctx.cache, captured, cacheability)
    {
        cache.insert(CacheEntry::new(
            key,
            status_code,
            status_text,
            headers,
            buf.freeze(),
            expires,
        ));
    }

    Ok(())
}

/// Replay a stored response.
async fn serve_cached<W>(
    client: &mut W,
    entry: &CacheEntry,
    diagnostics: Diagnostics,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    write_head(
        client,
        entry.status_code,
        &entry.status_text,
        &entry.headers,
        diagnostics.dump_headers,
    )
    .await?;

    if let Some(bytes) = &entry.response_bytes {
        client.write_all(bytes).await?;
        if diagnostics.dump_response_data {
            info!("{}", String::from_utf8_lossy(bytes));
        }
    }
    client.flush().await?;
    Ok(())
}

/// Scheme and authority prefixed to requests read from a tunnel.
fn tunnel_base(host: &str, port: u16) -> String {
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    if port == 443 {
        format!("https://{}", host)
    } else {
        format!("https://{}:{}", host, port)
    }
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    let invalid_port =
        |port: &str| ProxyError::InvalidRequest(format!("Invalid CONNECT port: {}", port));

    let (host, port) = match authority.rsplit_once(':') {
        // Bracketed IPv6 literal, e.g. [::1]:443
        Some((host, port)) if host.starts_with('[') && host.ends_with(']') => (
            &host[1..host.len() - 1],
            port.parse::<u16>().map_err(|_| invalid_port(port))?,
        ),
        Some((host, port)) if !host.contains(':') => {
            (host, port.parse::<u16>().map_err(|_| invalid_port(port))?)
        }
        _ => (authority.trim_start_matches('[').trim_end_matches(']'), 443),
    };

    if host.is_empty() {
        return Err(ProxyError::InvalidRequest(format!(
            "Missing host in CONNECT target: {}",
            authority
        )));
    }
    Ok((host.to_ascii_lowercase(), port))
}
