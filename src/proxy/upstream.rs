//! Upstream fetches.
//!
//! Each request gets its own connection to the origin: plain TCP for `http`
//! URIs, TLS over TCP for `https`. Redirects are not followed and bodies
//! are not decompressed. Any response the origin sends, including 4xx and
//! 5xx, is a successful fetch; an error means no response was obtained.

use super::error::ProxyError;
use super::tls::domain_to_server_name;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// A response obtained from the origin, whatever its status.
pub type UpstreamResponse = Response<Incoming>;

/// Send `request` to the origin named by `uri`.
pub async fn fetch(
    uri: &Uri,
    request: Request<Full<Bytes>>,
    connector: &TlsConnector,
) -> Result<UpstreamResponse, ProxyError> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("Missing host in {}", uri)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let secure = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
    let addr = format!("{}:{}", host, port);

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

    debug!("Connected to upstream {}", addr);

    if secure {
        let server_name = domain_to_server_name(host)?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: addr.clone(),
                message: format!("TLS handshake failed: {}", e),
            })?;
        send(tls, request, &addr).await
    } else {
        send(tcp, request, &addr).await
    }
}

async fn send<S>(
    stream: S,
    request: Request<Full<Bytes>>,
    addr: &str,
) -> Result<UpstreamResponse, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::Builder::new()
        .title_case_headers(true)
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;

    let conn_addr = addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!("Upstream connection to {} ended: {}", conn_addr, e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tls::create_tls_connector;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_fetch_plain_http() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = origin.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
            assert!(head.contains("Connection: close"));
            socket
                .write_all(b"HTTP/1.1 404 Not Here\r\nContent-Length: 4\r\n\r\nnope")
                .await
                .unwrap();
        });

        let uri: Uri = format!("http://{}/hello", addr).parse().unwrap();
        let request = Request::builder()
            .uri("/hello")
            .header("Host", addr.to_string())
            .header("Connection", "close")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = fetch(&uri, request, &create_tls_connector()).await.unwrap();
        assert_eq!(response.status(), 404);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"nope");
    }

    #[tokio::test]
    async fn test_fetch_refused_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let uri: Uri = format!("http://{}/", addr).parse().unwrap();
        let request = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let result = fetch(&uri, request, &create_tls_connector()).await;
        assert!(matches!(result, Err(ProxyError::UpstreamConnect { .. })));
    }
}
