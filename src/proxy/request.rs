//! Client request parsing.
//!
//! The client-facing socket speaks HTTP/1.0-style text framing: one request
//! line, header lines up to a blank line, and for POST an optional body of
//! exactly `Content-Length` bytes. Chunked request bodies are not supported.
//!
//! Recognized headers and their effect on the upstream request:
//!
//! | Header              | Effect                                       |
//! |---------------------|----------------------------------------------|
//! | `host`              | upstream `Host`                              |
//! | `user-agent`        | upstream `User-Agent`, part of the cache key |
//! | `accept`            | upstream `Accept`                            |
//! | `referer`           | upstream `Referer`                           |
//! | `cookie`            | forwarded as `Cookie`                        |
//! | `content-length`    | POST body length                             |
//! | `content-type`      | forwarded                                    |
//! | `if-modified-since` | date before the first `;`, forwarded         |
//! | `proxy-connection`, `connection`, `keep-alive` | dropped           |
//! | anything else       | forwarded by name                            |

use super::error::ProxyError;
use crate::cache::policy::parse_http_date;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Method, Request, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tracing::{error, info};

/// Query marker carrying a Referer override in the request URL.
const REFERER_OVERRIDE_MARKER: &str = "&x123Referer=";

/// Largest POST body accepted from a client.
pub const MAX_POST_BODY: usize = 16 * 1024 * 1024;

/// The three components of a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// Method token, as sent.
    pub method: String,
    /// Request target (absolute URI, origin-form path, or CONNECT authority).
    pub target: String,
    /// Protocol version token (may be empty).
    pub version: String,
}

impl RequestLine {
    /// Whether this is a CONNECT tunnel request.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Split a request line into method, target and version.
pub fn parse_request_line(line: &str) -> Result<RequestLine, ProxyError> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(3, ' ');

    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    if method.is_empty() || target.is_empty() {
        return Err(ProxyError::InvalidRequest(format!(
            "Malformed request line: {:?}",
            line
        )));
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: parts.next().unwrap_or_default().to_string(),
    })
}

/// Read one line, without its terminator.
///
/// Returns `None` at end of stream.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

/// Read header lines up to (and including) the blank separator line.
///
/// Lines without a `:` are logged and skipped.
pub async fn read_header_lines<R>(reader: &mut R) -> Result<Vec<(String, String)>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    while let Some(line) = read_line(reader).await? {
        if line.trim().is_empty() {
            break;
        }
        match split_header(&line) {
            Some(pair) => headers.push(pair),
            None => error!("Ignoring malformed header line: {:?}", line),
        }
    }
    Ok(headers)
}

/// Split `Name: value` on the first `": "`, falling back to the first `:`.
fn split_header(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(": ").or_else(|| line.split_once(':'))?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// A client request, ready to be cached or sent upstream.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Request method.
    pub method: Method,
    /// Absolute request URI.
    pub uri: Uri,
    /// Upstream `Host`.
    pub host: Option<String>,
    /// Upstream `User-Agent`.
    pub user_agent: Option<String>,
    /// Upstream `Accept`.
    pub accept: Option<String>,
    /// Upstream `Referer`.
    pub referer: Option<String>,
    /// Forwarded `Cookie`.
    pub cookie: Option<String>,
    /// Forwarded `Content-Type`.
    pub content_type: Option<String>,
    /// Parsed `If-Modified-Since`.
    pub if_modified_since: Option<DateTime<Utc>>,
    /// Declared POST body length (0 if absent or unparseable).
    pub content_length: usize,
    /// Every other header, forwarded by name.
    pub other_headers: Vec<(String, String)>,
}

impl ClientRequest {
    /// Build a request from its request line and header lines.
    ///
    /// `tunnel_base` is `https://<domain>` for requests read from an
    /// intercepted tunnel; the inner target is appended to it.
    pub fn from_parts(
        line: &RequestLine,
        header_lines: Vec<(String, String)>,
        tunnel_base: Option<&str>,
    ) -> Result<Self, ProxyError> {
        let method = Method::from_bytes(line.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ProxyError::InvalidRequest(format!("Invalid method: {}", line.method)))?;

        let mut request = ClientRequest {
            method,
            uri: Uri::default(),
            host: None,
            user_agent: None,
            accept: None,
            referer: None,
            cookie: None,
            content_type: None,
            if_modified_since: None,
            content_length: 0,
            other_headers: Vec::new(),
        };

        for (name, value) in header_lines {
            match name.to_ascii_lowercase().as_str() {
                "host" => request.host = Some(value),
                "user-agent" => request.user_agent = Some(value),
                "accept" => request.accept = Some(value),
                "referer" => request.referer = Some(value),
                "cookie" => request.cookie = Some(value),
                "proxy-connection" | "connection" | "keep-alive" => {}
                "content-length" => request.content_length = value.trim().parse().unwrap_or(0),
                "content-type" => request.content_type = Some(value),
                "if-modified-since" => {
                    let date = value.trim().split(';').next().unwrap_or_default();
                    request.if_modified_since = parse_http_date(date);
                }
                _ => request.other_headers.push((name, value)),
            }
        }

        request.uri = resolve_target(&line.target, tunnel_base, request.host.as_deref())?;

        if let Some(referer) = referer_override(&request.uri.to_string()) {
            request.referer = Some(referer);
        }

        Ok(request)
    }

    /// Absolute URI as a string (the cache key's URI component).
    pub fn absolute_uri(&self) -> String {
        self.uri.to_string()
    }

    /// Log the request line and headers.
    pub fn dump(&self) {
        info!("{} {} HTTP/1.0", self.method, self.uri);
        let named = [
            ("Host", &self.host),
            ("User-Agent", &self.user_agent),
            ("Accept", &self.accept),
            ("Referer", &self.referer),
            ("Cookie", &self.cookie),
            ("Content-Type", &self.content_type),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                info!("{}: {}", name, value);
            }
        }
        for (name, value) in &self.other_headers {
            info!("{}: {}", name, value);
        }
        info!("");
    }

    /// Build the upstream request carrying `body`.
    ///
    /// The request is sent in origin-form over a fresh connection with
    /// keep-alive disabled. Headers that cannot be represented are logged
    /// and skipped.
    pub fn to_upstream(&self, body: Bytes) -> Result<Request<Full<Bytes>>, ProxyError> {
        let path = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(path)
            .version(Version::HTTP_11);

        let headers = builder
            .headers_mut()
            .ok_or_else(|| ProxyError::InvalidRequest(format!("Invalid target: {}", path)))?;

        let host = self
            .host
            .clone()
            .or_else(|| self.uri.authority().map(|a| a.to_string()));
        let named = [
            (header::HOST, host.as_deref()),
            (header::USER_AGENT, self.user_agent.as_deref()),
            (header::ACCEPT, self.accept.as_deref()),
            (header::REFERER, self.referer.as_deref()),
            (header::COOKIE, self.cookie.as_deref()),
            (header::CONTENT_TYPE, self.content_type.as_deref()),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                match HeaderValue::from_str(value) {
                    Ok(v) => {
                        headers.insert(name, v);
                    }
                    Err(e) => error!("Could not add header {}. {}", name, e),
                }
            }
        }

        if let Some(date) = self.if_modified_since {
            let formatted = date.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            if let Ok(v) = HeaderValue::from_str(&formatted) {
                headers.insert(header::IF_MODIFIED_SINCE, v);
            }
        }

        for (name, value) in &self.other_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                (Err(e), _) => error!("Could not add header {}. {}", name, e),
                (_, Err(e)) => error!("Could not add header {}. {}", name, e),
            }
        }

        if !body.is_empty() {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

        builder
            .body(Full::new(body))
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))
    }
}

/// Read exactly `len` body bytes from the client.
///
/// Bodies larger than [`MAX_POST_BODY`] are refused before anything is
/// read. The buffer grows as bytes arrive, so a declared length the client
/// never sends costs nothing.
pub async fn read_body<R>(reader: &mut R, len: usize) -> Result<Bytes, ProxyError>
where
    R: AsyncRead + Unpin,
{
    if len > MAX_POST_BODY {
        return Err(ProxyError::InvalidRequest(format!(
            "POST body of {} bytes exceeds the {} byte limit",
            len, MAX_POST_BODY
        )));
    }

    let mut body = Vec::new();
    (&mut *reader).take(len as u64).read_to_end(&mut body).await?;
    if body.len() < len {
        return Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("POST body ended after {} of {} bytes", body.len(), len),
        )));
    }
    Ok(Bytes::from(body))
}

/// Turn the request target into an absolute URI.
fn resolve_target(
    target: &str,
    tunnel_base: Option<&str>,
    host: Option<&str>,
) -> Result<Uri, ProxyError> {
    let absolute = match tunnel_base {
        Some(base) => {
            // Inner requests are origin-form; tolerate absolute-form too.
            match target.parse::<Uri>() {
                Ok(uri) if uri.scheme().is_some() => {
                    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
                    format!("{}{}", base, path)
                }
                _ => format!("{}{}", base, target),
            }
        }
        None if target.starts_with('/') => match host {
            Some(host) => format!("http://{}{}", host, target),
            None => {
                return Err(ProxyError::InvalidRequest(format!(
                    "Relative target without Host: {}",
                    target
                )));
            }
        },
        None => target.to_string(),
    };

    let uri: Uri = absolute
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid target {}: {}", absolute, e)))?;

    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(ProxyError::InvalidRequest(format!(
            "Target is not an absolute URI: {}",
            absolute
        )));
    }
    Ok(uri)
}

/// Extract a Referer override smuggled in the URL as `&x123Referer=<url>`.
fn referer_override(url: &str) -> Option<String> {
    let start = url.find(REFERER_OVERRIDE_MARKER)? + REFERER_OVERRIDE_MARKER.len();
    let rest = &url[start..];
    let value = rest.split('&').next().unwrap_or(rest);
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn line(method: &str, target: &str) -> RequestLine {
        RequestLine {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
        }
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_request_line() {
        let parsed = parse_request_line("GET http://example.com/ HTTP/1.1\r\n").unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.target, "http://example.com/");
        assert_eq!(parsed.version, "HTTP/1.1");
        assert!(!parsed.is_connect());
    }

    #[test]
    fn test_parse_connect_line() {
        let parsed = parse_request_line("connect secure.example.com:443 HTTP/1.1").unwrap();
        assert!(parsed.is_connect());
        assert_eq!(parsed.target, "secure.example.com:443");
    }

    #[test]
    fn test_parse_request_line_missing_target() {
        assert!(parse_request_line("GET").is_err());
        assert!(parse_request_line("").is_err());
    }

    #[tokio::test]
    async fn test_read_header_lines_stops_at_blank() {
        let raw = b"Host: example.com\r\nUser-Agent: curl/8.0\r\nbogus\r\n\r\nBODY";
        let mut reader = BufReader::new(&raw[..]);
        let headers = read_header_lines(&mut reader).await.unwrap();
        assert_eq!(
            headers,
            pairs(&[("Host", "example.com"), ("User-Agent", "curl/8.0")])
        );

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "BODY");
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_line(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_recognized_headers() {
        let request = ClientRequest::from_parts(
            &line("POST", "http://example.com/submit"),
            pairs(&[
                ("Host", "example.com"),
                ("User-Agent", "curl/8.0"),
                ("Accept", "*/*"),
                ("Referer", "http://example.com/"),
                ("Cookie", "a=1"),
                ("Content-Length", "11"),
                ("Content-Type", "text/plain"),
                ("If-Modified-Since", "Sun, 06 Nov 1994 08:49:37 GMT; length=12"),
                ("Proxy-Connection", "keep-alive"),
                ("Connection", "keep-alive"),
                ("Keep-Alive", "300"),
                ("X-Custom", "yes"),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(request.cookie.as_deref(), Some("a=1"));
        assert_eq!(request.content_length, 11);
        assert!(request.if_modified_since.is_some());
        assert_eq!(request.other_headers, pairs(&[("X-Custom", "yes")]));
    }

    #[test]
    fn test_unparseable_content_length_is_zero() {
        let request = ClientRequest::from_parts(
            &line("POST", "http://example.com/"),
            pairs(&[("Content-Length", "lots")]),
            None,
        )
        .unwrap();
        assert_eq!(request.content_length, 0);
    }

    #[test]
    fn test_tunnel_target_rebuilt() {
        let request = ClientRequest::from_parts(
            &line("GET", "/path?q=1"),
            pairs(&[("Host", "secure.example.com")]),
            Some("https://secure.example.com"),
        )
        .unwrap();
        assert_eq!(request.absolute_uri(), "https://secure.example.com/path?q=1");
    }

    #[test]
    fn test_origin_form_uses_host() {
        let request = ClientRequest::from_parts(
            &line("GET", "/index.html"),
            pairs(&[("Host", "example.com:8080")]),
            None,
        )
        .unwrap();
        assert_eq!(request.absolute_uri(), "http://example.com:8080/index.html");
    }

    #[test]
    fn test_origin_form_without_host_rejected() {
        let result = ClientRequest::from_parts(&line("GET", "/index.html"), vec![], None);
        assert!(matches!(result, Err(ProxyError::InvalidRequest(_))));
    }

    #[test]
    fn test_referer_override() {
        let request = ClientRequest::from_parts(
            &line("GET", "http://example.com/a?x=1&x123Referer=http://ref.example/&y=2"),
            pairs(&[("Referer", "http://original/")]),
            None,
        )
        .unwrap();
        assert_eq!(request.referer.as_deref(), Some("http://ref.example/"));
    }

    #[test]
    fn test_to_upstream_headers() {
        let request = ClientRequest::from_parts(
            &line("GET", "http://example.com/a?b=c"),
            pairs(&[
                ("User-Agent", "curl/8.0"),
                ("X-Custom", "yes"),
                ("Bad Header", "x"),
                ("Connection", "keep-alive"),
            ]),
            None,
        )
        .unwrap();

        let upstream = request.to_upstream(Bytes::new()).unwrap();
        assert_eq!(upstream.uri(), "/a?b=c");
        let headers = upstream.headers();
        assert_eq!(headers[header::HOST], "example.com");
        assert_eq!(headers[header::USER_AGENT], "curl/8.0");
        assert_eq!(headers["x-custom"], "yes");
        assert_eq!(headers[header::CONNECTION], "close");
        assert!(!headers.contains_key(header::CONTENT_LENGTH));
    }

    #[test]
    fn test_to_upstream_post_body() {
        let request = ClientRequest::from_parts(
            &line("POST", "http://example.com/submit"),
            pairs(&[("Content-Length", "5")]),
            None,
        )
        .unwrap();
        let upstream = request.to_upstream(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(upstream.headers()[header::CONTENT_LENGTH], "5");
    }

    #[tokio::test]
    async fn test_read_body_exact() {
        let mut reader = BufReader::new(&b"helloEXTRA"[..]);
        let body = read_body(&mut reader, 5).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_body_short_stream_fails() {
        let mut reader = BufReader::new(&b"hel"[..]);
        let result = read_body(&mut reader, 5).await;
        assert!(matches!(result, Err(ProxyError::Io(_))));
    }

    #[tokio::test]
    async fn test_read_body_over_limit_rejected() {
        let mut reader = BufReader::new(&b"hi"[..]);
        let result = read_body(&mut reader, 100_000_000_000_000).await;
        assert!(matches!(result, Err(ProxyError::InvalidRequest(_))));

        // Nothing was consumed from the stream.
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "hi");
    }

    #[tokio::test]
    async fn test_read_body_at_limit_accepted() {
        let data = vec![b'x'; MAX_POST_BODY];
        let mut reader = BufReader::new(&data[..]);
        let body = read_body(&mut reader, MAX_POST_BODY).await.unwrap();
        assert_eq!(body.len(), MAX_POST_BODY);
    }
}
