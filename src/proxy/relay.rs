//! Response relay to the client.
//!
//! The relayed head is `HTTP/1.0 <code> <reason>` followed by the upstream
//! headers in order, then any `Set-Cookie` lines (one per cookie), then the
//! `X-Proxied-By` marker. The client connection is delimited by close, so
//! `Transfer-Encoding` is not forwarded.

use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderMap, SET_COOKIE, TRANSFER_ENCODING};
use hyper::{Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Name of the marker header appended to every relayed response.
pub const PROXIED_BY_HEADER: &str = "X-Proxied-By";

/// Value of the marker header.
pub const PROXIED_BY_VALUE: &str = "mitm-cache-proxy";

/// Product token sent in the CONNECT reply's `Proxy-agent` header.
pub const PROXY_AGENT: &str = concat!("mitm-cache-proxy/", env!("CARGO_PKG_VERSION"));

/// Reason phrase of an upstream response.
///
/// A non-canonical phrase sent by the origin is kept as-is.
pub fn reason_phrase<B>(response: &Response<B>) -> String {
    if let Some(reason) = response.extensions().get::<ReasonPhrase>() {
        return String::from_utf8_lossy(reason.as_bytes()).into_owned();
    }
    canonical_reason(response.status())
}

fn canonical_reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or_default().to_string()
}

/// Build the relayed header sequence from upstream headers.
pub fn relay_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut relayed = Vec::with_capacity(headers.len() + 1);
    let mut cookies = Vec::new();

    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        if *name == SET_COOKIE {
            cookies.extend(split_set_cookie(&value));
        } else if *name == TRANSFER_ENCODING {
            continue;
        } else {
            relayed.push((title_case(name.as_str()), value));
        }
    }

    relayed.extend(
        cookies
            .into_iter()
            .map(|cookie| ("Set-Cookie".to_string(), cookie)),
    );
    relayed.push((PROXIED_BY_HEADER.to_string(), PROXIED_BY_VALUE.to_string()));
    relayed
}

/// Split a `Set-Cookie` value holding several cookies.
///
/// Cookies are separated by a comma that sits outside double quotes and is
/// not followed by a space, so `Expires=Wed, 09 Jun 2021 ...` stays intact.
pub fn split_set_cookie(value: &str) -> Vec<String> {
    let mut cookies = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    let bytes = value.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => quoted = !quoted,
            b',' if !quoted && bytes.get(i + 1) != Some(&b' ') => {
                cookies.push(value[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    cookies.push(value[start..].to_string());

    cookies.retain(|c| !c.trim().is_empty());
    cookies
}

/// Title-case a lowercase header name (`content-type` -> `Content-Type`).
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

/// Format the relayed status line (without terminator).
pub fn status_line(code: u16, reason: &str) -> String {
    format!("HTTP/1.0 {} {}", code, reason)
}

/// Write the status line and headers, ending with the blank line.
pub async fn write_head<W>(
    writer: &mut W,
    code: u16,
    reason: &str,
    headers: &[(String, String)],
    dump_headers: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = status_line(code, reason);
    if dump_headers {
        info!("{}", line);
    }

    let mut head = String::with_capacity(256);
    head.push_str(&line);
    head.push_str("\r\n");
    for (name, value) in headers {
        if dump_headers {
            info!("{}: {}", name, value);
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await
}

/// Write the reply to a CONNECT request.
pub async fn write_connect_established<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reply = format!(
        "HTTP/1.0 200 Connection established\r\nTimestamp: {}\r\nProxy-agent: {}\r\n\r\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        PROXY_AGENT
    );
    writer.write_all(reply.as_bytes()).await?;
    writer.flush().await
}
