//! Local HTTP proxy entrypoint.
//!
//! Grounded on `examples/original_source/client/entry_http.go`'s
//! `entryHttpHandler` (`HttpHandler`/`HttpsHandler`/optimistic 200), adapted
//! to `httparse`-based request parsing (the teacher avoids hand-rolled HTTP
//! parsing wherever a parser crate is available; see `app/proxy.rs`'s own
//! byte-sniffing style for the general shape of "inspect the first bytes off
//! an accepted socket").

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::addr;
use crate::error::Error;
use crate::tunnel::Tunnel;

/// Serves already-buffered bytes first, then falls through to the live
/// socket. Needed because reading the request head may have over-read into
/// the start of the body.
struct LeftoverThenStream<'a> {
    leftover: std::io::Cursor<Vec<u8>>,
    stream: &'a mut TcpStream,
}

impl AsyncRead for LeftoverThenStream<'_> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if (this.leftover.position() as usize) < this.leftover.get_ref().len() {
            let pos = this.leftover.position() as usize;
            let remaining = &this.leftover.get_ref()[pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.leftover.set_position((pos + n) as u64);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut *this.stream).poll_read(cx, buf)
    }
}

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_BYTES: usize = 1 << 20;
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

struct ParsedRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    /// Offset into the accumulated read buffer where the body starts.
    body_start: usize,
}

pub async fn start(addr: String, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    let listener = super::bind(&addr).await?;
    log::info!("entry:http listening on {addr}");
    super::accept_loop("entry:http", listener, tunnel, |stream, peer, tunnel| async move {
        if let Err(e) = handle_connection(stream, peer, tunnel).await {
            log::debug!("entry:http: connection from {peer} ended: {e}");
        }
    })
    .await;
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    stream.set_nodelay(true).ok();
    let mut buf = Vec::with_capacity(4096);
    let head_end = read_request_head(&mut stream, &mut buf).await?;

    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_buf);
    let parsed = req
        .parse(&buf[..head_end])
        .map_err(|_| Error::InvalidAddress { addr: peer.to_string(), reason: "malformed request" })?;
    if parsed.is_partial() {
        return Err(Error::InvalidAddress { addr: peer.to_string(), reason: "truncated request head" });
    }
    let method = req.method.unwrap_or("").to_string();
    let uri = req.path.unwrap_or("").to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();
    let parsed = ParsedRequest { method, uri, headers, body_start: head_end };

    if parsed.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, &parsed.uri, &tunnel).await
    } else {
        handle_plain(stream, &buf, parsed, &tunnel).await
    }
}

async fn read_request_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<usize, Error> {
    let mut chunk = [0u8; 2048];
    loop {
        if let Some(pos) = find_header_end(buf) {
            return Ok(pos);
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::InvalidAddress {
                addr: String::new(),
                reason: "request head exceeds max_header_bytes",
            });
        }
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout")))?
            .map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed before sending a full request",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// `HttpsHandler`: the local client is told "200 Connection Established"
/// before the upstream CONNECT even starts, then handed to `redirect` for
/// the zero-RTT splice.
async fn handle_connect(mut stream: TcpStream, target: &str, tunnel: &Tunnel) -> Result<(), Error> {
    log::info!("entry:http: CONNECT {target}");
    tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(CONNECTION_ESTABLISHED))
        .await
        .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")))?
        .map_err(Error::Io)?;
    tunnel.redirect(stream, target).await
}

/// `HttpHandler`: sanitizes the request, strips hop-by-hop headers, performs
/// a proxy-form round trip, and relays the response head and body back.
async fn handle_plain(
    mut stream: TcpStream,
    head_buf: &[u8],
    parsed: ParsedRequest,
    tunnel: &Tunnel,
) -> Result<(), Error> {
    let (host, path_and_query) = resolve_target(&parsed)?;
    log::info!("entry:http: {} {}", parsed.method, host);

    let content_length = parsed
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok());

    let extra_headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .filter(|(k, _)| !addr::is_hop_by_hop(k) && !k.eq_ignore_ascii_case("host"))
        .cloned()
        .collect();

    let leftover = head_buf[parsed.body_start..].to_vec();
    let mut response = {
        let mut reader = LeftoverThenStream { leftover: std::io::Cursor::new(leftover), stream: &mut stream };
        tunnel
            .round_trip(
                &parsed.method,
                &host,
                &path_and_query,
                &extra_headers,
                content_length,
                Some(&mut reader),
            )
            .await?
    };

    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        response.head.status,
        if response.head.reason.is_empty() { "OK" } else { &response.head.reason }
    );
    for (k, v) in &response.head.headers {
        if addr::is_hop_by_hop(k) {
            continue;
        }
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    if let Err(e) = stream.write_all(out.as_bytes()).await {
        tunnel.discard(response.conn, response.pooled);
        return Err(Error::Io(e));
    }

    let resp_content_length = response
        .head
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok());

    let body_result = match resp_content_length {
        Some(len) => copy_body(&mut response.conn, &mut stream, len).await,
        None => (async {
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = response.conn.read(&mut buf).await.map_err(Error::Io)?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await.map_err(Error::Io)?;
            }
        })
        .await,
    };

    if let Err(e) = body_result {
        tunnel.discard(response.conn, response.pooled);
        return Err(e);
    }

    stream.flush().await.ok();
    tunnel.finish(response.conn, response.pooled).await;
    Ok(())
}

async fn copy_body(conn: &mut crate::upstream::Conn, out: &mut TcpStream, mut remaining: u64) -> Result<(), Error> {
    let mut buf = [0u8; 16 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = conn.read(&mut buf[..want]).await.map_err(Error::Io)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await.map_err(Error::Io)?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Resolves the request's target host and request path, per
/// `SanitizeRequest`: absolute-URI request lines carry their own host;
/// relative ones fall back to the `Host` header.
fn resolve_target(parsed: &ParsedRequest) -> Result<(String, String), Error> {
    if let Some(rest) = parsed.uri.strip_prefix("http://") {
        let (hostport, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        return Ok((addr::canonical_addr(hostport, "http"), path.to_string()));
    }
    let host_header = parsed
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.trim().to_string())
        .ok_or(Error::InvalidAddress { addr: parsed.uri.clone(), reason: "missing Host header" })?;
    let host = addr::canonical_addr(&host_header, "http");
    let path = if parsed.uri.is_empty() { "/".to_string() } else { parsed.uri.clone() };
    Ok((host, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_target_from_absolute_uri() {
        let parsed = ParsedRequest {
            method: "GET".to_string(),
            uri: "http://example.com/a/b".to_string(),
            headers: vec![],
            body_start: 0,
        };
        let (host, path) = resolve_target(&parsed).unwrap();
        assert_eq!(host, "example.com:80");
        assert_eq!(path, "/a/b");
    }

    #[test]
    fn resolve_target_from_host_header() {
        let parsed = ParsedRequest {
            method: "GET".to_string(),
            uri: "/a/b".to_string(),
            headers: vec![("Host".to_string(), "example.com:8080".to_string())],
            body_start: 0,
        };
        let (host, path) = resolve_target(&parsed).unwrap();
        assert_eq!(host, "example.com:8080");
        assert_eq!(path, "/a/b");
    }
}
