//! Minimal HTTP/1.1 proxy-wire helpers: writing CONNECT / proxy-form request
//! lines and reading a response head back off a `Conn`. Uses `httparse` for
//! response parsing rather than hand-rolled byte scanning.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::Error;
use crate::upstream::Conn;

pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Bytes already read past the header terminator (start of the body),
    /// which the caller must treat as already consumed from `conn`.
    pub trailing: Vec<u8>,
}

const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Writes a CONNECT request: opaque-form request-URI (`target` verbatim, not
/// wrapped in a full URL), `Host: <upstream-hostname>`, plus the precomputed
/// header block.
pub async fn write_connect(
    conn: &mut Conn,
    target: &str,
    upstream_host: &str,
    header_block: &[(&str, String)],
) -> Result<(), Error> {
    let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {upstream_host}\r\n");
    for (k, v) in header_block {
        req.push_str(k);
        req.push_str(": ");
        req.push_str(v);
        req.push_str("\r\n");
    }
    req.push_str("\r\n");
    conn.write_all(req.as_bytes()).await.map_err(Error::Io)?;
    conn.flush().await.map_err(Error::Io)?;
    Ok(())
}

/// Writes a non-CONNECT request in "proxy form" (absolute-URI request line).
#[allow(clippy::too_many_arguments)]
pub async fn write_proxy_form(
    conn: &mut Conn,
    method: &str,
    target_host: &str,
    path_and_query: &str,
    header_block: &[(&str, String)],
    extra_headers: &[(String, String)],
    content_length: Option<u64>,
) -> Result<(), Error> {
    let mut req = format!("{method} http://{target_host}{path_and_query} HTTP/1.1\r\n");
    req.push_str(&format!("Host: {target_host}\r\n"));
    for (k, v) in header_block {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    for (k, v) in extra_headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    if let Some(len) = content_length {
        req.push_str(&format!("Content-Length: {len}\r\n"));
    }
    req.push_str("\r\n");
    conn.write_all(req.as_bytes()).await.map_err(Error::Io)?;
    conn.flush().await.map_err(Error::Io)?;
    Ok(())
}

/// Writes a non-CONNECT request in "origin form" (bare path request line,
/// no scheme/host prefix), used for a direct (policy-bypassed) connection to
/// the actual destination rather than to the upstream proxy.
#[allow(clippy::too_many_arguments)]
pub async fn write_origin_form(
    conn: &mut Conn,
    method: &str,
    host: &str,
    path_and_query: &str,
    extra_headers: &[(String, String)],
    content_length: Option<u64>,
) -> Result<(), Error> {
    let mut req = format!("{method} {path_and_query} HTTP/1.1\r\n");
    req.push_str(&format!("Host: {host}\r\n"));
    for (k, v) in extra_headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    if let Some(len) = content_length {
        req.push_str(&format!("Content-Length: {len}\r\n"));
    }
    req.push_str("Connection: close\r\n");
    req.push_str("\r\n");
    conn.write_all(req.as_bytes()).await.map_err(Error::Io)?;
    conn.flush().await.map_err(Error::Io)?;
    Ok(())
}

/// Reads a response head (status line + headers) off `reader`, using
/// `httparse` to parse it once the `\r\n\r\n` terminator is seen. Generic
/// over the reader so it works equally on a whole `Conn` or on a
/// `ReadHalf<Conn>` split off ahead of time for the zero-RTT redirect path.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::Dial("upstream response head too large".to_string()));
        }
        let n = reader.read(&mut chunk).await.map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Dial("upstream closed before sending a response".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers_buf);
    let parsed = response
        .parse(&buf[..header_end])
        .map_err(|e| Error::Dial(format!("malformed upstream response: {e}")))?;
    if parsed.is_partial() {
        return Err(Error::Dial("truncated upstream response".to_string()));
    }
    let status = response.code.unwrap_or(0);
    let reason = response.reason.unwrap_or("").to_string();
    let headers = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    Ok(ResponseHead { status, reason, headers, trailing: buf[header_end..].to_vec() })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}
