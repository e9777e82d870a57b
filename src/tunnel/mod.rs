//! The upstream tunnel client: `dial`, `redirect`, `round_trip`, grounded on
//! `examples/original_source/client/client.go`'s `HTTPProxyClient`.

mod copy;
mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::addr;
use crate::bogusdns::BogusTable;
use crate::error::Error;
use crate::gfwlist::GfwListStore;
use crate::pool::ConnectionPool;
use crate::upstream::{Conn, UpstreamEndpoint};

/// The fixed header block sent on every CONNECT/proxy-form request, rebuilt
/// atomically whenever credentials change (`SetBasicAuth` in the original).
struct HeaderBlock {
    pairs: Vec<(&'static str, String)>,
}

impl HeaderBlock {
    fn build(username: &str, password: &str) -> HeaderBlock {
        let mut pairs = vec![
            ("Proxy-Connection", "keep-alive".to_string()),
            ("User-Agent", "HTTPProxy/1.0".to_string()),
            ("X-Proxy-Boost", "boosted".to_string()),
        ];
        if !username.is_empty() || !password.is_empty() {
            let encoded = BASE64.encode(format!("{username}:{password}"));
            pairs.push(("Proxy-Authorization", format!("Basic {encoded}")));
        }
        HeaderBlock { pairs }
    }

    fn as_pairs(&self) -> Vec<(&str, String)> {
        self.pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

pub use wire::ResponseHead;

/// A non-CONNECT response whose body has not yet been consumed: the caller
/// owns `conn` and must call `finish` once the body has been fully read, so
/// the connection can return to the pool. `head.trailing` holds any body
/// bytes already read past the header terminator. `pooled` is false for a
/// policy-bypassed direct connection, which `finish`/`discard` must not hand
/// back to the upstream pool.
pub struct TunnelResponse {
    pub head: ResponseHead,
    pub conn: Conn,
    pub pooled: bool,
}

pub struct Tunnel {
    pool: ConnectionPool,
    endpoint: UpstreamEndpoint,
    headers: ArcSwap<HeaderBlock>,
    bogus: Option<Arc<BogusTable>>,
    gfwlist: Arc<GfwListStore>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl Tunnel {
    pub fn new(
        endpoint: UpstreamEndpoint,
        max_idle: usize,
        idle_timeout: std::time::Duration,
        bogus: Option<Arc<BogusTable>>,
        gfwlist: Arc<GfwListStore>,
    ) -> Tunnel {
        let headers = HeaderBlock::build(&endpoint.username, &endpoint.password);
        Tunnel {
            pool: ConnectionPool::new(endpoint.clone(), max_idle, idle_timeout),
            endpoint,
            headers: ArcSwap::from_pointee(headers),
            bogus,
            gfwlist,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    /// Updates the upstream credentials; readers observe the change
    /// atomically via the `ArcSwap`.
    pub fn set_basic_auth(&self, username: &str, password: &str) {
        self.headers.store(Arc::new(HeaderBlock::build(username, password)));
    }

    /// Aborts in-flight dials and wakes anything waiting on cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) {
        self.cancel();
        self.pool.close_all().await;
    }

    pub async fn sweep_idle(&self) {
        self.pool.sweep_expired().await;
    }

    /// If `host_port`'s host half is a literal IP inside the bogus-DNS
    /// prefix, reverses it to its original hostname; otherwise returns
    /// `host_port` unchanged.
    fn probe(&self, host_port: &str) -> String {
        let Some(bogus) = &self.bogus else { return host_port.to_string() };
        let Some((host, port)) = addr::split_host_port(host_port) else { return host_port.to_string() };
        let Ok(ip) = host.parse::<std::net::Ipv4Addr>() else { return host_port.to_string() };
        match bogus.get_address(ip) {
            Ok(resolved) => format!("{resolved}:{port}"),
            Err(_) => host_port.to_string(),
        }
    }

    /// The policy engine's verdict for a CONNECT-style target: `true` routes
    /// through the upstream tunnel, `false` bypasses it with a direct
    /// connection.
    fn should_tunnel_addr(&self, host: &str, port: &str) -> bool {
        self.gfwlist.load().match_addr(host, port)
    }

    /// The policy engine's verdict for a plain HTTP request.
    fn should_tunnel_url(&self, host: &str, path: &str) -> bool {
        self.gfwlist.load().matches_url("http", host, path)
    }

    async fn acquire(&self) -> Result<Conn, Error> {
        if self.is_cancelled() {
            return Err(Error::Dial("tunnel client is shutting down".to_string()));
        }
        self.pool.get().await
    }

    /// `Dial(target) → stream`: acquires a pooled connection, performs the
    /// CONNECT handshake, and on success hands the now-tunnel connection to
    /// the caller — it never returns to the pool.
    pub async fn dial(&self, target: &str) -> Result<Conn, Error> {
        addr::validate_target(target)?;
        let mut conn = self.acquire().await?;
        let headers = self.headers.load();
        if let Err(e) =
            wire::write_connect(&mut conn, target, &self.endpoint.host, &headers.as_pairs()).await
        {
            self.pool.surrender();
            return Err(e);
        }
        let head = match wire::read_response_head(&mut conn).await {
            Ok(h) => h,
            Err(e) => {
                self.pool.surrender();
                return Err(e);
            }
        };
        if head.status != 200 {
            self.pool.surrender();
            return Err(Error::ConnectRejected(if head.reason.is_empty() {
                format!("status {}", head.status)
            } else {
                head.reason
            }));
        }
        // Surrendered: this connection is now a tunnel, not pool inventory.
        self.pool.surrender();
        Ok(conn)
    }

    /// `Redirect(client_stream, target) → ok`: zero-RTT variant. Precondition
    /// on the caller (per `SPEC_FULL.md` §4.2): it must already have
    /// signalled "200 Connection Established" to its own downstream client
    /// (or never needs to, for entrypoints with no such sentinel). The
    /// client→upstream copy is started the instant the CONNECT request is
    /// written, running concurrently with reading the CONNECT response
    /// rather than waiting for it — that response confirmation only gates
    /// whether the reverse direction ever starts.
    pub async fn redirect(&self, client: TcpStream, target: &str) -> Result<(), Error> {
        addr::validate_target(target)?;
        let (host, port) = addr::split_host_port(target)
            .expect("validate_target already confirmed a host:port split exists");
        if !self.should_tunnel_addr(host, port) {
            log::debug!("tunnel: policy bypass for {target}");
            return self.redirect_direct(client, target).await;
        }
        let mut conn = self.acquire().await?;
        let headers = self.headers.load();
        if let Err(e) =
            wire::write_connect(&mut conn, target, &self.endpoint.host, &headers.as_pairs()).await
        {
            self.pool.surrender();
            return Err(e);
        }

        let half_close_capable = matches!(conn, Conn::Plain(_));
        let client_fd = {
            use std::os::unix::io::AsRawFd;
            client.as_raw_fd()
        };
        let upstream_fd = conn.raw_fd();

        let (client_rd, client_wr) = tokio::io::split(client);
        let (mut conn_rd, conn_wr) = tokio::io::split(conn);

        // Zero-RTT: the caller's bytes start flowing toward upstream right
        // away, concurrently with confirming the CONNECT response below. If
        // the CONNECT turns out to have been rejected, the forward copy
        // already in flight is aborted instead of joined to a reverse leg.
        let forward = copy::spawn_forward(client_rd, conn_wr, client_fd, upstream_fd);

        let head = match wire::read_response_head(&mut conn_rd).await {
            Ok(h) => h,
            Err(e) => {
                copy::abort_forward(forward, client_fd, upstream_fd);
                self.pool.surrender();
                return Err(e);
            }
        };
        if head.status != 200 {
            copy::abort_forward(forward, client_fd, upstream_fd);
            self.pool.surrender();
            return Err(Error::ConnectRejected(if head.reason.is_empty() {
                format!("status {}", head.status)
            } else {
                head.reason
            }));
        }
        self.pool.surrender();
        copy::join_reverse(forward, client_wr, conn_rd, head.trailing, client_fd, upstream_fd, half_close_capable)
            .await;
        Ok(())
    }

    /// Splices an already-established client/upstream pair. Used by
    /// entrypoints (e.g. SOCKS) that must confirm a direct `dial` succeeded
    /// before replying to their own client, so there is no zero-RTT race to
    /// pipeline in the first place.
    pub async fn splice(&self, client: TcpStream, conn: Conn) {
        copy::splice(client, conn).await;
    }

    /// Policy-bypassed variant of `redirect`: dials `target` directly instead
    /// of through the upstream tunnel, then splices as normal. Reuses
    /// `copy::splice` by wrapping the direct stream in `Conn::Plain`, so a
    /// bypassed connection gets the same half-close-aware copy treatment.
    async fn redirect_direct(&self, client: TcpStream, target: &str) -> Result<(), Error> {
        let sock_addr = tokio::net::lookup_host(target)
            .await
            .map_err(Error::Io)?
            .next()
            .ok_or_else(|| Error::Dial(format!("unable to resolve {target}")))?;
        let direct = TcpStream::connect(sock_addr).await.map_err(Error::Io)?;
        direct.set_nodelay(true).ok();
        copy::splice(client, Conn::Plain(direct)).await;
        Ok(())
    }

    /// `RoundTrip` for plain non-CONNECT HTTP: rewrites the target host
    /// through `probe`, writes the request in proxy form, relays `body`
    /// (the client's already-buffered request body, if any) to the
    /// upstream, and returns a response head plus the still-open connection
    /// for the caller to stream the response body from and eventually
    /// `finish`.
    #[allow(clippy::too_many_arguments)]
    pub async fn round_trip<R>(
        &self,
        method: &str,
        host: &str,
        path_and_query: &str,
        extra_headers: &[(String, String)],
        content_length: Option<u64>,
        mut body: Option<&mut R>,
    ) -> Result<TunnelResponse, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let resolved_host = self.probe(host);
        let (policy_host, _) =
            addr::split_host_port(&resolved_host).unwrap_or((resolved_host.as_str(), ""));
        if !self.should_tunnel_url(policy_host, path_and_query) {
            log::debug!("tunnel: policy bypass for {resolved_host}{path_and_query}");
            return self
                .round_trip_direct(method, &resolved_host, path_and_query, extra_headers, content_length, body)
                .await;
        }
        let mut conn = self.acquire().await?;
        let headers = self.headers.load();
        if let Err(e) = wire::write_proxy_form(
            &mut conn,
            method,
            &resolved_host,
            path_and_query,
            &headers.as_pairs(),
            extra_headers,
            content_length,
        )
        .await
        {
            self.pool.surrender();
            return Err(e);
        }
        if let (Some(src), Some(len)) = (body.as_deref_mut(), content_length) {
            if let Err(e) = copy_exact(src, &mut conn, len).await {
                self.pool.surrender();
                return Err(e);
            }
        }
        let head = match wire::read_response_head(&mut conn).await {
            Ok(h) => h,
            Err(e) => {
                self.pool.surrender();
                return Err(e);
            }
        };
        Ok(TunnelResponse { head, conn, pooled: true })
    }

    /// Policy-bypassed variant of `round_trip`: dials `host` directly and
    /// writes the request in origin form rather than proxy form. The
    /// returned connection is never pooled, since it isn't a connection to
    /// the upstream proxy.
    #[allow(clippy::too_many_arguments)]
    async fn round_trip_direct<R>(
        &self,
        method: &str,
        host: &str,
        path_and_query: &str,
        extra_headers: &[(String, String)],
        content_length: Option<u64>,
        mut body: Option<&mut R>,
    ) -> Result<TunnelResponse, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let sock_addr = tokio::net::lookup_host(host)
            .await
            .map_err(Error::Io)?
            .next()
            .ok_or_else(|| Error::Dial(format!("unable to resolve {host}")))?;
        let tcp = TcpStream::connect(sock_addr).await.map_err(Error::Io)?;
        tcp.set_nodelay(true).ok();
        let mut conn = Conn::Plain(tcp);
        wire::write_origin_form(&mut conn, method, host, path_and_query, extra_headers, content_length).await?;
        if let (Some(src), Some(len)) = (body.as_deref_mut(), content_length) {
            copy_exact(src, &mut conn, len).await?;
        }
        let head = wire::read_response_head(&mut conn).await?;
        Ok(TunnelResponse { head, conn, pooled: false })
    }

    /// Returns a `round_trip`-acquired connection to the pool once its body
    /// has been fully consumed. A policy-bypassed (`pooled: false`)
    /// connection is simply dropped instead.
    pub async fn finish(&self, conn: Conn, pooled: bool) {
        if pooled {
            self.pool.put(conn).await;
        }
    }

    /// Discards a `round_trip`-acquired connection instead of pooling it
    /// (used when the body could not be cleanly drained).
    pub fn discard(&self, conn: Conn, pooled: bool) {
        drop(conn);
        if pooled {
            self.pool.surrender();
        }
    }
}

async fn copy_exact<R>(src: &mut R, dst: &mut Conn, mut remaining: u64) -> Result<(), Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = src.read(&mut buf[..want]).await.map_err(Error::Io)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await.map_err(Error::Io)?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_includes_auth_when_credentials_present() {
        let hb = HeaderBlock::build("alice", "secret");
        assert!(hb.as_pairs().iter().any(|(k, _)| *k == "Proxy-Authorization"));
    }

    #[test]
    fn header_block_omits_auth_when_empty() {
        let hb = HeaderBlock::build("", "");
        assert!(!hb.as_pairs().iter().any(|(k, _)| *k == "Proxy-Authorization"));
    }
}
