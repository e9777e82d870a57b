//! Local entrypoints: HTTP proxy, SOCKS5, and (Linux only) REDIRECT/TPROXY.
//!
//! All four share the accept-loop shape the teacher uses for its listener
//! threads in `system/server.rs` (spawn a task per service, collect handles,
//! join on shutdown) generalized here to per-*connection* tokio tasks rather
//! than per-*service* OS threads, and to a cooperative shutdown signal rather
//! than a blocking join.

pub mod http;
pub mod socks;

#[cfg(target_os = "linux")]
pub mod redirect;
#[cfg(not(target_os = "linux"))]
#[path = "redirect_stub.rs"]
pub mod redirect;

#[cfg(target_os = "linux")]
pub mod transparent;
#[cfg(not(target_os = "linux"))]
#[path = "transparent_stub.rs"]
pub mod transparent;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::Error;
use crate::tunnel::Tunnel;

/// Binds a TCP listener, logging and returning any bind failure — shared by
/// every entrypoint's `start`.
pub(crate) async fn bind(addr: &str) -> Result<TcpListener, Error> {
    TcpListener::bind(addr).await.map_err(Error::Io)
}

/// Runs `accept_one` in a loop until `tunnel.is_cancelled()`, logging
/// transient accept errors and continuing, per spec §4.6/§7's "temporary
/// error → log and continue" accept-loop policy.
pub(crate) async fn accept_loop<F, Fut>(
    name: &str,
    listener: TcpListener,
    tunnel: Arc<Tunnel>,
    mut accept_one: F,
) where
    F: FnMut(tokio::net::TcpStream, std::net::SocketAddr, Arc<Tunnel>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        if tunnel.is_cancelled() {
            log::debug!("{name}: shutting down, accept loop exiting");
            return;
        }
        match listener.accept().await {
            Ok((stream, peer)) => {
                let fut = accept_one(stream, peer, tunnel.clone());
                tokio::spawn(fut);
            }
            Err(e) => {
                log::warn!("{name}: accept error: {e}");
            }
        }
    }
}
