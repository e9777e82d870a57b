//! Linux REDIRECT entrypoint: recovers the pre-DNAT destination via
//! `SO_ORIGINAL_DST` and forwards through `Tunnel::redirect`.
//!
//! Grounded on `examples/original_source/client/entry_redirect.go`/
//! `redirect.go`'s `getRemoteAddr` (`getsockopt(IPPROTO_IP, 80)` into a
//! `sockaddr_in`-shaped buffer), and `spec.md` §4.6 for the iptables
//! deploy/undeploy lifecycle (not present in the original source files,
//! which treat it as an external step).

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::process::Command;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::error::Error;
use crate::tunnel::Tunnel;

/// Value of `SO_ORIGINAL_DST` in `linux/netfilter_ipv4.h`; not exposed by
/// the `libc` crate.
const SO_ORIGINAL_DST: libc::c_int = 80;
const CHAIN_NAME: &str = "HTTPPROXY-REDIR";

pub async fn start(addr: String, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    let listener = super::bind(&addr).await?;
    log::info!("entry:redirect listening on {addr}");
    super::accept_loop("entry:redirect", listener, tunnel, |stream, peer, tunnel| async move {
        if let Err(e) = handle_connection(stream, tunnel).await {
            log::debug!("entry:redirect: connection from {peer} ended: {e}");
        }
    })
    .await;
    Ok(())
}

async fn handle_connection(stream: TcpStream, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    let original = original_destination(&stream)?;
    log::info!("entry:redirect: recovered original destination {original}");
    tunnel.redirect(stream, &original.to_string()).await
}

/// Retrieves the connection's pre-DNAT destination via `getsockopt(SOL_IP,
/// SO_ORIGINAL_DST)` on the raw fd. tokio sockets are already non-blocking at
/// construction time, so unlike the original's `net.TCPConn.File()` dance
/// there is no blocking-mode fd to restore afterward.
fn original_destination(stream: &TcpStream) -> Result<SocketAddr, Error> {
    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::from((ip, port)))
}

/// Creates (or replaces) the `HTTPPROXY-REDIR` chain in the `nat` table:
/// `RETURN` for each whitelist destination, `REDIRECT --to-port listen_port`
/// for each blacklist destination, then hooks the chain into `PREROUTING`
/// and `OUTPUT`. Idempotent: any pre-existing chain is flushed first.
pub fn deploy(listen_port: u16, blacklist: &[String], whitelist: &[String]) -> Result<(), Error> {
    run_iptables(&["-t", "nat", "-N", CHAIN_NAME]).ok();
    run_iptables(&["-t", "nat", "-F", CHAIN_NAME])?;

    for dest in whitelist {
        run_iptables(&["-t", "nat", "-A", CHAIN_NAME, "-d", dest, "-j", "RETURN"])?;
    }
    let port_str = listen_port.to_string();
    for dest in blacklist {
        run_iptables(&[
            "-t", "nat", "-A", CHAIN_NAME, "-d", dest, "-p", "tcp", "-j", "REDIRECT", "--to-port", &port_str,
        ])?;
    }
    run_iptables(&["-t", "nat", "-A", "PREROUTING", "-j", CHAIN_NAME])?;
    run_iptables(&["-t", "nat", "-A", "OUTPUT", "-j", CHAIN_NAME])?;
    Ok(())
}

/// Tears down what `deploy` installed. Individual failures are logged and
/// tolerated, since a partially-deployed chain should still be removable.
pub fn undeploy() {
    for args in [
        vec!["-t", "nat", "-D", "PREROUTING", "-j", CHAIN_NAME],
        vec!["-t", "nat", "-D", "OUTPUT", "-j", CHAIN_NAME],
        vec!["-t", "nat", "-F", CHAIN_NAME],
        vec!["-t", "nat", "-X", CHAIN_NAME],
    ] {
        if let Err(e) = run_iptables(&args) {
            log::debug!("entry:redirect: undeploy step {args:?} failed (tolerated): {e}");
        }
    }
}

fn run_iptables(args: &[&str]) -> Result<(), Error> {
    let status = Command::new("iptables")
        .args(args)
        .status()
        .map_err(Error::Io)?;
    if !status.success() {
        return Err(Error::Config(format!("iptables {args:?} exited with {status}")));
    }
    Ok(())
}
