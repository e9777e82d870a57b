//! Linux TPROXY entrypoint: a listener bound with `IP_TRANSPARENT`, where the
//! kernel preserves the original destination as the accepted socket's local
//! address.
//!
//! Grounded on `examples/original_source/client/entry_transparent.go`: "local
//! addr is the real remote address" is the whole trick — no `getsockopt`
//! dance needed once the listening socket carries `IP_TRANSPARENT`.

use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Error;
use crate::tunnel::Tunnel;

pub async fn start(addr: String, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    let listener = bind_transparent(&addr)?;
    log::info!("entry:tproxy listening on {addr}");
    super::accept_loop("entry:tproxy", listener, tunnel, |stream, peer, tunnel| async move {
        if let Err(e) = handle_connection(stream, tunnel).await {
            log::debug!("entry:tproxy: connection from {peer} ended: {e}");
        }
    })
    .await;
    Ok(())
}

/// Builds a listening socket with `IP_TRANSPARENT` set before `bind`, since
/// the option has no effect once a socket is already bound.
fn bind_transparent(addr: &str) -> Result<TcpListener, Error> {
    let sock_addr: std::net::SocketAddr =
        addr.parse().map_err(|_| Error::Config(format!("invalid tproxy listen address: {addr:?}")))?;
    let domain = if sock_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Io)?;
    socket.set_nonblocking(true).map_err(Error::Io)?;
    socket.set_reuse_address(true).map_err(Error::Io)?;
    set_ip_transparent(&socket)?;
    socket.bind(&sock_addr.into()).map_err(Error::Io)?;
    socket.listen(1024).map_err(Error::Io)?;
    TcpListener::from_std(socket.into()).map_err(Error::Io)
}

#[cfg(target_os = "linux")]
fn set_ip_transparent(socket: &Socket) -> Result<(), Error> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            libc::IP_TRANSPARENT,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

async fn handle_connection(stream: TcpStream, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    let original = stream.local_addr().map_err(Error::Io)?;
    log::info!("entry:tproxy: recovered original destination {original}");
    tunnel.redirect(stream, &original.to_string()).await
}
