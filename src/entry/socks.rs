//! Local SOCKS5 entrypoint (RFC 1928 subset: no auth, CONNECT only).
//!
//! Grounded on `examples/original_source/client/entry_socks.go`/`socks.go`:
//! same accept-loop/`dial` shape, with the external `socks-go` library's
//! handshake reimplemented directly against the RFC since this daemon
//! otherwise avoids pulling in a single-purpose protocol crate for a
//! handshake this small.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Error;
use crate::tunnel::Tunnel;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

pub async fn start(addr: String, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    let listener = super::bind(&addr).await?;
    log::info!("entry:socks listening on {addr}");
    super::accept_loop("entry:socks", listener, tunnel, |stream, peer, tunnel| async move {
        if let Err(e) = handle_connection(stream, tunnel).await {
            log::debug!("entry:socks: connection from {peer} ended: {e}");
        }
    })
    .await;
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, tunnel: Arc<Tunnel>) -> Result<(), Error> {
    stream.set_nodelay(true).ok();
    negotiate_method(&mut stream).await?;
    let target = match read_request(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            write_reply(&mut stream, REPLY_GENERAL_FAILURE).await.ok();
            return Err(e);
        }
    };
    let Some(target) = target else {
        write_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await.ok();
        return Ok(());
    };

    log::info!("entry:socks: CONNECT {target}");
    let conn = match tunnel.dial(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            write_reply(&mut stream, REPLY_CONNECTION_REFUSED).await.ok();
            return Err(e);
        }
    };
    write_reply(&mut stream, REPLY_SUCCEEDED).await?;
    tunnel.splice(stream, conn).await;
    Ok(())
}

async fn negotiate_method(stream: &mut TcpStream) -> Result<(), Error> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.map_err(Error::Io)?;
    if header[0] != VERSION {
        return Err(Error::InvalidAddress { addr: String::new(), reason: "unsupported SOCKS version" });
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await.map_err(Error::Io)?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NO_AUTH]).await.map_err(Error::Io)?;
        Ok(())
    } else {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await.map_err(Error::Io)?;
        Err(Error::InvalidAddress { addr: String::new(), reason: "client offered no acceptable auth method" })
    }
}

/// Reads a SOCKS5 request. Returns `Ok(None)` for a well-formed but
/// unsupported command (BIND/UDP ASSOCIATE), which the caller turns into a
/// "command not supported" reply rather than tearing down the connection.
async fn read_request(stream: &mut TcpStream) -> Result<Option<String>, Error> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(Error::Io)?;
    if head[0] != VERSION {
        return Err(Error::InvalidAddress { addr: String::new(), reason: "unsupported SOCKS version" });
    }
    let cmd = head[1];
    let atyp = head[3];

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.map_err(Error::Io)?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.map_err(Error::Io)?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(Error::Io)?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await.map_err(Error::Io)?;
            String::from_utf8(domain)
                .map_err(|_| Error::InvalidAddress { addr: String::new(), reason: "non-UTF8 SOCKS domain name" })?
        }
        _ => {
            return Err(Error::InvalidAddress { addr: String::new(), reason: "unknown SOCKS address type" });
        }
    };
    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await.map_err(Error::Io)?;
    let port = u16::from_be_bytes(port_bytes);

    if cmd != CMD_CONNECT {
        return Ok(None);
    }
    Ok(Some(format!("{host}:{port}")))
}

async fn write_reply(stream: &mut TcpStream, reply: u8) -> Result<(), Error> {
    // BND.ADDR/BND.PORT are unused by this client; zero-filled IPv4 per the
    // common convention for proxies that don't reveal a real bind address.
    let bound: SocketAddr = "0.0.0.0:0".parse().unwrap();
    let (host, port) = match bound {
        SocketAddr::V4(v4) => (v4.ip().octets(), v4.port()),
        SocketAddr::V6(_) => unreachable!(),
    };
    let mut resp = vec![VERSION, reply, 0x00, ATYP_IPV4];
    resp.extend_from_slice(&host);
    resp.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&resp).await.map_err(Error::Io)
}
