//! Half-close-aware bidirectional copy between a local client socket and an
//! upstream tunnel connection.
//!
//! Grounded on `examples/original_source/client/helper.go`'s `CopyIO`, but
//! the original's bare 1-slot-channel send/recv race (flagged in `spec.md`
//! §9 as fragile) is replaced by the rendezvous-plus-watchdog protocol from
//! `SPEC_FULL.md` §4.3: first finisher half-closes and signals, second
//! finisher fully closes, a 5s watchdog upgrades a stuck half-close to a
//! full close.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::upstream::Conn;

const WATCHDOG: Duration = Duration::from_secs(5);
const BUF_SIZE: usize = 16 * 1024;

const STATE_RUNNING: u8 = 0;
const STATE_HALF_CLOSED: u8 = 1;
const STATE_DONE: u8 = 2;

struct Rendezvous {
    state: AtomicU8,
    notify: Notify,
}

/// Splices `client` and `upstream` until both directions have closed. This
/// is the body of `Tunnel::dial`/`redirect`'s final step once a CONNECT
/// tunnel is established.
pub async fn splice(client: TcpStream, upstream: Conn) {
    let half_close_capable = matches!(upstream, Conn::Plain(_));
    let client_fd = {
        use std::os::unix::io::AsRawFd;
        client.as_raw_fd()
    };
    let upstream_fd = upstream.raw_fd();

    let (client_rd, client_wr) = split(client);
    let (upstream_rd, upstream_wr) = split(upstream);

    if !half_close_capable {
        full_close_splice(client_rd, client_wr, upstream_rd, upstream_wr).await;
        return;
    }

    let rendezvous = Arc::new(Rendezvous { state: AtomicU8::new(STATE_RUNNING), notify: Notify::new() });

    let r1 = rendezvous.clone();
    let fwd = tokio::spawn(async move {
        let mut client_rd = client_rd;
        let mut upstream_wr = upstream_wr;
        let _ = copy_loop(&mut client_rd, &mut upstream_wr).await;
        on_direction_done(&r1, upstream_fd, client_fd).await;
    });

    let r2 = rendezvous.clone();
    let rev = tokio::spawn(async move {
        let mut upstream_rd = upstream_rd;
        let mut client_wr = client_wr;
        let _ = copy_loop(&mut upstream_rd, &mut client_wr).await;
        on_direction_done(&r2, client_fd, upstream_fd).await;
    });

    let watchdog_rendezvous = rendezvous.clone();
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(WATCHDOG).await;
        if watchdog_rendezvous.state.load(Ordering::SeqCst) == STATE_HALF_CLOSED {
            log::debug!("tunnel: half-close watchdog fired, forcing full close");
            unsafe {
                libc::shutdown(client_fd, libc::SHUT_RDWR);
                libc::shutdown(upstream_fd, libc::SHUT_RDWR);
            }
            watchdog_rendezvous.state.store(STATE_DONE, Ordering::SeqCst);
            watchdog_rendezvous.notify.notify_waiters();
        }
    });

    let _ = tokio::join!(fwd, rev);
    watchdog.abort();
}

/// A client→upstream forward copy started ahead of the CONNECT response
/// being confirmed (see `spawn_forward`), together with the rendezvous state
/// its eventual reverse direction joins.
pub struct ForwardTask {
    handle: tokio::task::JoinHandle<()>,
    rendezvous: Arc<Rendezvous>,
}

/// Starts copying `client_rd` into `upstream_wr` immediately, ahead of any
/// confirmation that the upstream accepted the CONNECT. The caller already
/// told its own client the tunnel is established, so the client's bytes may
/// already be in flight — this is the zero-RTT half of `Tunnel::redirect`.
pub fn spawn_forward(
    client_rd: ReadHalf<TcpStream>,
    upstream_wr: WriteHalf<Conn>,
    client_fd: RawFd,
    upstream_fd: RawFd,
) -> ForwardTask {
    let rendezvous = Arc::new(Rendezvous { state: AtomicU8::new(STATE_RUNNING), notify: Notify::new() });
    let r1 = rendezvous.clone();
    let handle = tokio::spawn(async move {
        let mut client_rd = client_rd;
        let mut upstream_wr = upstream_wr;
        let _ = copy_loop(&mut client_rd, &mut upstream_wr).await;
        on_direction_done(&r1, upstream_fd, client_fd).await;
    });
    ForwardTask { handle, rendezvous }
}

/// Tears down a `spawn_forward`ed copy that will never be joined with a
/// reverse direction, because the CONNECT it was racing against was
/// rejected. Aborts the task and closes both ends.
pub fn abort_forward(forward: ForwardTask, client_fd: RawFd, upstream_fd: RawFd) {
    forward.handle.abort();
    unsafe {
        libc::shutdown(client_fd, libc::SHUT_RDWR);
        libc::shutdown(upstream_fd, libc::SHUT_RDWR);
    }
}

/// Completes a splice whose forward direction is already running (per
/// `spawn_forward`): replays `leading` (any bytes of the upstream response
/// already read past the CONNECT response head) onto the client, starts the
/// reverse direction, and runs the same half-close/watchdog protocol as
/// `splice` to completion.
pub async fn join_reverse(
    forward: ForwardTask,
    client_wr: WriteHalf<TcpStream>,
    upstream_rd: ReadHalf<Conn>,
    leading: Vec<u8>,
    client_fd: RawFd,
    upstream_fd: RawFd,
    half_close_capable: bool,
) {
    let rendezvous = forward.rendezvous.clone();
    let rev = tokio::spawn(async move {
        let mut upstream_rd = upstream_rd;
        let mut client_wr = client_wr;
        if !leading.is_empty() && client_wr.write_all(&leading).await.is_err() {
            return;
        }
        let _ = copy_loop(&mut upstream_rd, &mut client_wr).await;
        on_direction_done(&rendezvous, client_fd, upstream_fd).await;
    });

    if !half_close_capable {
        let mut fwd = forward.handle;
        let mut rev = rev;
        tokio::select! {
            _ = &mut fwd => {}
            _ = &mut rev => {}
        }
        unsafe {
            libc::shutdown(client_fd, libc::SHUT_RDWR);
            libc::shutdown(upstream_fd, libc::SHUT_RDWR);
        }
        let _ = tokio::join!(fwd, rev);
        return;
    }

    let watchdog_rendezvous = forward.rendezvous.clone();
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(WATCHDOG).await;
        if watchdog_rendezvous.state.load(Ordering::SeqCst) == STATE_HALF_CLOSED {
            log::debug!("tunnel: half-close watchdog fired, forcing full close");
            unsafe {
                libc::shutdown(client_fd, libc::SHUT_RDWR);
                libc::shutdown(upstream_fd, libc::SHUT_RDWR);
            }
            watchdog_rendezvous.state.store(STATE_DONE, Ordering::SeqCst);
            watchdog_rendezvous.notify.notify_waiters();
        }
    });

    let _ = tokio::join!(forward.handle, rev);
    watchdog.abort();
}

/// Called when one copy direction finishes. `dst_fd`/`src_fd` are the raw
/// fds of that direction's destination and source (the direction that just
/// finished reading `src_fd` to exhaustion). First finisher half-closes;
/// second finisher fully closes both ends.
async fn on_direction_done(rendezvous: &Rendezvous, dst_fd: RawFd, src_fd: RawFd) {
    let prev = rendezvous.state.swap(STATE_HALF_CLOSED, Ordering::SeqCst);
    match prev {
        STATE_RUNNING => {
            unsafe {
                libc::shutdown(dst_fd, libc::SHUT_WR);
                libc::shutdown(src_fd, libc::SHUT_RD);
            }
            rendezvous.notify.notify_waiters();
        }
        _ => {
            // Either the other direction already half-closed, or the
            // watchdog already forced a full close. Either way this is the
            // second (or redundant) finisher: close everything.
            unsafe {
                libc::shutdown(dst_fd, libc::SHUT_RDWR);
                libc::shutdown(src_fd, libc::SHUT_RDWR);
            }
            rendezvous.state.store(STATE_DONE, Ordering::SeqCst);
            rendezvous.notify.notify_waiters();
        }
    }
}

/// Degraded path for endpoints that don't expose half-close (TLS upstream
/// connections): close both sides as soon as either direction finishes.
async fn full_close_splice(
    mut client_rd: ReadHalf<TcpStream>,
    mut client_wr: WriteHalf<TcpStream>,
    mut upstream_rd: ReadHalf<Conn>,
    mut upstream_wr: WriteHalf<Conn>,
) {
    tokio::select! {
        _ = copy_loop(&mut client_rd, &mut upstream_wr) => {}
        _ = copy_loop(&mut upstream_rd, &mut client_wr) => {}
    }
    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;
}

async fn copy_loop<R, W>(src: &mut R, dst: &mut W) -> std::io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, (b, _)) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (a.unwrap(), b)
    }

    #[tokio::test]
    async fn splice_forwards_both_directions_and_completes_on_full_close() {
        let (client, client_peer) = loopback_pair().await;
        let (upstream, upstream_peer) = loopback_pair().await;

        let splice_task = tokio::spawn(splice(client, Conn::Plain(upstream)));

        let mut client_peer = client_peer;
        let mut upstream_peer = upstream_peer;

        client_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream_peer.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        client_peer.shutdown().await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        timeout(Duration::from_secs(2), splice_task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forward_direction_starts_before_reverse_is_joined() {
        let (client, mut client_peer) = loopback_pair().await;
        let (upstream, mut upstream_peer) = loopback_pair().await;

        let client_fd = client.as_raw_fd();
        let upstream_fd = upstream.raw_fd();

        client_peer.write_all(b"ping").await.unwrap();

        let (client_rd, client_wr) = split(client);
        let (upstream_rd, upstream_wr) = split(upstream);
        let forward = spawn_forward(client_rd, upstream_wr, client_fd, upstream_fd);

        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_peer.shutdown().await.unwrap();
        upstream_peer.write_all(b"pong").await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        timeout(
            Duration::from_secs(2),
            join_reverse(forward, client_wr, upstream_rd, Vec::new(), client_fd, upstream_fd, true),
        )
        .await
        .unwrap();

        let mut buf = Vec::new();
        client_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
    }
}
