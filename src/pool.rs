//! Bounded idle-connection pool with a liveness probe.
//!
//! Grounded on `examples/other_examples/00ab0c5a_duan78-proxy-rs__src-server-connection_pool.rs.rs`
//! for the overall shape (a `Mutex`-guarded idle queue plus a background
//! sweeper), adapted to this spec's single-upstream, blocking-on-exhaustion
//! semantics (§4.1) rather than that example's per-destination pool map.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::Error;
use crate::upstream::{Conn, UpstreamEndpoint};

const PROBE_DEADLINE: Duration = Duration::from_micros(10);

struct Idle {
    conn: Conn,
    last_used_at: Instant,
}

struct Inner {
    idle: Mutex<VecDeque<Idle>>,
    total: std::sync::atomic::AtomicUsize,
    max_cap: usize,
    idle_timeout: Duration,
    endpoint: UpstreamEndpoint,
}

/// Bounded FIFO pool of idle connections to a single upstream.
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    pub fn new(endpoint: UpstreamEndpoint, max_cap: usize, idle_timeout: Duration) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(Inner {
                idle: Mutex::new(VecDeque::new()),
                total: std::sync::atomic::AtomicUsize::new(0),
                max_cap,
                idle_timeout,
                endpoint,
            }),
        }
    }

    /// Acquires a live connection: a pooled one that survives the liveness
    /// probe, or a freshly dialed one if the pool has spare capacity.
    pub async fn get(&self) -> Result<Conn, Error> {
        loop {
            let popped = {
                let mut idle = self.inner.idle.lock().await;
                idle.pop_front()
            };
            let Some(candidate) = popped else {
                return self.dial_new().await;
            };
            if probe_alive(&candidate.conn).await {
                return Ok(candidate.conn);
            }
            // Probe found the peer had already closed the connection; drop
            // it and retry against the next idle entry (or dial fresh).
            self.inner.total.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    async fn dial_new(&self) -> Result<Conn, Error> {
        use std::sync::atomic::Ordering;
        loop {
            let total = self.inner.total.load(Ordering::SeqCst);
            if total >= self.inner.max_cap {
                return Err(Error::PoolExhausted { max: self.inner.max_cap });
            }
            if self
                .inner
                .total
                .compare_exchange(total, total + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        match self.inner.endpoint.connect().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.inner.total.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Returns a connection to the idle pool, or closes it if the pool is
    /// already at capacity.
    pub async fn put(&self, conn: Conn) {
        let mut idle = self.inner.idle.lock().await;
        if idle.len() >= self.inner.max_cap {
            self.inner.total.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            drop(conn);
            return;
        }
        idle.push_back(Idle { conn, last_used_at: Instant::now() });
    }

    /// A connection that will never reenter the pool (surrendered to a
    /// `Dial`/`Redirect` caller) decrements the total count it was charged
    /// against at acquisition time.
    pub fn surrender(&self) {
        self.inner.total.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Closes idle entries older than `idle_timeout`. Intended to be driven
    /// by a periodic background task owned by `Proxy`.
    pub async fn sweep_expired(&self) {
        let mut idle = self.inner.idle.lock().await;
        let before = idle.len();
        idle.retain(|e| e.last_used_at.elapsed() < self.inner.idle_timeout);
        let removed = before - idle.len();
        if removed > 0 {
            self.inner.total.fetch_sub(removed, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Closes every idle connection; called during shutdown.
    pub async fn close_all(&self) {
        let mut idle = self.inner.idle.lock().await;
        self.inner.total.fetch_sub(idle.len(), std::sync::atomic::Ordering::SeqCst);
        idle.clear();
    }
}

/// Per spec §4.1: set a read deadline one read-unit (10 µs) in the future,
/// attempt a 1-byte non-blocking peek. EOF poisons; a timeout/would-block
/// means the connection is still usable. Actual data on an idle pooled
/// connection is anomalous and also poisons. Uses `MSG_PEEK` on the raw fd
/// so the probe never consumes bytes, which matters equally for plaintext
/// and TLS connections (peeking below the TLS record layer).
async fn probe_alive(conn: &Conn) -> bool {
    let _ = timeout(PROBE_DEADLINE, conn.readable()).await;
    match peek_one_byte(conn.raw_fd()) {
        PeekResult::Eof => false,
        PeekResult::Data => false,
        PeekResult::WouldBlock => true,
        PeekResult::Error => false,
    }
}

enum PeekResult {
    Eof,
    Data,
    WouldBlock,
    Error,
}

fn peek_one_byte(fd: RawFd) -> PeekResult {
    let mut byte = [0u8; 1];
    let n = unsafe {
        libc::recv(fd, byte.as_mut_ptr() as *mut libc::c_void, 1, libc::MSG_PEEK | libc::MSG_DONTWAIT)
    };
    if n == 0 {
        PeekResult::Eof
    } else if n > 0 {
        PeekResult::Data
    } else {
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock => PeekResult::WouldBlock,
            _ => PeekResult::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Scheme;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use tokio::net::TcpListener;

    fn endpoint_for(addr: std::net::SocketAddr) -> UpstreamEndpoint {
        UpstreamEndpoint {
            scheme: Scheme::Plaintext,
            host: addr.ip().to_string(),
            port: addr.port(),
            username: String::new(),
            password: String::new(),
            sni: String::new(),
            insecure_skip_verify: false,
        }
    }

    #[tokio::test]
    async fn dead_pooled_connection_is_never_returned_from_get() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(StdAtomicUsize::new(0));
        let accepts_task = accepts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else { return };
                accepts_task.fetch_add(1, StdOrdering::SeqCst);
                drop(conn);
            }
        });

        let pool = ConnectionPool::new(endpoint_for(addr), 4, Duration::from_secs(60));
        let conn = pool.get().await.unwrap();
        pool.put(conn).await;

        // Give the listener's accept task a moment to actually close the
        // socket before the next `get` probes it.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _conn = pool.get().await.unwrap();
        assert_eq!(accepts.load(StdOrdering::SeqCst), 2, "stale connection should have been discarded, not reused");
    }

    #[tokio::test]
    async fn surrendered_connection_frees_pool_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else { return };
                drop(conn);
            }
        });

        let pool = ConnectionPool::new(endpoint_for(addr), 1, Duration::from_secs(60));
        let conn = pool.get().await.unwrap();
        pool.surrender();
        drop(conn);

        let result = pool.get().await;
        assert!(result.is_ok(), "surrender should have freed capacity for a new dial");
    }
}
