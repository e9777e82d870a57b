//! UDP DNS responder that synthesizes deterministic fake IPv4 addresses for
//! hostnames, and reverses them back.
//!
//! Grounded on `examples/original_source/client/bogusdns.go`: same FNV-1a-64
//! seeded bit-rotation probe sequence, same 64-probe bound, same slot↔IP
//! octet layout. The single-writer discipline from `SPEC_FULL.md` §5 replaces
//! the original's bare `IPIndex [65536]*bogusItem` array with one
//! `arc_swap::ArcSwapOption` per slot (lock-free reads, single serializer
//! task for writes) and fixes the original's self-recursive `Shutdown`/
//! `Close` bug (see `DESIGN.md`). DNS wire types come from `hickory-proto`,
//! per the DNS-focused repo in the example pack
//! (`ferrous-networking-Ferrous-DNS`) rather than hand-rolled byte layout.

mod fnv;
mod wire;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
pub use fnv::fnv1a64;

const SLOT_COUNT: usize = 65536;

#[derive(Clone)]
struct SlotEntry {
    hostname: String,
    created_at: Instant,
}

struct AssignRequest {
    slot: u16,
    hostname: String,
    reply: oneshot::Sender<bool>,
}

pub struct BogusTable {
    slots: Vec<ArcSwapOption<SlotEntry>>,
    ip_prefix: Ipv4Addr,
    ttl: Duration,
    assign_tx: std::sync::Mutex<Option<mpsc::Sender<AssignRequest>>>,
}

impl BogusTable {
    /// Spawns the table plus its dedicated single-writer serializer task.
    /// `dns_ttl` is the DNS answer TTL; the slot eligibility TTL is `2 *
    /// dns_ttl`, per the original's `NewBogusDNS`.
    pub fn spawn(ip_prefix: Ipv4Addr, dns_ttl: Duration) -> (Arc<BogusTable>, tokio::task::JoinHandle<()>) {
        let mut slots = Vec::with_capacity(SLOT_COUNT);
        for _ in 0..SLOT_COUNT {
            slots.push(ArcSwapOption::empty());
        }
        let (assign_tx, mut assign_rx) = mpsc::channel::<AssignRequest>(1024);
        let table = Arc::new(BogusTable {
            slots,
            ip_prefix,
            ttl: dns_ttl * 2,
            assign_tx: std::sync::Mutex::new(Some(assign_tx)),
        });

        let writer_table = table.clone();
        let serializer = tokio::spawn(async move {
            while let Some(req) = assign_rx.recv().await {
                let idx = req.slot as usize;
                let now = Instant::now();
                let eligible = match writer_table.slots[idx].load_full() {
                    None => true,
                    Some(entry) => {
                        entry.hostname == req.hostname || now.duration_since(entry.created_at) > writer_table.ttl
                    }
                };
                if eligible {
                    writer_table.slots[idx]
                        .store(Some(Arc::new(SlotEntry { hostname: req.hostname, created_at: now })));
                }
                let _ = req.reply.send(eligible);
            }
            log::debug!("bogusdns: serializer task drained, exiting");
        });

        (table, serializer)
    }

    /// Closes the assignment channel, which drains and stops the serializer
    /// task. Per the Open Question in `spec.md` §9, this does *not*
    /// recursively re-invoke itself; the caller separately aborts the UDP
    /// `serve` task's `JoinHandle`.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.assign_tx.lock() {
            guard.take();
        }
        log::debug!("bogusdns: assignment channel closed");
    }

    /// Assigns (or refreshes) a slot for `hostname`, returning the
    /// synthesized IPv4 address.
    pub async fn get_ip(&self, hostname: &str) -> Result<Ipv4Addr, Error> {
        let seed = fnv1a64(hostname.as_bytes());
        for i in 0..64u32 {
            let slot = probe_slot(seed, i);
            let idx = slot as usize;
            let locally_eligible = match self.slots[idx].load_full() {
                None => true,
                Some(entry) => {
                    entry.hostname == hostname
                        || Instant::now().duration_since(entry.created_at) > self.ttl
                }
            };
            if !locally_eligible {
                continue;
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            let sender = self
                .assign_tx
                .lock()
                .ok()
                .and_then(|guard| guard.clone())
                .ok_or_else(|| Error::BogusDns("serializer task is shut down".to_string()))?;
            if sender
                .send(AssignRequest { slot, hostname: hostname.to_string(), reply: reply_tx })
                .await
                .is_err()
            {
                return Err(Error::BogusDns("serializer task is gone".to_string()));
            }
            if reply_rx.await.unwrap_or(false) {
                return Ok(to_ip(self.ip_prefix, slot));
            }
        }
        Err(Error::SlotsExhausted { host: hostname.to_string() })
    }

    /// Reverses a synthesized IP back to its hostname.
    pub fn get_address(&self, ip: Ipv4Addr) -> Result<String, Error> {
        let slot = from_ip(self.ip_prefix, ip).ok_or_else(|| {
            Error::BogusDns(format!("{ip} is not within the bogus prefix {}", self.ip_prefix))
        })?;
        match self.slots[slot as usize].load_full() {
            Some(entry) => Ok(entry.hostname.clone()),
            None => Err(Error::BogusDns(format!("slot {slot} is unassigned"))),
        }
    }

    /// Runs the UDP DNS server until the socket errors or the task is
    /// aborted. Only `A` queries are answered; everything else gets an
    /// empty (NOERROR, no records) response.
    pub async fn serve(self: Arc<Self>, socket: UdpSocket, dns_ttl: Duration) -> Result<(), Error> {
        let mut buf = [0u8; 512];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            let reply = match wire::handle_query(&self, &buf[..len], dns_ttl).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::debug!("bogusdns: malformed query from {peer}: {e}");
                    continue;
                }
            };
            if let Err(e) = socket.send_to(&reply, peer).await {
                log::debug!("bogusdns: send to {peer} failed: {e}");
            }
        }
    }
}

/// Computes probe `i`'s slot for a given FNV seed: rotate the 64-bit seed by
/// `i` bits and mask to 16 bits.
fn probe_slot(seed: u64, i: u32) -> u16 {
    let rotated = if i == 0 { seed } else { (seed >> i) | (seed << (64 - i)) };
    (rotated & 0xFFFF) as u16
}

fn to_ip(prefix: Ipv4Addr, slot: u16) -> Ipv4Addr {
    let o = prefix.octets();
    Ipv4Addr::new(o[0], o[1], (slot >> 8) as u8, (slot & 0xff) as u8)
}

fn from_ip(prefix: Ipv4Addr, ip: Ipv4Addr) -> Option<u16> {
    let p = prefix.octets();
    let o = ip.octets();
    if o[0] != p[0] || o[1] != p[1] {
        return None;
    }
    Some(((o[2] as u16) << 8) | o[3] as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_hostname_through_ip() {
        let (table, _serializer) = BogusTable::spawn("10.24.0.0".parse().unwrap(), Duration::from_secs(60));
        let ip = table.get_ip("foo.test").await.unwrap();
        let back = table.get_address(ip).unwrap();
        assert_eq!(back, "foo.test");
    }

    #[tokio::test]
    async fn repeated_lookup_is_stable_within_ttl() {
        let (table, _serializer) = BogusTable::spawn("10.24.0.0".parse().unwrap(), Duration::from_secs(60));
        let ip1 = table.get_ip("foo.test").await.unwrap();
        let ip2 = table.get_ip("foo.test").await.unwrap();
        assert_eq!(ip1, ip2);
    }

    #[tokio::test]
    async fn different_hostnames_usually_get_different_slots() {
        let (table, _serializer) = BogusTable::spawn("10.24.0.0".parse().unwrap(), Duration::from_secs(60));
        let ip_a = table.get_ip("a.test").await.unwrap();
        let ip_b = table.get_ip("b.test").await.unwrap();
        assert_ne!(ip_a, ip_b);
    }

    #[test]
    fn address_outside_prefix_errors() {
        let (table, _serializer) = BogusTable::spawn("10.24.0.0".parse().unwrap(), Duration::from_secs(60));
        let err = table.get_address("8.8.8.8".parse().unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn to_ip_from_ip_round_trip_all_slots() {
        let prefix: Ipv4Addr = "10.24.0.0".parse().unwrap();
        for slot in [0u16, 1, 255, 256, 65535, 32768] {
            let ip = to_ip(prefix, slot);
            assert_eq!(from_ip(prefix, ip), Some(slot));
        }
    }
}
