//! The single owning value for a running daemon instance, replacing both the
//! original implementation's module-level `cnfg`/`client`/entrypoint globals
//! and the teacher's `unsafe static mut SHUTDOWN_TRIGGER` run-flag
//! (`system/signal.rs`) with one long-lived struct `main` holds and drives.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bogusdns::BogusTable;
use crate::config::Config;
use crate::entry;
use crate::error::Error;
use crate::gfwlist::{GfwList, GfwListStore};
use crate::tunnel::Tunnel;
use crate::upstream::UpstreamEndpoint;

pub struct Proxy {
    tunnel: Arc<Tunnel>,
    #[allow(dead_code)]
    gfwlist: Arc<GfwListStore>,
    bogus_serializer: Option<JoinHandle<()>>,
    bogus_server: Option<JoinHandle<()>>,
    entry_tasks: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    redirect_deployed: bool,
}

impl Proxy {
    /// Builds every component from `cfg` and starts each configured
    /// entrypoint. An entrypoint whose listen address is empty is simply not
    /// started, matching the original's per-field opt-in behavior.
    pub async fn start(cfg: Config) -> Result<Proxy, Error> {
        let mut endpoint = UpstreamEndpoint::parse(&cfg.listen, &cfg.hostname, cfg.insecure)?;
        if !cfg.username.is_empty() || !cfg.password.is_empty() {
            endpoint.username = cfg.username.clone();
            endpoint.password = cfg.password.clone();
        }

        let (bogus, bogus_serializer, bogus_server) = if cfg.dns.is_empty() {
            (None, None, None)
        } else {
            let prefix: Ipv4Addr = cfg
                .dnsprefix
                .parse()
                .map_err(|_| Error::Config(format!("invalid dnsprefix: {:?}", cfg.dnsprefix)))?;
            let (table, serializer) = BogusTable::spawn(prefix, Duration::from_secs(cfg.dnsttl));
            let socket = tokio::net::UdpSocket::bind(&cfg.dns).await.map_err(Error::Io)?;
            log::info!("bogusdns listening on {}", cfg.dns);
            let dns_ttl = Duration::from_secs(cfg.dnsttl);
            let server_table = table.clone();
            let server = tokio::spawn(async move {
                if let Err(e) = server_table.serve(socket, dns_ttl).await {
                    log::error!("bogusdns: server task ended: {e}");
                }
            });
            (Some(table), Some(serializer), Some(server))
        };

        let gfwlist = Arc::new(GfwListStore::new(load_initial_gfwlist(&cfg).await?));

        let tunnel = Arc::new(Tunnel::new(
            endpoint,
            cfg.maxconn,
            Duration::from_secs(cfg.idletime),
            bogus.clone(),
            gfwlist.clone(),
        ));

        if let Some(path) = &cfg.dnsmasq_cfg {
            if cfg.dns.is_empty() {
                log::warn!("dnsmasq_cfg set but dns is empty; skipping dnsmasq export");
            } else if let Err(e) = write_dnsmasq_cfg(path, &gfwlist.load(), &cfg.dns) {
                log::warn!("failed to write dnsmasq config to {path:?}: {e}");
            }
        }

        let mut entry_tasks = Vec::new();
        if !cfg.http.is_empty() {
            entry_tasks.push(spawn_entry("entry:http", entry::http::start(cfg.http.clone(), tunnel.clone())));
        }
        if !cfg.socks.is_empty() {
            entry_tasks.push(spawn_entry("entry:socks", entry::socks::start(cfg.socks.clone(), tunnel.clone())));
        }
        let redirect_deployed = if !cfg.redirect.is_empty() {
            entry_tasks
                .push(spawn_entry("entry:redirect", entry::redirect::start(cfg.redirect.clone(), tunnel.clone())));
            deploy_redirect(&cfg, &gfwlist.load())
        } else {
            false
        };
        if !cfg.tproxy.is_empty() {
            entry_tasks
                .push(spawn_entry("entry:tproxy", entry::transparent::start(cfg.tproxy.clone(), tunnel.clone())));
        }

        let sweep_tunnel = tunnel.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if sweep_tunnel.is_cancelled() {
                    return;
                }
                sweep_tunnel.sweep_idle().await;
            }
        });

        if let Some(cmd) = &cfg.after_start {
            run_after_start(cmd);
        }

        Ok(Proxy { tunnel, gfwlist, bogus_serializer, bogus_server, entry_tasks, sweeper, redirect_deployed })
    }

    /// Shutdown sequence per the concurrency model: stop each entrypoint
    /// listener (accepts unblock on the next loop check), cancel the tunnel
    /// (in-flight dials fail fast), release the pool, then stop the bogus
    /// DNS serializer.
    pub async fn shutdown(self) {
        log::info!("proxy: shutting down");
        self.tunnel.cancel();
        for task in &self.entry_tasks {
            task.abort();
        }
        self.sweeper.abort();
        self.tunnel.shutdown().await;
        if self.redirect_deployed {
            entry::redirect::undeploy();
        }
        if let Some(server) = self.bogus_server {
            server.abort();
        }
        if let Some(serializer) = self.bogus_serializer {
            serializer.abort();
        }
        log::info!("proxy: shutdown complete");
    }
}

/// Installs the `redirect` entrypoint's iptables REDIRECT chain, sourcing
/// the blacklist/whitelist domains from the already-loaded GFWList. Failure
/// is logged and non-fatal: the REDIRECT listener still runs, it simply
/// never receives traffic until the chain is installed out-of-band.
fn deploy_redirect(cfg: &Config, list: &GfwList) -> bool {
    let Some((_, port_str)) = crate::addr::split_host_port(&cfg.redirect) else {
        log::warn!("redirect: invalid listen address {:?}, skipping iptables deploy", cfg.redirect);
        return false;
    };
    let Ok(listen_port) = port_str.parse::<u16>() else {
        log::warn!("redirect: invalid listen port {:?}, skipping iptables deploy", port_str);
        return false;
    };
    let (blacklist, whitelist) = list.export_domains();
    match entry::redirect::deploy(listen_port, &blacklist, &whitelist) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("redirect: failed to deploy iptables chain: {e}");
            false
        }
    }
}

fn spawn_entry<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            log::error!("{name}: entrypoint stopped: {e}");
        }
    })
}

async fn load_initial_gfwlist(cfg: &Config) -> Result<GfwList, Error> {
    let Some(url) = &cfg.gfwlist_url else { return Ok(GfwList::new()) };
    match fetch_gfwlist(url).await {
        Ok(list) => Ok(list),
        Err(e) => {
            log::warn!("gfwlist: failed to fetch {url}: {e}; starting with an empty list");
            Ok(GfwList::new())
        }
    }
}

/// Fetches and decodes a GFWList from `url`, mirroring
/// `examples/original_source/client/gfwlist.go`'s `Update`: a plain GET
/// followed by `Extract` on the base64-encoded body.
async fn fetch_gfwlist(url: &str) -> Result<GfwList, Error> {
    let resp = reqwest::get(url).await.map_err(|e| Error::GfwList(format!("fetch failed: {e}")))?;
    let body = resp.bytes().await.map_err(|e| Error::GfwList(format!("read failed: {e}")))?;
    GfwList::extract(&body, true)
}

/// Emits a dnsmasq-format config directing every blacklist-exported domain
/// at the bogus DNS server, so a dnsmasq instance in front of this daemon
/// can be told which names to resolve here rather than normally.
fn write_dnsmasq_cfg(path: &str, list: &GfwList, dns_addr: &str) -> Result<(), Error> {
    let (blacklist, _whitelist) = list.export_domains();
    let server_ip = crate::addr::split_host_port(dns_addr).map(|(host, _)| host).unwrap_or(dns_addr);
    let mut out = String::with_capacity(blacklist.len() * 24);
    for domain in &blacklist {
        out.push_str(&format!("server=/{domain}/{server_ip}\n"));
    }
    std::fs::write(path, out).map_err(Error::Io)
}

fn run_after_start(cmd: &str) {
    log::info!("proxy: running after_start command");
    match std::process::Command::new("sh").arg("-c").arg(cmd).status() {
        Ok(status) if !status.success() => {
            log::warn!("proxy: after_start command exited with {status}");
        }
        Err(e) => log::warn!("proxy: failed to run after_start command: {e}"),
        _ => {}
    }
}
