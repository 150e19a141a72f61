//! Agent discovery: browse the well-known mDNS service type and keep a
//! registry of sighted agents with staleness pruning.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Must match what agents advertise.
pub const SERVICE_TYPE: &str = "_gamedock._tcp.local.";

/// An agent unseen this long is pruned from the registry.
pub const STALE_TIMEOUT: Duration = Duration::from_secs(120);

/// One sighted agent, as advertised.
#[derive(Debug, Clone)]
pub struct DiscoveredAgent {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub port: u16,
    pub addrs: Vec<Ipv4Addr>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredAgent {
    /// Socket address of the first usable IP, for dialing.
    pub fn dial_addr(&self) -> Option<String> {
        self.addrs.first().map(|ip| format!("{ip}:{}", self.port))
    }
}

/// Registry change notifications. Exactly one `Lost` per pruned agent.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered(DiscoveredAgent),
    Updated(DiscoveredAgent),
    Lost(String),
}

/// Sighted-agent registry keyed by agent id.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<HashMap<String, DiscoveredAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting. First sighting is `Discovered`; a re-sighting
    /// refreshes port/addrs/last_seen, keeps `discovered_at`, and is
    /// `Updated`.
    pub fn upsert(&self, mut agent: DiscoveredAgent) -> DiscoveryEvent {
        let mut map = self.inner.write().expect("agent registry poisoned");
        match map.get(&agent.id) {
            Some(existing) => {
                agent.discovered_at = existing.discovered_at;
                map.insert(agent.id.clone(), agent.clone());
                DiscoveryEvent::Updated(agent)
            }
            None => {
                map.insert(agent.id.clone(), agent.clone());
                DiscoveryEvent::Discovered(agent)
            }
        }
    }

    /// Drop agents unseen for `stale_timeout`. Returns the pruned ids; a
    /// second call without new sightings prunes nothing.
    pub fn prune(&self, stale_timeout: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_timeout).unwrap_or(chrono::Duration::zero());
        let mut map = self.inner.write().expect("agent registry poisoned");
        let lost: Vec<String> = map
            .values()
            .filter(|a| a.last_seen < cutoff)
            .map(|a| a.id.clone())
            .collect();
        for id in &lost {
            map.remove(id);
        }
        lost
    }

    /// Find by id or by advertised name, for CLI convenience.
    pub fn find(&self, id_or_name: &str) -> Option<DiscoveredAgent> {
        let map = self.inner.read().expect("agent registry poisoned");
        map.get(id_or_name).cloned().or_else(|| {
            map.values()
                .find(|a| a.name == id_or_name)
                .cloned()
        })
    }

    pub fn list(&self) -> Vec<DiscoveredAgent> {
        let mut out: Vec<_> = self
            .inner
            .read()
            .expect("agent registry poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Browses for agents and feeds the registry. Events go out over a bounded
/// channel; a slow consumer loses events rather than stalling discovery.
pub struct DiscoveryClient {
    daemon: ServiceDaemon,
    registry: Arc<AgentRegistry>,
    events: mpsc::Sender<DiscoveryEvent>,
}

impl DiscoveryClient {
    pub fn new(registry: Arc<AgentRegistry>) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>)> {
        let daemon = ServiceDaemon::new().context("failed to create mDNS daemon")?;
        let (tx, rx) = mpsc::channel(64);
        Ok((
            Self {
                daemon,
                registry,
                events: tx,
            },
            rx,
        ))
    }

    /// One-shot browse: collect sightings until `timeout` elapses, then
    /// return the current registry contents.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredAgent>> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .context("failed to start mDNS browse")?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = receiver.recv_async() => event,
            };
            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if let Some(agent) = agent_from_service(&info) {
                        self.emit(self.registry.upsert(agent));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("mDNS receiver closed: {e}");
                    break;
                }
            }
        }
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        Ok(self.registry.list())
    }

    /// Continuous browse with staleness pruning. Returns when cancelled.
    pub async fn run_continuous(&self, prune_interval: Duration, cancel: CancellationToken) -> Result<()> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .context("failed to start mDNS browse")?;
        let mut prune_timer = tokio::time::interval(prune_interval);
        prune_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.daemon.stop_browse(SERVICE_TYPE);
                    tracing::info!("discovery shutting down");
                    return Ok(());
                }
                _ = prune_timer.tick() => {
                    for id in self.registry.prune(STALE_TIMEOUT) {
                        tracing::info!(agent = %id, "agent lost");
                        self.emit(DiscoveryEvent::Lost(id));
                    }
                }
                event = receiver.recv_async() => {
                    match event {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            if let Some(agent) = agent_from_service(&info) {
                                self.emit(self.registry.upsert(agent));
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            anyhow::bail!("mDNS receiver closed: {e}");
                        }
                    }
                }
            }
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        // Send-or-drop: discovery never blocks on a slow consumer.
        if self.events.try_send(event).is_err() {
            tracing::debug!("discovery event dropped: channel full");
        }
    }
}

fn agent_from_service(info: &mdns_sd::ServiceInfo) -> Option<DiscoveredAgent> {
    let id = info.get_property_val_str("id")?.to_string();
    let addrs: Vec<Ipv4Addr> = info
        .get_addresses()
        .iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(v4) if usable_ip(*v4) => Some(*v4),
            _ => None,
        })
        .collect();
    if addrs.is_empty() {
        tracing::debug!(fullname = %info.get_fullname(), "skipping agent with no usable address");
        return None;
    }
    let now = Utc::now();
    Some(DiscoveredAgent {
        id,
        name: info
            .get_property_val_str("name")
            .unwrap_or_default()
            .to_string(),
        platform: info
            .get_property_val_str("platform")
            .unwrap_or_default()
            .to_string(),
        version: info
            .get_property_val_str("version")
            .unwrap_or_default()
            .to_string(),
        port: info.get_port(),
        addrs,
        discovered_at: now,
        last_seen: now,
    })
}

fn usable_ip(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local()
}
