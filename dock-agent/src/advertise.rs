//! mDNS advertisement: announce this Agent under the well-known service
//! type so Hubs find it without manual configuration.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};

/// Well-known service type browsed by Hubs.
pub const SERVICE_TYPE: &str = "_gamedock._tcp.local.";

/// TXT attribute keys carried in the advertisement.
pub const TXT_ID: &str = "id";
pub const TXT_NAME: &str = "name";
pub const TXT_PLATFORM: &str = "platform";
pub const TXT_VERSION: &str = "version";

pub struct Advertiser {
    daemon: ServiceDaemon,
    registered: Option<String>,
}

impl Advertiser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().context("failed to create mDNS daemon")?;
        Ok(Self {
            daemon,
            registered: None,
        })
    }

    /// Register the advertisement. `port` is the actually bound port, not
    /// the configured one. Re-registering unregisters the old record first.
    pub fn start(&mut self, agent_id: &str, name: &str, version: &str, port: u16) -> Result<()> {
        if let Some(fullname) = self.registered.take() {
            let _ = self.daemon.unregister(&fullname);
        }

        let ips = advertisable_ips();
        anyhow::ensure!(!ips.is_empty(), "no advertisable IPv4 address found");

        let txt = HashMap::from([
            (TXT_ID.to_string(), agent_id.to_string()),
            (TXT_NAME.to_string(), name.to_string()),
            (TXT_PLATFORM.to_string(), std::env::consts::OS.to_string()),
            (TXT_VERSION.to_string(), version.to_string()),
        ]);

        let hostname = format!("{agent_id}.local.");
        let ip_strings: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            agent_id,
            &hostname,
            ip_strings.join(",").as_str(),
            port,
            txt,
        )
        .context("failed to build mDNS service info")?;

        let fullname = service_info.get_fullname().to_string();
        self.daemon
            .register(service_info)
            .context("failed to register mDNS service")?;
        tracing::info!(%fullname, port, "advertising agent");
        self.registered = Some(fullname);
        Ok(())
    }

    /// Unregister. Safe no-op if never started.
    pub fn stop(&mut self) {
        if let Some(fullname) = self.registered.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                tracing::warn!("failed to unregister mDNS service: {e}");
            } else {
                tracing::info!(%fullname, "stopped advertising");
            }
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
        // Give the daemon a moment to send the goodbye packet before its
        // background thread goes away.
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}

/// Local IPv4 addresses worth advertising: never loopback, never link-local.
fn advertisable_ips() -> Vec<Ipv4Addr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => ifas
            .into_iter()
            .filter_map(|(_name, ip)| match ip {
                IpAddr::V4(v4) if is_advertisable(v4) => Some(v4),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate interfaces: {e}");
            match local_ip_address::local_ip() {
                Ok(IpAddr::V4(v4)) if is_advertisable(v4) => vec![v4],
                _ => vec![],
            }
        }
    }
}

pub(crate) fn is_advertisable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_link_local_filtered() {
        assert!(!is_advertisable(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_advertisable(Ipv4Addr::new(169, 254, 10, 2)));
        assert!(is_advertisable(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(is_advertisable(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn stop_without_start_is_noop() {
        if let Ok(mut adv) = Advertiser::new() {
            adv.stop();
            adv.stop();
        }
    }
}
