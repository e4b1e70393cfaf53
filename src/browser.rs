use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::StreamExt;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::Serialize;
use tracing::{debug, info};

use crate::utils::run_command;

/// A resolved advertisement of the pairing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowsedService {
    pub address: String,
    pub port: u16,
}

/// A local service-discovery mechanism tried before raw mDNS.
///
/// `Err` means the mechanism is unavailable (tool missing, daemon failed);
/// an empty list means it ran and found nothing.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    async fn browse(&self, service_type: &str, timeout: Duration) -> Result<Vec<BrowsedService>>;
}

/// Parses `avahi-browse -p -r` output.
///
/// Resolved lines look like
/// `=;eth0;IPv4;adb-XYZ;_adb-tls-pairing._tcp;local;host.local;192.168.1.20;37123;"txt"`.
pub fn parse_avahi_records(output: &str, service_type: &str) -> Vec<BrowsedService> {
    let mut found = Vec::new();
    for line in output.lines() {
        if !line.starts_with('=') {
            continue;
        }
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() < 9 {
            continue;
        }
        if !service_type.is_empty() && fields[4] != service_type {
            continue;
        }
        let address = fields[7].trim();
        let Ok(port) = fields[8].trim().parse::<u16>() else {
            continue;
        };
        if address.is_empty() || port == 0 {
            continue;
        }
        let service = BrowsedService {
            address: address.to_string(),
            port,
        };
        if !found.contains(&service) {
            found.push(service);
        }
    }
    found
}

/// Browses through the `avahi-browse` command.
#[derive(Debug, Clone)]
pub struct AvahiBrowser {
    program: String,
}

impl AvahiBrowser {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ServiceBrowser for AvahiBrowser {
    async fn browse(&self, service_type: &str, timeout: Duration) -> Result<Vec<BrowsedService>> {
        info!("Trying {} for discovery...", self.program);
        let args = vec!["-ptr".to_string(), service_type.to_string()];
        let output = run_command(&self.program, &args, timeout).await?;
        let found = parse_avahi_records(&output, service_type);
        debug!("{} resolved {} record(s)", self.program, found.len());
        Ok(found)
    }
}

/// Browses in-process with an `mdns-sd` daemon.
///
/// Returns as soon as at least one instance resolves, or empty at `timeout`.
#[derive(Debug, Clone, Default)]
pub struct MdnsSdBrowser;

fn preferred_address(info: &ServiceInfo) -> Option<IpAddr> {
    let addresses = info.get_addresses();
    addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()
}

#[async_trait]
impl ServiceBrowser for MdnsSdBrowser {
    async fn browse(&self, service_type: &str, timeout: Duration) -> Result<Vec<BrowsedService>> {
        let fq_type = if service_type.ends_with(".local.") {
            service_type.to_string()
        } else {
            format!("{}.local.", service_type.trim_end_matches('.'))
        };

        let mdns = ServiceDaemon::new()?;
        let receiver = mdns.browse(&fq_type)?;
        info!("Browsing for '{}'...", fq_type);

        let mut events = receiver.into_stream();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut found = Vec::new();

        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
            if let ServiceEvent::ServiceResolved(info) = event {
                debug!("Resolved: {}", info.get_fullname());
                if let Some(ip) = preferred_address(&info) {
                    found.push(BrowsedService {
                        address: ip.to_string(),
                        port: info.get_port(),
                    });
                    break;
                }
            }
        }

        if let Err(e) = mdns.stop_browse(&fq_type) {
            debug!("stop_browse failed: {}", e);
        }
        if let Err(e) = mdns.shutdown() {
            debug!("mDNS daemon shutdown failed: {}", e);
        }
        Ok(found)
    }
}
