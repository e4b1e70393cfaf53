//! Discovery and pairing with a device advertising the ADB pairing service.
//!
//! A run first asks the configured [`ServiceBrowser`]; when that is missing
//! or finds nothing, it joins the mDNS group itself, retransmits a PTR query
//! on a fixed period, and pairs with every candidate the [`PortHeuristic`]
//! pulls out of the responses until one succeeds or the run deadline passes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adb::{PairingInvoker, pairing_succeeded};
use crate::browser::ServiceBrowser;
use crate::channel::{DatagramChannel, MulticastChannel};
use crate::config::DiscoverySettings;
use crate::events::{DiscoveryEvents, NoopEvents};
use crate::models::{CandidateEndpoint, PairingOutcome, PairingSecret, pairing_descriptor};
use crate::wire::{DiscoveryQuery, MDNS_GROUP, PortHeuristic};

const RECV_BUFFER: usize = 9000;

/// Opens the datagram channel for the raw mDNS path.
pub type ChannelOpener =
    Arc<dyn Fn(&DiscoverySettings) -> Result<Arc<dyn DatagramChannel>> + Send + Sync>;

fn open_multicast(settings: &DiscoverySettings) -> Result<Arc<dyn DatagramChannel>> {
    Ok(Arc::new(MulticastChannel::open(MDNS_GROUP, settings.mdns_port)?))
}

/// Text that marks a response as relevant: the first label of the service
/// type and its protocol stem (`_adb-tls-pairing` and `adb`).
fn service_markers(service_type: &str) -> Vec<String> {
    let first = service_type.split('.').next().unwrap_or_default();
    let mut markers = vec![first.to_string()];
    let stem = first.trim_start_matches('_').split('-').next().unwrap_or_default();
    if !stem.is_empty() && stem != first {
        markers.push(stem.to_string());
    }
    markers
}

/// Endpoints already attempted during one run.
#[derive(Default)]
struct RunState {
    tried: HashSet<CandidateEndpoint>,
}

pub struct Discoverer {
    settings: DiscoverySettings,
    pairing: Arc<dyn PairingInvoker>,
    browser: Option<Arc<dyn ServiceBrowser>>,
    events: Arc<dyn DiscoveryEvents>,
    open_channel: ChannelOpener,
    heuristic: PortHeuristic,
}

impl Discoverer {
    pub fn new(settings: DiscoverySettings, pairing: Arc<dyn PairingInvoker>) -> Self {
        let (low, high) = settings.port_range;
        let heuristic = PortHeuristic::new(service_markers(&settings.service_type), low..=high);
        Self {
            settings,
            pairing,
            browser: None,
            events: Arc::new(NoopEvents),
            open_channel: Arc::new(open_multicast),
            heuristic,
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn ServiceBrowser>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn DiscoveryEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_channel_opener(mut self, opener: ChannelOpener) -> Self {
        self.open_channel = opener;
        self
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    /// QR payload for `secret` under the configured instance name.
    pub fn descriptor(&self, secret: &PairingSecret) -> String {
        pairing_descriptor(&self.settings.instance_name, secret)
    }

    pub async fn discover_and_pair(&self, secret: &PairingSecret, timeout: Duration) -> PairingOutcome {
        self.discover_and_pair_until(secret, timeout, CancellationToken::new())
            .await
    }

    /// One bounded discovery run. Cancelling `cancel` ends it with an
    /// unpaired outcome, tearing down the channel and the retransmit task.
    pub async fn discover_and_pair_until(
        &self,
        secret: &PairingSecret,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> PairingOutcome {
        let deadline = Instant::now() + timeout;
        let mut run = RunState::default();

        if let Some(outcome) = self.pair_via_browser(secret, deadline, &cancel, &mut run).await {
            return outcome;
        }
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return PairingOutcome::unpaired();
        }

        let channel = match (self.open_channel)(&self.settings) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Socket error: {:#}", e);
                return PairingOutcome::unpaired();
            }
        };
        self.run_channel(channel, secret, deadline, &cancel, &mut run)
            .await
    }

    /// Runs only the raw protocol path over a caller-supplied channel.
    pub async fn pair_over_channel(
        &self,
        channel: Arc<dyn DatagramChannel>,
        secret: &PairingSecret,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> PairingOutcome {
        let deadline = Instant::now() + timeout;
        self.run_channel(channel, secret, deadline, &cancel, &mut RunState::default())
            .await
    }

    /// `None` means the run should continue on the raw path.
    async fn pair_via_browser(
        &self,
        secret: &PairingSecret,
        deadline: Instant,
        cancel: &CancellationToken,
        run: &mut RunState,
    ) -> Option<PairingOutcome> {
        let browser = self.browser.as_ref()?;
        let budget = self
            .settings
            .browser_timeout()
            .min(deadline.saturating_duration_since(Instant::now()));

        let browsed = tokio::select! {
            _ = cancel.cancelled() => return Some(PairingOutcome::unpaired()),
            result = browser.browse(self.settings.bare_service_type(), budget) => result,
        };

        let found = match browsed {
            Ok(found) => found,
            Err(e) => {
                let reason = format!("{:#}", e);
                info!("Service browser not available, using direct mDNS: {}", reason);
                self.events.on_browser_unavailable(&reason);
                return None;
            }
        };
        if found.is_empty() {
            info!("Service browser found nothing, using direct mDNS");
            return None;
        }

        for service in found {
            let endpoint = CandidateEndpoint {
                address: service.address,
                port: service.port,
            };
            if self.try_candidate(&endpoint, secret, deadline, cancel, run).await {
                return Some(PairingOutcome::paired(endpoint.address));
            }
            if cancel.is_cancelled() {
                return Some(PairingOutcome::unpaired());
            }
        }
        None
    }

    async fn run_channel(
        &self,
        channel: Arc<dyn DatagramChannel>,
        secret: &PairingSecret,
        deadline: Instant,
        cancel: &CancellationToken,
        run: &mut RunState,
    ) -> PairingOutcome {
        let query = match DiscoveryQuery::new(&self.settings.service_type) {
            Ok(query) => query,
            Err(e) => {
                warn!("Invalid service type {:?}: {:#}", self.settings.service_type, e);
                channel.close();
                return PairingOutcome::unpaired();
            }
        };

        // Stops the retransmit task even if this future is dropped mid-run.
        let run_token = cancel.child_token();
        let _stop_on_drop = run_token.clone().drop_guard();

        let retransmitter = tokio::spawn(retransmit(
            Arc::clone(&channel),
            query.as_bytes().to_vec(),
            self.settings.retransmit_interval(),
            run_token.clone(),
        ));

        let outcome = self
            .listen(channel.as_ref(), secret, deadline, &run_token, run)
            .await;

        run_token.cancel();
        if let Err(e) = retransmitter.await {
            debug!("Retransmit task ended abnormally: {}", e);
        }
        channel.close();
        outcome
    }

    async fn listen(
        &self,
        channel: &dyn DatagramChannel,
        secret: &PairingSecret,
        deadline: Instant,
        cancel: &CancellationToken,
        run: &mut RunState,
    ) -> PairingOutcome {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Discovery cancelled");
                    return PairingOutcome::unpaired();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!("No device paired before the deadline");
                    return PairingOutcome::unpaired();
                }
                result = channel.recv(&mut buf) => result,
            };

            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("Socket error: {:#}", e);
                    return PairingOutcome::unpaired();
                }
            };

            let Some(port) = self.heuristic.extract(&buf[..len]) else {
                continue;
            };
            let endpoint = CandidateEndpoint {
                address: from.ip().to_string(),
                port,
            };
            if self.try_candidate(&endpoint, secret, deadline, cancel, run).await {
                return PairingOutcome::paired(endpoint.address);
            }
        }
    }

    /// One pairing attempt, bounded by the per-attempt timeout and by what is
    /// left of the run.
    async fn try_candidate(
        &self,
        endpoint: &CandidateEndpoint,
        secret: &PairingSecret,
        deadline: Instant,
        cancel: &CancellationToken,
        run: &mut RunState,
    ) -> bool {
        if !run.tried.insert(endpoint.clone()) {
            debug!("Already tried {}, skipping", endpoint);
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        let budget = self.settings.pair_timeout().min(remaining);

        info!("Device found: {}, pairing...", endpoint);
        self.events.on_candidate(endpoint);

        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.pairing.pair(endpoint, secret, budget) => result,
        };
        let (paired, output) = match result {
            Ok(output) => (pairing_succeeded(&output), output),
            Err(e) => (false, format!("{:#}", e)),
        };

        if paired {
            info!("Successfully paired with {}", endpoint);
        } else {
            warn!("Pairing with {} failed: {}", endpoint, output.trim());
        }
        self.events.on_pairing_result(endpoint, paired, &output);
        paired
    }
}

async fn retransmit(
    channel: Arc<dyn DatagramChannel>,
    packet: Vec<u8>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = channel.send(&packet).await {
                    debug!("Query send failed: {:#}", e);
                }
            }
        }
    }
}
