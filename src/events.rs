use crate::models::CandidateEndpoint;

/// Progress notifications from a discovery run.
///
/// Implement this to show pairing progress; every method defaults to doing
/// nothing, and the outcome of the run never depends on it.
pub trait DiscoveryEvents: Send + Sync {
    /// The service browser could not be used and the raw mDNS path follows.
    fn on_browser_unavailable(&self, _reason: &str) {}

    /// A candidate endpoint is about to be paired with.
    fn on_candidate(&self, _endpoint: &CandidateEndpoint) {}

    /// A pairing attempt finished. `output` is the pairing command's text or
    /// the reason it could not run.
    fn on_pairing_result(&self, _endpoint: &CandidateEndpoint, _paired: bool, _output: &str) {}
}

/// Ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl DiscoveryEvents for NoopEvents {}
