//! # popdroidcam: Android phones as Linux webcams
//!
//! This library pairs with a phone over wireless debugging and runs the
//! capture process that feeds its camera into a v4l2loopback device. Front
//! ends (terminal, desktop, HTTP) stay thin and call into two subsystems:
//!
//! - **Discovery & pairing** ([`Discoverer`]): shows the phone a six-digit
//!   secret through a QR code, finds the phone's `_adb-tls-pairing._tcp`
//!   advertisement (service browser first, raw mDNS as fallback) and runs
//!   `adb pair` against it.
//!
//! - **Session lifecycle** ([`SessionManager`]): starts at most one detached
//!   `scrcpy` capture process, records its pid and configuration on disk,
//!   and stops its whole process group. Running state is always re-derived
//!   from the recorded pid, so a crashed or externally killed session is
//!   noticed on the next query.
//!
//! Both subsystems report outcomes as plain values; nothing they do panics or
//! returns an error to the caller for an expected failure (tool missing,
//! device silent, session already running).
//!
//! ## Quickstart Example
//!
//! ```no_run
//! use popdroidcam::{PairingSecret, PopClient, PopConfig, StartOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     tracing_subscriber::fmt::init();
//!
//!     let client = PopClient::new(PopConfig::default());
//!
//!     // 1. Show the descriptor as a QR code, then wait for the phone.
//!     let secret = PairingSecret::generate();
//!     println!("{}", client.pairing_descriptor(&secret));
//!     let outcome = client.pair(&secret, CancellationToken::new()).await;
//!     if !outcome.paired {
//!         return;
//!     }
//!
//!     // 2. Start streaming the first camera.
//!     let started = client.start(&StartOptions::new("0", "1920x1080", "30"));
//!     println!("{:?}", started);
//!
//!     // 3. Later, possibly from another process:
//!     client.stop();
//! }
//! ```

pub mod adb;
pub mod browser;
pub mod channel;
pub mod client;
pub mod config;
pub mod discovery;
pub mod events;
pub mod manager;
pub mod models;
pub mod process;
pub mod scrcpy;
pub mod store;
pub mod wire;
mod utils;

// Re-export public-facing components.
pub use adb::{AdbTool, PairingInvoker};
pub use browser::{AvahiBrowser, BrowsedService, MdnsSdBrowser, ServiceBrowser};
pub use channel::{DatagramChannel, MulticastChannel};
pub use client::PopClient;
pub use config::{BrowserKind, DiscoverySettings, PopConfig, SessionSettings, ToolPaths};
pub use discovery::Discoverer;
pub use events::{DiscoveryEvents, NoopEvents};
pub use manager::SessionManager;
pub use models::{
    Camera, CandidateEndpoint, Device, PairingOutcome, PairingSecret, QualityTier, Rotation,
    SessionRecord, SessionStatus, StartOptions, StartOutcome, Transport,
};
pub use process::{ExternalProcessHandle, SystemProcesses};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use wire::{DiscoveryQuery, PortHeuristic};
