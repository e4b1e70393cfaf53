use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adb::AdbTool;
use crate::browser::{AvahiBrowser, MdnsSdBrowser, ServiceBrowser};
use crate::config::{BrowserKind, PopConfig};
use crate::discovery::Discoverer;
use crate::events::DiscoveryEvents;
use crate::manager::SessionManager;
use crate::models::{
    Camera, Device, PairingOutcome, PairingSecret, SessionStatus, StartOptions, StartOutcome,
};
use crate::scrcpy::ScrcpyTool;

const QUICK_START_RESOLUTION: &str = "1920x1080";
const QUICK_START_FPS: &str = "30";

/// Everything a front end needs: pairing, device and camera listing, and the
/// capture session lifecycle, wired from one [`PopConfig`].
pub struct PopClient {
    adb: Arc<AdbTool>,
    scrcpy: ScrcpyTool,
    discoverer: Discoverer,
    sessions: SessionManager,
}

fn browser_for(config: &PopConfig) -> Option<Arc<dyn ServiceBrowser>> {
    match config.discovery.browser {
        BrowserKind::Avahi => Some(Arc::new(AvahiBrowser::new(config.tools.avahi_browse.clone()))),
        BrowserKind::MdnsSd => Some(Arc::new(MdnsSdBrowser)),
        BrowserKind::None => None,
    }
}

impl PopClient {
    pub fn new(config: PopConfig) -> Self {
        let adb = Arc::new(AdbTool::new(config.tools.adb.clone()));
        let mut discoverer = Discoverer::new(config.discovery.clone(), adb.clone());
        if let Some(browser) = browser_for(&config) {
            discoverer = discoverer.with_browser(browser);
        }
        Self {
            adb,
            scrcpy: ScrcpyTool::new(config.tools.scrcpy.clone()),
            discoverer,
            sessions: SessionManager::from_settings(config.session),
        }
    }

    /// Routes discovery progress to `events`.
    pub fn with_events(mut self, events: Arc<dyn DiscoveryEvents>) -> Self {
        self.discoverer = self.discoverer.with_events(events);
        self
    }

    pub fn discoverer(&self) -> &Discoverer {
        &self.discoverer
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// QR payload the phone scans to start pairing with `secret`.
    pub fn pairing_descriptor(&self, secret: &PairingSecret) -> String {
        self.discoverer.descriptor(secret)
    }

    /// One discovery run with the configured timeout.
    pub async fn pair(&self, secret: &PairingSecret, cancel: CancellationToken) -> PairingOutcome {
        let timeout = self.discoverer.settings().run_timeout();
        self.discoverer
            .discover_and_pair_until(secret, timeout, cancel)
            .await
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.adb.devices().await
    }

    pub async fn cameras(&self, serial: Option<&str>) -> BTreeMap<String, Camera> {
        self.scrcpy.list_cameras(serial).await
    }

    pub async fn connect(&self, address: &str, port: u16) -> bool {
        self.adb.connect(address, port).await
    }

    pub async fn disconnect(&self) {
        self.adb.disconnect().await
    }

    pub fn status(&self) -> SessionStatus {
        self.sessions.status()
    }

    pub fn start(&self, options: &StartOptions) -> StartOutcome {
        self.sessions.start(options)
    }

    pub fn stop(&self) -> bool {
        self.sessions.stop()
    }

    /// Starts the first camera of the first device at 1920x1080, 30 fps.
    pub async fn quick_start(&self) -> StartOutcome {
        let devices = self.devices().await;
        let Some(device) = devices.first() else {
            return StartOutcome::failed("No device connected");
        };
        let cameras = self.cameras(Some(&device.serial)).await;
        let Some(camera_id) = cameras.keys().next() else {
            return StartOutcome::failed(format!("No camera found on {}", device.serial));
        };

        info!("Quick start: camera {} on {}", camera_id, device.serial);
        let mut options = StartOptions::new(camera_id.clone(), QUICK_START_RESOLUTION, QUICK_START_FPS);
        options.serial = Some(device.serial.clone());
        self.start(&options)
    }
}
