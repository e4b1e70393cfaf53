use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::{CandidateEndpoint, Device, PairingSecret, Transport};
use crate::utils::run_command;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEVICES_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the external pairing command against one endpoint.
///
/// Returns the command's combined output; classifying it is the caller's job.
/// An `Err` means the command could not be run or did not finish in time.
#[async_trait]
pub trait PairingInvoker: Send + Sync {
    async fn pair(
        &self,
        endpoint: &CandidateEndpoint,
        secret: &PairingSecret,
        timeout: Duration,
    ) -> Result<String>;
}

/// True when pairing output reports success.
pub fn pairing_succeeded(output: &str) -> bool {
    let output = output.to_lowercase();
    output.contains("success") || output.contains("paired")
}

pub fn connect_succeeded(output: &str) -> bool {
    output.to_lowercase().contains("connected")
}

/// Parses `adb devices -l`, skipping the header line.
pub fn parse_devices(output: &str) -> Vec<Device> {
    output
        .trim()
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            let transport = if serial.contains(':') {
                Transport::WiFi
            } else {
                Transport::Usb
            };
            Some(Device {
                serial: serial.to_string(),
                state: state.to_string(),
                transport,
            })
        })
        .collect()
}

/// Thin wrapper over the `adb` binary.
#[derive(Debug, Clone)]
pub struct AdbTool {
    program: String,
}

impl Default for AdbTool {
    fn default() -> Self {
        Self::new("adb")
    }
}

impl AdbTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Lists attached devices; an unavailable or hung `adb` yields none.
    pub async fn devices(&self) -> Vec<Device> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        match run_command(&self.program, &args, DEVICES_TIMEOUT).await {
            Ok(output) => parse_devices(&output),
            Err(e) => {
                warn!("Listing devices failed: {:#}", e);
                Vec::new()
            }
        }
    }

    pub async fn connect(&self, address: &str, port: u16) -> bool {
        let args = vec!["connect".to_string(), format!("{}:{}", address, port)];
        match run_command(&self.program, &args, CONNECT_TIMEOUT).await {
            Ok(output) => {
                debug!("adb connect output: {}", output.trim());
                connect_succeeded(&output)
            }
            Err(e) => {
                warn!("Connecting to {}:{} failed: {:#}", address, port, e);
                false
            }
        }
    }

    /// Disconnects every wireless device. Failures are only logged.
    pub async fn disconnect(&self) {
        let args = vec!["disconnect".to_string()];
        if let Err(e) = run_command(&self.program, &args, DISCONNECT_TIMEOUT).await {
            warn!("adb disconnect failed: {:#}", e);
        }
    }
}

#[async_trait]
impl PairingInvoker for AdbTool {
    async fn pair(
        &self,
        endpoint: &CandidateEndpoint,
        secret: &PairingSecret,
        timeout: Duration,
    ) -> Result<String> {
        let args = vec![
            "pair".to_string(),
            endpoint.to_string(),
            secret.to_string(),
        ];
        run_command(&self.program, &args, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_pairing_output() {
        assert!(pairing_succeeded(
            "Successfully paired to 192.168.1.20:37123 [guid=adb-XYZ]"
        ));
        assert!(pairing_succeeded("PAIRED"));
        assert!(!pairing_succeeded("Failed: Wrong password or connection was dropped."));
        assert!(!pairing_succeeded(""));
    }

    #[test]
    fn classifies_connect_output() {
        assert!(connect_succeeded("connected to 192.168.1.20:5555"));
        assert!(connect_succeeded("already connected to 192.168.1.20:5555"));
        assert!(!connect_succeeded("failed to connect to '192.168.1.20:5555'"));
    }

    #[test]
    fn parses_device_list() {
        let output = "List of devices attached\n\
            R58M123ABC             device usb:1-1 product:beyond1 model:SM_G973F\n\
            192.168.1.20:41235     device product:panther model:Pixel_7\n\
            emulator-5554          offline\n\
            \n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].serial, "R58M123ABC");
        assert_eq!(devices[0].transport, Transport::Usb);
        assert_eq!(devices[1].transport, Transport::WiFi);
        assert_eq!(devices[2].state, "offline");
    }

    #[test]
    fn empty_device_list() {
        assert!(parse_devices("List of devices attached\n\n").is_empty());
        assert!(parse_devices("").is_empty());
    }

    #[tokio::test]
    async fn missing_adb_reports_no_devices() {
        let adb = AdbTool::new("popdroidcam-missing-adb");
        assert!(adb.devices().await.is_empty());
        assert!(!adb.connect("127.0.0.1", 5555).await);
        let secret: PairingSecret = "123456".parse().unwrap();
        let endpoint = CandidateEndpoint {
            address: "127.0.0.1".into(),
            port: 40000,
        };
        assert!(
            adb.pair(&endpoint, &secret, Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
