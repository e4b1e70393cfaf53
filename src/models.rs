use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Resolutions hardware encoders handle best, in order of preference.
pub const PREFERRED_RESOLUTIONS: [&str; 5] =
    ["1920x1080", "1280x720", "1920x1440", "2560x1440", "3840x2160"];

/// Six-digit code shared with the phone through the pairing QR code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingSecret(String);

impl PairingSecret {
    pub fn generate() -> Self {
        let code: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        Self(code.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PairingSecret {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            bail!("pairing secret must be 6 digits, got {:?}", s);
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for PairingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload for the Wi-Fi pairing QR code Android's wireless debugging screen
/// scans.
pub fn pairing_descriptor(instance_name: &str, secret: &PairingSecret) -> String {
    format!("WIFI:T:ADB;S:{};P:{};;", instance_name, secret)
}

/// An address/port pair not yet validated by a successful pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CandidateEndpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for CandidateEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Terminal result of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingOutcome {
    pub paired: bool,
    pub endpoint_address: Option<String>,
}

impl PairingOutcome {
    pub fn paired(address: impl Into<String>) -> Self {
        Self {
            paired: true,
            endpoint_address: Some(address.into()),
        }
    }

    pub fn unpaired() -> Self {
        Self {
            paired: false,
            endpoint_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transport {
    WiFi,
    #[serde(rename = "USB")]
    Usb,
}

/// A device as listed by `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub serial: String,
    pub state: String,
    pub transport: Transport,
}

/// A camera as listed by the capture tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Camera {
    pub facing: String,
    pub fps: Vec<String>,
    pub resolutions: Vec<String>,
}

impl Camera {
    /// Resolutions with the preferred ones first, otherwise in listed order.
    pub fn ordered_resolutions(&self) -> Vec<String> {
        let mut ordered: Vec<String> = PREFERRED_RESOLUTIONS
            .iter()
            .filter(|r| self.resolutions.iter().any(|have| have == *r))
            .map(|r| r.to_string())
            .collect();
        for res in &self.resolutions {
            if !ordered.contains(res) {
                ordered.push(res.clone());
            }
        }
        ordered
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl QualityTier {
    pub const ALL: [QualityTier; 4] = [Self::Low, Self::Medium, Self::High, Self::Ultra];

    pub fn bitrate(self) -> &'static str {
        match self {
            Self::Low => "4M",
            Self::Medium => "8M",
            Self::High => "16M",
            Self::Ultra => "32M",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Ultra => "ultra",
        }
    }
}

impl FromStr for QualityTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| anyhow!("unknown quality tier {:?}", s))
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = anyhow::Error;

    fn try_from(degrees: u16) -> Result<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => bail!("rotation must be 0, 90, 180 or 270, got {}", other),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

impl FromStr for Rotation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let degrees: u16 = s
            .parse()
            .map_err(|_| anyhow!("rotation must be a number of degrees, got {:?}", s))?;
        Self::try_from(degrees)
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.degrees())
    }
}

/// What a caller asks for when starting a capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    pub camera_id: String,
    pub resolution: String,
    pub fps: String,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub serial: Option<String>,
}

impl StartOptions {
    pub fn new(
        camera_id: impl Into<String>,
        resolution: impl Into<String>,
        fps: impl Into<String>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            resolution: resolution.into(),
            fps: fps.into(),
            rotation: Rotation::default(),
            quality: QualityTier::default(),
            mirror: false,
            serial: None,
        }
    }

    /// Orientation token for the capture tool; mirrored sessions use the
    /// `flip` variant of the rotation.
    pub fn orientation(&self) -> String {
        if self.mirror {
            format!("flip{}", self.rotation)
        } else {
            self.rotation.to_string()
        }
    }
}

/// The durable description of a running session. Only the session manager
/// creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub process_id: u32,
    pub capture_device: String,
    pub camera_id: String,
    pub resolution: String,
    pub frame_rate: String,
    pub rotation: Rotation,
    pub quality_tier: QualityTier,
    pub mirror_mode: bool,
    pub serial: Option<String>,
}

impl SessionRecord {
    pub(crate) fn new(process_id: u32, capture_device: String, options: &StartOptions) -> Self {
        Self {
            process_id,
            capture_device,
            camera_id: options.camera_id.clone(),
            resolution: options.resolution.clone(),
            frame_rate: options.fps.clone(),
            rotation: options.rotation,
            quality_tier: options.quality,
            mirror_mode: options.mirror,
            serial: options.serial.clone(),
        }
    }

    /// Key/value snapshot persisted next to the liveness token.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("res".to_string(), self.resolution.clone());
        map.insert("fps".to_string(), self.frame_rate.clone());
        map.insert("camera_id".to_string(), self.camera_id.clone());
        map.insert("rotation".to_string(), self.rotation.to_string());
        map.insert("quality".to_string(), self.quality_tier.to_string());
        map.insert("mirror".to_string(), self.mirror_mode.to_string());
        map.insert("device".to_string(), self.capture_device.clone());
        if let Some(serial) = &self.serial {
            map.insert("serial".to_string(), serial.clone());
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartOutcome {
    pub fn started(pid: u32) -> Self {
        Self {
            success: true,
            pid: Some(pid),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            pid: None,
            error: Some(error.into()),
        }
    }
}

/// Running state plus the last recorded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub config: BTreeMap<String, String>,
}
