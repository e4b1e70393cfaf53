use anyhow::{Context, Result};
use serde::Deserialize;
use std::{io::Read, path::Path, path::PathBuf, time::Duration};

/// Top-level configuration, typically loaded from a TOML file. Every section
/// and field has a default, so an empty file is valid.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PopConfig {
    pub discovery: DiscoverySettings,
    pub session: SessionSettings,
    pub tools: ToolPaths,
}

/// Which service browser to try before speaking mDNS directly.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserKind {
    /// `avahi-browse` command.
    #[default]
    Avahi,
    /// In-process `mdns-sd` daemon.
    MdnsSd,
    /// Go straight to the raw multicast path.
    None,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DiscoverySettings {
    pub service_type: String,
    pub instance_name: String,
    pub run_timeout_secs: u64,
    pub pair_timeout_secs: u64,
    pub browser_timeout_secs: u64,
    pub retransmit_interval_secs: u64,
    pub port_range: (u16, u16),
    pub mdns_port: u16,
    pub browser: BrowserKind,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            service_type: "_adb-tls-pairing._tcp.local.".to_string(),
            instance_name: "popdroidcam".to_string(),
            run_timeout_secs: 60,
            pair_timeout_secs: 15,
            browser_timeout_secs: 30,
            retransmit_interval_secs: 2,
            port_range: (30000, 50000),
            mdns_port: crate::wire::MDNS_PORT,
            browser: BrowserKind::default(),
        }
    }
}

impl DiscoverySettings {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs(self.pair_timeout_secs)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_secs(self.browser_timeout_secs)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_secs(self.retransmit_interval_secs.max(1))
    }

    /// Service type without the domain, as `avahi-browse` expects it.
    pub fn bare_service_type(&self) -> &str {
        let trimmed = self.service_type.trim_end_matches('.');
        trimmed.strip_suffix(".local").unwrap_or(trimmed)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionSettings {
    pub state_dir: PathBuf,
    pub capture_program: String,
    pub sink_probe_dir: PathBuf,
    pub default_sink: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local/state/popdroidcam");
        Self {
            state_dir,
            capture_program: "scrcpy".to_string(),
            sink_probe_dir: PathBuf::from("/sys/devices/virtual/video4linux"),
            default_sink: "/dev/video6".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join("scrcpy.log")
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ToolPaths {
    pub adb: String,
    pub scrcpy: String,
    pub avahi_browse: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
            scrcpy: "scrcpy".to_string(),
            avahi_browse: "avahi-browse".to_string(),
        }
    }
}

impl PopConfig {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("read config from {:?}", path.as_ref()))?;
        toml::from_str(&content).context("parse popdroidcam config")
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut buf = String::new();
        let mut rdr = reader;
        rdr.read_to_string(&mut buf)?;
        toml::from_str(&buf).context("parse popdroidcam config from reader")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = PopConfig::from_reader("".as_bytes()).unwrap();
        assert_eq!(config.discovery.run_timeout(), Duration::from_secs(60));
        assert_eq!(config.discovery.pair_timeout(), Duration::from_secs(15));
        assert_eq!(config.discovery.port_range, (30000, 50000));
        assert_eq!(config.discovery.browser, BrowserKind::Avahi);
        assert_eq!(config.session.default_sink, "/dev/video6");
        assert!(config.session.state_dir.ends_with(".local/state/popdroidcam"));
        assert_eq!(config.tools.adb, "adb");
    }

    #[test]
    fn overrides_individual_fields() {
        let raw = r#"
            [discovery]
            browser = "mdns-sd"
            run_timeout_secs = 20

            [session]
            state_dir = "/tmp/popdroidcam-test"

            [tools]
            adb = "/opt/platform-tools/adb"
        "#;
        let config = PopConfig::from_reader(raw.as_bytes()).unwrap();
        assert_eq!(config.discovery.browser, BrowserKind::MdnsSd);
        assert_eq!(config.discovery.run_timeout_secs, 20);
        assert_eq!(config.discovery.pair_timeout_secs, 15);
        assert_eq!(
            config.session.log_path(),
            PathBuf::from("/tmp/popdroidcam-test/scrcpy.log")
        );
        assert_eq!(config.session.capture_program, "scrcpy");
        assert_eq!(config.tools.adb, "/opt/platform-tools/adb");
    }

    #[test]
    fn rejects_unknown_browser() {
        let raw = "[discovery]\nbrowser = \"bonjour\"\n";
        assert!(PopConfig::from_reader(raw.as_bytes()).is_err());
    }

    #[test]
    fn bare_service_type_drops_domain() {
        let settings = DiscoverySettings::default();
        assert_eq!(settings.bare_service_type(), "_adb-tls-pairing._tcp");
    }
}
