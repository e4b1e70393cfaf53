//! Minimal multicast DNS wire helpers.
//!
//! Only what discovery needs: a single-question PTR query encoder, a label
//! decoder for that query, and the [`PortHeuristic`] used to pull a candidate
//! port out of responses without decoding their records.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use anyhow::{Result, bail, ensure};

pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

pub const TYPE_PTR: u16 = 12;
pub const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;

/// Responses are only scanned within this prefix when looking for a marker.
const MARKER_WINDOW: usize = 500;

/// An encoded PTR query for one service type. Built once per discovery run
/// and retransmitted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryQuery {
    service_type: String,
    packet: Vec<u8>,
}

impl DiscoveryQuery {
    pub fn new(service_type: &str) -> Result<Self> {
        let name = encode_name(service_type)?;
        let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 4);
        // id, flags, qdcount, ancount, nscount, arcount
        for field in [0u16, 0, 1, 0, 0, 0] {
            packet.extend_from_slice(&field.to_be_bytes());
        }
        packet.extend_from_slice(&name);
        packet.extend_from_slice(&TYPE_PTR.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        Ok(Self {
            service_type: service_type.to_string(),
            packet,
        })
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.packet
    }

    /// Decodes a single-question PTR query back into its name labels.
    pub fn decode(packet: &[u8]) -> Result<Vec<String>> {
        ensure!(packet.len() >= HEADER_LEN, "packet shorter than a header");
        let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
        ensure!(qdcount == 1, "expected one question, found {}", qdcount);

        let (labels, next) = decode_name(packet, HEADER_LEN)?;
        let trailer = packet
            .get(next..next + 4)
            .ok_or_else(|| anyhow::anyhow!("question trailer truncated"))?;
        let qtype = u16::from_be_bytes([trailer[0], trailer[1]]);
        let qclass = u16::from_be_bytes([trailer[2], trailer[3]]);
        ensure!(qtype == TYPE_PTR, "unexpected question type {}", qtype);
        ensure!(qclass == CLASS_IN, "unexpected question class {}", qclass);
        Ok(labels)
    }
}

/// Encodes a dotted name as length-prefixed labels with a zero terminator.
/// A trailing dot is accepted and does not produce an empty label.
pub fn encode_name(name: &str) -> Result<Vec<u8>> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let mut out = Vec::with_capacity(trimmed.len() + 2);
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            ensure!(!label.is_empty(), "empty label in {:?}", name);
            ensure!(
                label.len() <= MAX_LABEL_LEN,
                "label {:?} exceeds {} bytes",
                label,
                MAX_LABEL_LEN
            );
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(out)
}

/// Reads uncompressed labels starting at `offset`, returning them with the
/// offset just past the terminator.
pub fn decode_name(packet: &[u8], mut offset: usize) -> Result<(Vec<String>, usize)> {
    let mut labels = Vec::new();
    loop {
        let Some(&len) = packet.get(offset) else {
            bail!("name runs past end of packet");
        };
        offset += 1;
        if len == 0 {
            return Ok((labels, offset));
        }
        if len & 0xC0 != 0 {
            bail!("compressed names are not supported");
        }
        let end = offset + len as usize;
        let Some(raw) = packet.get(offset..end) else {
            bail!("label runs past end of packet");
        };
        labels.push(String::from_utf8_lossy(raw).into_owned());
        offset = end;
    }
}

/// Splits service labels into `[<instance/type>, <domain>]`, e.g.
/// `["_adb-tls-pairing._tcp", "local"]`.
pub fn service_segments(labels: &[String]) -> Vec<String> {
    match labels.split_last() {
        Some((domain, rest)) if !rest.is_empty() => vec![rest.join("."), domain.clone()],
        _ => labels.to_vec(),
    }
}

/// Pulls a plausible pairing port out of an mDNS response without decoding
/// its records.
///
/// A payload qualifies when its leading bytes mention one of the markers;
/// the first big-endian `u16` inside `ports` is then taken as the port. The
/// value may belong to an unrelated field, in which case the pairing attempt
/// against it simply fails.
#[derive(Debug, Clone)]
pub struct PortHeuristic {
    markers: Vec<String>,
    ports: RangeInclusive<u16>,
}

impl Default for PortHeuristic {
    fn default() -> Self {
        Self::new(vec!["_adb-tls-pairing".to_string(), "adb".to_string()], 30000..=50000)
    }
}

impl PortHeuristic {
    pub fn new(markers: Vec<String>, ports: RangeInclusive<u16>) -> Self {
        Self { markers, ports }
    }

    pub fn references_service(&self, payload: &[u8]) -> bool {
        let window = &payload[..payload.len().min(MARKER_WINDOW)];
        let text = String::from_utf8_lossy(window);
        self.markers.iter().any(|m| text.contains(m.as_str()))
    }

    pub fn scan_for_port(&self, payload: &[u8]) -> Option<u16> {
        payload
            .windows(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .find(|port| self.ports.contains(port))
    }

    pub fn extract(&self, payload: &[u8]) -> Option<u16> {
        if !self.references_service(payload) {
            return None;
        }
        self.scan_for_port(payload)
    }
}
