//! The assembled result of one speed test.
//!
//! Bandwidth is kept the way the tool reports it, bytes per second. Bits per
//! second and Mbps are derived on demand for display, so a record built from
//! the tool's JSON serializes back to the exact wire values.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the values of a record came from.
///
/// The two paths can disagree; display code should say which one it shows
/// instead of silently preferring a zero from one over a reading from the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Decoded from the tool's JSON result document.
    FromStructuredOutput,
    /// Scraped line by line from human-readable output.
    FromTextHeuristics,
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Provenance::FromStructuredOutput => "structured output",
            Provenance::FromTextHeuristics => "text heuristics",
        }
    }
}

/// A measured transfer rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Throughput {
    /// Raw rate in bytes per second.
    pub bytes_per_second: u64,
    /// Total bytes transferred, when the tool reports it.
    pub bytes: Option<u64>,
    /// Duration of the phase in milliseconds, when the tool reports it.
    pub elapsed_ms: Option<u64>,
}

impl Throughput {
    pub fn from_bytes_per_second(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            ..Self::default()
        }
    }

    /// Builds a rate from a Mbps reading, rounding to the nearest byte.
    pub fn from_mbps(mbps: f64) -> Self {
        let bytes = (mbps.max(0.0) * 1_000_000.0 / 8.0).round();
        Self::from_bytes_per_second(bytes as u64)
    }

    pub fn bits_per_second(&self) -> u64 {
        self.bytes_per_second.saturating_mul(8)
    }

    pub fn mbps(&self) -> f64 {
        self.bytes_per_second as f64 * 8.0 / 1_000_000.0
    }

    pub fn is_zero(&self) -> bool {
        self.bytes_per_second == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub location: String,
    pub country: String,
    pub id: u64,
    pub host: String,
    pub ip: Option<String>,
}

impl ServerInfo {
    /// `name (location, country)`, leaving out whatever is unknown.
    pub fn describe(&self) -> String {
        let place = [self.location.as_str(), self.country.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        match (self.name.is_empty(), place.is_empty()) {
            (true, true) => String::new(),
            (true, false) => place,
            (false, true) => self.name.clone(),
            (false, false) => format!("{} ({})", self.name, place),
        }
    }
}

/// Link to the report the tool published for this run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultInfo {
    pub url: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub internal_ip: String,
    pub name: String,
    pub mac_addr: String,
    pub is_vpn: bool,
    pub external_ip: String,
}

/// One finished speed test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestRecord {
    pub download: Throughput,
    pub upload: Throughput,
    pub latency_ms: f64,
    pub jitter_ms: Option<f64>,
    /// Percentage of lost packets, when measured.
    pub packet_loss: Option<f64>,
    pub server: ServerInfo,
    pub result: ResultInfo,
    pub timestamp: DateTime<Utc>,
    pub isp: Option<String>,
    pub interface: Option<InterfaceInfo>,
    pub provenance: Provenance,
}

impl SpeedTestRecord {
    /// Whether any throughput or latency value was captured.
    pub fn has_measurements(&self) -> bool {
        !self.download.is_zero() || !self.upload.is_zero() || self.latency_ms > 0.0
    }

    pub fn connection_type(&self) -> &'static str {
        match &self.interface {
            Some(interface) if interface.is_vpn => "VPN",
            _ => "Direct",
        }
    }

    /// Shareable image of the published report.
    pub fn image_url(&self) -> Option<String> {
        let url = self.result.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return None;
        }
        Some(format!("{}.png", url.trim_end_matches('/')))
    }

    /// The plain-text summary copied to the clipboard.
    pub fn report(&self, decimal_comma: bool) -> String {
        let mut text = String::new();
        let _ = writeln!(
            text,
            "Download: {} Mbps",
            format_decimal(self.download.mbps(), decimal_comma)
        );
        let _ = writeln!(
            text,
            "Upload: {} Mbps",
            format_decimal(self.upload.mbps(), decimal_comma)
        );
        match self.jitter_ms {
            Some(jitter) => {
                let _ = writeln!(
                    text,
                    "Ping: {} ms (Jitter: {} ms)",
                    format_decimal(self.latency_ms, decimal_comma),
                    format_decimal(jitter, decimal_comma)
                );
            }
            None => {
                let _ = writeln!(
                    text,
                    "Ping: {} ms",
                    format_decimal(self.latency_ms, decimal_comma)
                );
            }
        }
        let server = self.server.describe();
        if !server.is_empty() {
            let _ = writeln!(text, "Server: {}", server);
        }
        if let Some(isp) = self.isp.as_deref().filter(|isp| !isp.is_empty()) {
            let _ = writeln!(text, "ISP: {}", isp);
        }
        if !self.result.url.is_empty() {
            let _ = writeln!(text, "URL: {}", self.result.url);
        }
        text
    }

    /// Every field, for `-vv` logging.
    pub fn debug_dump(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "timestamp: {}", self.timestamp.to_rfc3339());
        let _ = writeln!(text, "provenance: {}", self.provenance.label());
        let _ = writeln!(text, "isp: {}", self.isp.as_deref().unwrap_or(""));
        let _ = writeln!(text, "packet loss: {:?}", self.packet_loss);
        let _ = writeln!(text, "latency: {:.2} ms, jitter: {:?}", self.latency_ms, self.jitter_ms);
        for (label, throughput) in [("download", &self.download), ("upload", &self.upload)] {
            let _ = writeln!(
                text,
                "{}: {} B/s ({} bit/s), {:.2} Mbps, bytes {:?}, elapsed {:?} ms",
                label,
                throughput.bytes_per_second,
                throughput.bits_per_second(),
                throughput.mbps(),
                throughput.bytes,
                throughput.elapsed_ms
            );
        }
        let _ = writeln!(
            text,
            "server: {} [{}] host {} ip {}",
            self.server.describe(),
            self.server.id,
            self.server.host,
            self.server.ip.as_deref().unwrap_or("")
        );
        let _ = writeln!(text, "result: {} {}", self.result.id, self.result.url);
        if let Some(interface) = &self.interface {
            let _ = writeln!(
                text,
                "interface: {} {} {} external {} ({})",
                interface.name,
                interface.internal_ip,
                interface.mac_addr,
                interface.external_ip,
                self.connection_type()
            );
        }
        text
    }
}

/// Two decimal places, optionally with a comma separator.
pub fn format_decimal(value: f64, decimal_comma: bool) -> String {
    let text = format!("{:.2}", value);
    if decimal_comma {
        text.replace('.', ",")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SpeedTestRecord {
        SpeedTestRecord {
            download: Throughput::from_bytes_per_second(11_930_875),
            upload: Throughput::from_bytes_per_second(10_915_000),
            latency_ms: 3.06,
            jitter_ms: Some(0.21),
            packet_loss: None,
            server: ServerInfo {
                name: "UARNet".into(),
                location: "Lviv".into(),
                country: "Ukraine".into(),
                ..ServerInfo::default()
            },
            result: ResultInfo {
                url: "https://www.speedtest.net/result/c/abc/".into(),
                id: "abc".into(),
            },
            timestamp: Utc::now(),
            isp: Some("Kyivstar".into()),
            interface: None,
            provenance: Provenance::FromStructuredOutput,
        }
    }

    #[test]
    fn throughput_conversions() {
        let rate = Throughput::from_bytes_per_second(11_930_875);
        assert_eq!(rate.bits_per_second(), 95_447_000);
        assert!((rate.mbps() - 95.447).abs() < 1e-9);
        assert_eq!(Throughput::from_mbps(95.47).bytes_per_second, 11_933_750);
        assert_eq!(Throughput::from_mbps(-1.0).bytes_per_second, 0);
    }

    #[test]
    fn report_uses_requested_separator() {
        let record = sample();
        let report = record.report(true);
        assert!(report.contains("Download: 95,45 Mbps"));
        assert!(report.contains("Ping: 3,06 ms (Jitter: 0,21 ms)"));
        assert!(report.contains("Server: UARNet (Lviv, Ukraine)"));
        assert!(report.contains("ISP: Kyivstar"));
        assert!(record.report(false).contains("Upload: 87.32 Mbps"));
    }

    #[test]
    fn image_url_requires_absolute_url() {
        let mut record = sample();
        assert_eq!(
            record.image_url().as_deref(),
            Some("https://www.speedtest.net/result/c/abc.png")
        );
        record.result.url = "not a url".into();
        assert_eq!(record.image_url(), None);
    }

    #[test]
    fn server_describe_skips_missing_parts() {
        let server = ServerInfo {
            name: "Example Corp".into(),
            ..ServerInfo::default()
        };
        assert_eq!(server.describe(), "Example Corp");
        assert_eq!(ServerInfo::default().describe(), "");
    }

    #[test]
    fn connection_type_follows_vpn_flag() {
        let mut record = sample();
        assert_eq!(record.connection_type(), "Direct");
        record.interface = Some(InterfaceInfo {
            is_vpn: true,
            ..InterfaceInfo::default()
        });
        assert_eq!(record.connection_type(), "VPN");
    }
}
