//! Turning captured tool output into a `SpeedTestRecord`.
//!
//! Two paths exist. The structured path decodes the JSON result document the
//! tool prints with `--format=json`, tolerating log noise around it. The
//! heuristic path scans human-readable lines and keeps the last reading of
//! each value, since the tool reprints readings as the test progresses.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::classify::{classify, details, ClassifiedEvent, LineDetail};
use crate::output::RawOutputLine;
use crate::record::{
    InterfaceInfo, Provenance, ResultInfo, ServerInfo, SpeedTestRecord, Throughput,
};

/// Opening of the final result object in the tool's JSON stream.
pub const RESULT_MARKER: &str = r#"{"type":"result""#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing but whitespace was captured.
    Empty,
    /// No decodable result object was found.
    Malformed(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "output is empty"),
            ParseError::Malformed(reason) => write!(f, "malformed result: {}", reason),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireResult {
    #[serde(rename = "type")]
    kind: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    ping: Option<WirePing>,
    download: Option<WireBandwidth>,
    upload: Option<WireBandwidth>,
    packet_loss: Option<f64>,
    isp: Option<String>,
    interface: Option<WireInterface>,
    server: Option<WireServer>,
    result: Option<WireLink>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePing {
    latency: f64,
    jitter: Option<f64>,
}

/// `bandwidth` is bytes per second on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireBandwidth {
    bandwidth: u64,
    bytes: Option<u64>,
    elapsed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireServer {
    id: u64,
    host: String,
    name: String,
    location: String,
    country: String,
    ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireServerList {
    servers: Vec<WireServer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireLink {
    id: String,
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireInterface {
    internal_ip: String,
    name: String,
    mac_addr: String,
    is_vpn: bool,
    external_ip: String,
}

impl From<WireServer> for ServerInfo {
    fn from(server: WireServer) -> Self {
        ServerInfo {
            name: server.name,
            location: server.location,
            country: server.country,
            id: server.id,
            host: server.host,
            ip: server.ip,
        }
    }
}

impl From<WireBandwidth> for Throughput {
    fn from(wire: WireBandwidth) -> Self {
        Throughput {
            bytes_per_second: wire.bandwidth,
            bytes: wire.bytes,
            elapsed_ms: wire.elapsed,
        }
    }
}

/// Finds the result object inside noisy output.
///
/// Scanning starts at the last result marker, or at the first `{` when the
/// marker is absent. Braces are only counted outside string literals, and
/// escaped quotes do not end a literal, so values like `"x}y"` are safe.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.rfind(RESULT_MARKER).or_else(|| text.find('{'))?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (offset, c) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decodes the tool's JSON result document.
pub fn assemble_from_structured(json_text: &str) -> Result<SpeedTestRecord, ParseError> {
    if json_text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let object = extract_json_object(json_text)
        .ok_or_else(|| ParseError::Malformed("no complete JSON object found".to_string()))?;
    let wire: WireResult =
        serde_json::from_str(object).map_err(|err| ParseError::Malformed(err.to_string()))?;
    // Progress lines carry partial readings and never stand in for the result.
    if let Some(kind) = wire.kind.as_deref().filter(|kind| *kind != "result") {
        return Err(ParseError::Malformed(format!(
            "`{}` object is a progress line, not a result",
            kind
        )));
    }
    if wire.download.is_none() && wire.upload.is_none() && wire.ping.is_none() {
        return Err(ParseError::Malformed(
            "JSON object carries no measurements".to_string(),
        ));
    }

    let ping = wire.ping.unwrap_or_default();
    let server = wire.server.map(ServerInfo::from).unwrap_or_default();
    let result = wire
        .result
        .map(|link| ResultInfo {
            url: link.url,
            id: link.id,
        })
        .unwrap_or_default();
    let interface = wire.interface.map(|interface| InterfaceInfo {
        internal_ip: interface.internal_ip,
        name: interface.name,
        mac_addr: interface.mac_addr,
        is_vpn: interface.is_vpn,
        external_ip: interface.external_ip,
    });

    Ok(SpeedTestRecord {
        download: wire.download.map(Throughput::from).unwrap_or_default(),
        upload: wire.upload.map(Throughput::from).unwrap_or_default(),
        latency_ms: ping.latency,
        jitter_ms: ping.jitter,
        packet_loss: wire.packet_loss,
        server,
        result,
        timestamp: wire.timestamp.unwrap_or_else(Utc::now),
        isp: wire.isp.filter(|isp| !isp.is_empty()),
        interface,
        provenance: Provenance::FromStructuredOutput,
    })
}

/// Decodes the output of `speedtest --servers --format=json`.
pub fn parse_server_list(json_text: &str) -> Result<Vec<ServerInfo>, ParseError> {
    if json_text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let object = extract_json_object(json_text)
        .ok_or_else(|| ParseError::Malformed("no complete JSON object found".to_string()))?;
    let list: WireServerList =
        serde_json::from_str(object).map_err(|err| ParseError::Malformed(err.to_string()))?;
    Ok(list.servers.into_iter().map(ServerInfo::from).collect())
}

/// Builds a best-effort record from human-readable output. Never fails.
pub fn assemble_from_heuristics<'a, I>(lines: I) -> SpeedTestRecord
where
    I: IntoIterator<Item = &'a RawOutputLine>,
{
    let mut download = None;
    let mut upload = None;
    let mut latency = None;
    let mut jitter = None;
    let mut packet_loss = None;
    let mut isp = None;
    let mut server = ServerInfo::default();
    let mut url = None;
    let mut last_seen = None;

    for line in lines {
        last_seen = Some(line.at);
        match classify(&line.text) {
            ClassifiedEvent::ServerIdentified {
                name,
                location,
                id,
                latency_ms,
            } => {
                server.name = name;
                if let Some(location) = location {
                    server.location = location;
                }
                if let Some(id) = id {
                    server.id = id;
                }
                if latency_ms.is_some() {
                    latency = latency_ms;
                }
            }
            ClassifiedEvent::LatencyMeasured { ms } => latency = Some(ms),
            ClassifiedEvent::DownloadSample { mbps } => download = Some(mbps),
            ClassifiedEvent::UploadSample { mbps } => upload = Some(mbps),
            ClassifiedEvent::Connecting
            | ClassifiedEvent::Completed
            | ClassifiedEvent::Unrecognized => {}
        }
        for detail in details(&line.text) {
            match detail {
                LineDetail::Isp(name) => isp = Some(name),
                LineDetail::ResultUrl(link) => url = Some(link),
                LineDetail::Jitter(ms) => jitter = Some(ms),
                LineDetail::PacketLoss(pct) => packet_loss = Some(pct),
            }
        }
    }

    let result = url
        .map(|url| ResultInfo {
            id: report_id(&url),
            url,
        })
        .unwrap_or_default();

    SpeedTestRecord {
        download: download.map(Throughput::from_mbps).unwrap_or_default(),
        upload: upload.map(Throughput::from_mbps).unwrap_or_default(),
        latency_ms: latency.unwrap_or(0.0),
        jitter_ms: jitter,
        packet_loss,
        server,
        result,
        timestamp: last_seen.unwrap_or_else(Utc::now),
        isp,
        interface: None,
        provenance: Provenance::FromTextHeuristics,
    }
}

/// Last path segment of a report URL, without an image extension.
fn report_id(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .trim_end_matches(".png")
        .to_string()
}
