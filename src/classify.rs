//! Line classification for speed-test tool output.
//!
//! Each output line is matched against an ordered table of rules. The first
//! rule whose pattern matches (and whose reject list does not) decides the
//! event. Specific shapes come before generic ones: "Idle Latency:" is tried
//! before a bare "Latency:", and speed rules refuse the cumulative
//! "data used" lines the tool prints alongside its readings.
//!
//! Classification never fails. Most of what the tool prints is chatter and
//! comes back as `ClassifiedEvent::Unrecognized`.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::output::{sanitize_text, strip_carriage};

/// A recognized fragment of tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    /// The tool picked a server. Some formats report the ping on the same line.
    ServerIdentified {
        name: String,
        location: Option<String>,
        id: Option<u64>,
        latency_ms: Option<f64>,
    },
    LatencyMeasured { ms: f64 },
    DownloadSample { mbps: f64 },
    UploadSample { mbps: f64 },
    Connecting,
    Completed,
    Unrecognized,
}

/// Values that ride along on a line without affecting the test stage.
#[derive(Debug, Clone, PartialEq)]
pub enum LineDetail {
    Isp(String),
    ResultUrl(String),
    Jitter(f64),
    PacketLoss(f64),
}

struct Rule {
    name: &'static str,
    pattern: Regex,
    reject: &'static [&'static str],
    build: fn(&Captures) -> Option<ClassifiedEvent>,
}

const NUMBER: &str = r"\d+(?:[.,]\d+)*";

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            rule(
                "ookla-server",
                r"(?i)^\s*server:\s*(?P<name>.+?)\s+-\s+(?P<location>.+?)\s*\(id\s*[:=]?\s*(?P<id>\d+)\)",
                &[],
                |caps| {
                    Some(ClassifiedEvent::ServerIdentified {
                        name: caps["name"].trim().to_string(),
                        location: Some(caps["location"].trim().to_string()),
                        id: caps["id"].parse().ok(),
                        latency_ms: None,
                    })
                },
            ),
            rule(
                "hosted-by",
                &format!(
                    r"(?i)^\s*hosted by\s+(?P<name>.+?)\s*(?:\((?P<paren>[^)]*)\))?\s*(?:\[[^\]]*\])?\s*:\s*(?P<ms>{NUMBER})\s*ms"
                ),
                &[],
                |caps| {
                    let (location, id) = match caps.name("paren").map(|m| m.as_str().trim()) {
                        Some(paren) => match server_id_in(paren) {
                            Some(id) => (None, Some(id)),
                            None => (Some(paren.to_string()), None),
                        },
                        None => (None, None),
                    };
                    Some(ClassifiedEvent::ServerIdentified {
                        name: caps["name"].trim().to_string(),
                        location,
                        id,
                        latency_ms: parse_decimal(&caps["ms"]),
                    })
                },
            ),
            rule(
                "idle-latency",
                &format!(r"(?i)idle latency:\s*(?P<ms>{NUMBER})\s*ms"),
                &[],
                latency_event,
            ),
            rule(
                "download",
                &format!(r"(?i)^\s*download:\s*(?P<value>{NUMBER})\s*(?P<unit>[kmg]bps|[kmg]bit/s)?"),
                &["data used"],
                |caps| Some(ClassifiedEvent::DownloadSample { mbps: speed_in_mbps(caps)? }),
            ),
            rule(
                "upload",
                &format!(r"(?i)^\s*upload:\s*(?P<value>{NUMBER})\s*(?P<unit>[kmg]bps|[kmg]bit/s)?"),
                &["data used"],
                |caps| Some(ClassifiedEvent::UploadSample { mbps: speed_in_mbps(caps)? }),
            ),
            rule(
                "latency",
                &format!(r"(?i)(?:^|\s)(?:latency|ping):\s*(?P<ms>{NUMBER})\s*ms"),
                &[],
                latency_event,
            ),
            rule(
                "completion",
                r"(?i)^\s*(?:result url|share results):",
                &[],
                |_| Some(ClassifiedEvent::Completed),
            ),
            rule(
                "connecting",
                r"(?i)^\s*(?:retrieving speedtest\.net|selecting best server|testing from|connecting to|finding optimal server|speedtest by ookla)",
                &[],
                |_| Some(ClassifiedEvent::Connecting),
            ),
        ]
        .into_iter()
        .flatten()
        .collect()
    })
}

fn rule(
    name: &'static str,
    pattern: &str,
    reject: &'static [&'static str],
    build: fn(&Captures) -> Option<ClassifiedEvent>,
) -> Option<Rule> {
    match Regex::new(pattern) {
        Ok(pattern) => Some(Rule {
            name,
            pattern,
            reject,
            build,
        }),
        Err(err) => {
            log::error!("classifier rule {} disabled: {}", name, err);
            None
        }
    }
}

/// Classifies one line of tool output.
pub fn classify(line: &str) -> ClassifiedEvent {
    let text = sanitize_text(&strip_carriage(line), true);
    if let Some(event) = classify_json(&text) {
        return event;
    }
    let lowered = text.to_lowercase();
    for rule in rules() {
        if rule.reject.iter().any(|needle| lowered.contains(needle)) {
            continue;
        }
        let Some(caps) = rule.pattern.captures(&text) else {
            continue;
        };
        if let Some(event) = (rule.build)(&caps) {
            log::trace!("line matched rule {}: {:?}", rule.name, event);
            return event;
        }
    }
    ClassifiedEvent::Unrecognized
}

/// Progress lines emitted by `--format=json --progress=yes`.
fn classify_json(text: &str) -> Option<ClassifiedEvent> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let kind = value.get("type")?.as_str()?;
    let event = match kind {
        "testStart" => match value.pointer("/server/name").and_then(Value::as_str) {
            Some(name) => ClassifiedEvent::ServerIdentified {
                name: name.to_string(),
                location: value
                    .pointer("/server/location")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                id: value.pointer("/server/id").and_then(Value::as_u64),
                latency_ms: None,
            },
            None => ClassifiedEvent::Connecting,
        },
        "ping" => match value.pointer("/ping/latency").and_then(Value::as_f64) {
            Some(ms) => ClassifiedEvent::LatencyMeasured { ms },
            None => ClassifiedEvent::Unrecognized,
        },
        "download" => match value.pointer("/download/bandwidth").and_then(Value::as_f64) {
            Some(bandwidth) => ClassifiedEvent::DownloadSample {
                mbps: bytes_per_second_to_mbps(bandwidth),
            },
            None => ClassifiedEvent::Unrecognized,
        },
        "upload" => match value.pointer("/upload/bandwidth").and_then(Value::as_f64) {
            Some(bandwidth) => ClassifiedEvent::UploadSample {
                mbps: bytes_per_second_to_mbps(bandwidth),
            },
            None => ClassifiedEvent::Unrecognized,
        },
        "result" => ClassifiedEvent::Completed,
        _ => ClassifiedEvent::Unrecognized,
    };
    Some(event)
}

struct DetailRule {
    pattern: Regex,
    build: fn(&Captures) -> Option<LineDetail>,
}

fn detail_rules() -> &'static [DetailRule] {
    static RULES: OnceLock<Vec<DetailRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            detail(
                r"(?i)^\s*testing from\s+(?P<isp>.+?)\s*(?:\([^)]*\))?\s*\.{0,3}\s*$",
                |caps| Some(LineDetail::Isp(caps["isp"].trim().to_string())),
            ),
            detail(r"(?i)^\s*isp:\s*(?P<isp>.+?)\s*$", |caps| {
                Some(LineDetail::Isp(caps["isp"].to_string()))
            }),
            detail(r"(?i)(?:result url|share results):\s*(?P<url>\S+)", |caps| {
                Some(LineDetail::ResultUrl(caps["url"].to_string()))
            }),
            detail(
                &format!(r"(?i)(?:idle latency|latency|ping):.*?jitter:\s*(?P<ms>{NUMBER})\s*ms"),
                |caps| parse_decimal(&caps["ms"]).map(LineDetail::Jitter),
            ),
            detail(&format!(r"(?i)packet loss:\s*(?P<pct>{NUMBER})\s*%"), |caps| {
                parse_decimal(&caps["pct"]).map(LineDetail::PacketLoss)
            }),
        ]
        .into_iter()
        .flatten()
        .collect()
    })
}

fn detail(pattern: &str, build: fn(&Captures) -> Option<LineDetail>) -> Option<DetailRule> {
    Regex::new(pattern)
        .ok()
        .map(|pattern| DetailRule { pattern, build })
}

/// Extracts the non-stage values a line carries.
pub fn details(line: &str) -> Vec<LineDetail> {
    let text = sanitize_text(&strip_carriage(line), true);
    if let Some(found) = json_details(&text) {
        return found;
    }
    detail_rules()
        .iter()
        .filter_map(|rule| rule.pattern.captures(&text).and_then(|caps| (rule.build)(&caps)))
        .collect()
}

fn json_details(text: &str) -> Option<Vec<LineDetail>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let mut found = Vec::new();
    if let Some(isp) = value.get("isp").and_then(Value::as_str) {
        found.push(LineDetail::Isp(isp.to_string()));
    }
    if let Some(url) = value.pointer("/result/url").and_then(Value::as_str) {
        found.push(LineDetail::ResultUrl(url.to_string()));
    }
    if let Some(jitter) = value.pointer("/ping/jitter").and_then(Value::as_f64) {
        found.push(LineDetail::Jitter(jitter));
    }
    if let Some(loss) = value.get("packetLoss").and_then(Value::as_f64) {
        found.push(LineDetail::PacketLoss(loss));
    }
    Some(found)
}

/// Parses a decimal number written with either `.` or `,` as separator.
///
/// When both appear, the rightmost one is the decimal separator and the
/// other is treated as digit grouping.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = match (trimmed.rfind('.'), trimmed.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => trimmed.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => trimmed.replace(',', ""),
        (None, Some(_)) => trimmed.replace(',', "."),
        _ => trimmed.to_string(),
    };
    normalized.parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn bytes_per_second_to_mbps(bytes_per_second: f64) -> f64 {
    bytes_per_second * 8.0 / 1_000_000.0
}

fn latency_event(caps: &Captures) -> Option<ClassifiedEvent> {
    parse_decimal(&caps["ms"]).map(|ms| ClassifiedEvent::LatencyMeasured { ms })
}

fn speed_in_mbps(caps: &Captures) -> Option<f64> {
    let value = parse_decimal(&caps["value"])?;
    let unit = caps
        .name("unit")
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let mbps = match unit.chars().next() {
        Some('k') => value / 1000.0,
        Some('g') => value * 1000.0,
        _ => value,
    };
    Some(mbps)
}

fn server_id_in(paren: &str) -> Option<u64> {
    let rest = paren.trim().strip_prefix("id")?;
    rest.trim_start_matches([':', '=', ' ']).trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn all_rules_compile() {
        assert!(rules().len() >= 8);
        assert!(!detail_rules().is_empty());
    }

    #[test]
    fn download_line_yields_sample() {
        assert_eq!(
            classify("Download: 50.2 Mbps"),
            ClassifiedEvent::DownloadSample { mbps: 50.2 }
        );
    }

    #[test]
    fn data_used_lines_are_not_samples() {
        assert_eq!(
            classify("Download: 50.2 Mbps (data used: 10MB)"),
            ClassifiedEvent::Unrecognized
        );
        assert_eq!(
            classify("    Upload:    87.32 Mbps (data used: 99.0 MB)"),
            ClassifiedEvent::Unrecognized
        );
    }

    #[test]
    fn comma_decimal_speed_is_normalized() {
        assert_eq!(
            classify("Upload: 87,32 Mbit/s"),
            ClassifiedEvent::UploadSample { mbps: 87.32 }
        );
    }

    #[test]
    fn speed_units_are_converted_to_mbps() {
        assert_eq!(
            classify("Download: 1.5 Gbps"),
            ClassifiedEvent::DownloadSample { mbps: 1500.0 }
        );
        assert_eq!(
            classify("Download: 500 Kbps"),
            ClassifiedEvent::DownloadSample { mbps: 0.5 }
        );
    }

    #[test]
    fn idle_latency_wins_over_generic_latency() {
        assert_eq!(
            classify("Idle Latency:     3.06 ms   (jitter: 0.21ms, low: 2.80ms, high: 3.37ms)"),
            ClassifiedEvent::LatencyMeasured { ms: 3.06 }
        );
        assert_eq!(classify("Ping: 12 ms"), ClassifiedEvent::LatencyMeasured { ms: 12.0 });
    }

    #[test]
    fn hosted_by_line_carries_server_and_latency() {
        assert_eq!(
            classify("Hosted by Example Corp (id: 123): 12.5 ms"),
            ClassifiedEvent::ServerIdentified {
                name: "Example Corp".to_string(),
                location: None,
                id: Some(123),
                latency_ms: Some(12.5),
            }
        );
        assert_eq!(
            classify("Hosted by UARNet (Lviv) [3.21 km]: 4.2 ms"),
            ClassifiedEvent::ServerIdentified {
                name: "UARNet".to_string(),
                location: Some("Lviv".to_string()),
                id: None,
                latency_ms: Some(4.2),
            }
        );
    }

    #[test]
    fn ookla_server_line_is_identified() {
        assert_eq!(
            classify("      Server: UARNet - Lviv (id = 2445)"),
            ClassifiedEvent::ServerIdentified {
                name: "UARNet".to_string(),
                location: Some("Lviv".to_string()),
                id: Some(2445),
                latency_ms: None,
            }
        );
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(
            classify("DOWNLOAD: 10 MBPS"),
            ClassifiedEvent::DownloadSample { mbps: 10.0 }
        );
    }

    #[test]
    fn connecting_and_completion_markers() {
        assert_eq!(classify("Testing from ExampleISP..."), ClassifiedEvent::Connecting);
        assert_eq!(
            classify("Retrieving speedtest.net configuration..."),
            ClassifiedEvent::Connecting
        );
        assert_eq!(
            classify("  Result URL: https://www.speedtest.net/result/c/abc"),
            ClassifiedEvent::Completed
        );
    }

    #[test]
    fn chatter_is_unrecognized() {
        assert_eq!(classify(""), ClassifiedEvent::Unrecognized);
        assert_eq!(classify("Testing download speed...."), ClassifiedEvent::Unrecognized);
        assert_eq!(classify("{not json"), ClassifiedEvent::Unrecognized);
    }

    #[test]
    fn json_progress_lines_are_classified() {
        assert_eq!(
            classify(r#"{"type":"testStart","isp":"Kyivstar","server":{"id":2445,"name":"UARNet","location":"Lviv"}}"#),
            ClassifiedEvent::ServerIdentified {
                name: "UARNet".to_string(),
                location: Some("Lviv".to_string()),
                id: Some(2445),
                latency_ms: None,
            }
        );
        assert_eq!(
            classify(r#"{"type":"ping","ping":{"jitter":0.2,"latency":3.5,"progress":0.5}}"#),
            ClassifiedEvent::LatencyMeasured { ms: 3.5 }
        );
        assert_eq!(
            classify(r#"{"type":"download","download":{"bandwidth":1250000,"progress":0.3}}"#),
            ClassifiedEvent::DownloadSample { mbps: 10.0 }
        );
        assert_eq!(
            classify(r#"{"type":"result","download":{"bandwidth":1}}"#),
            ClassifiedEvent::Completed
        );
        assert_eq!(
            classify(r#"{"type":"log","message":"hello"}"#),
            ClassifiedEvent::Unrecognized
        );
    }

    #[test]
    fn details_are_extracted() {
        assert_eq!(
            details("Testing from ExampleISP (203.0.113.7)..."),
            vec![LineDetail::Isp("ExampleISP".to_string())]
        );
        assert_eq!(
            details("Testing from ExampleISP..."),
            vec![LineDetail::Isp("ExampleISP".to_string())]
        );
        assert_eq!(
            details("Share results: http://www.speedtest.net/result/123.png"),
            vec![LineDetail::ResultUrl(
                "http://www.speedtest.net/result/123.png".to_string()
            )]
        );
        assert_eq!(
            details("Idle Latency: 3.06 ms (jitter: 0.21ms, low: 2.80ms)"),
            vec![LineDetail::Jitter(0.21)]
        );
        assert_eq!(details(" Packet Loss:     0,5%"), vec![LineDetail::PacketLoss(0.5)]);
    }

    #[test]
    fn parse_decimal_handles_grouping() {
        assert_eq!(parse_decimal("12,3"), Some(12.3));
        assert_eq!(parse_decimal("12.3"), Some(12.3));
        assert_eq!(parse_decimal("1.234,5"), Some(1234.5));
        assert_eq!(parse_decimal("1,234.5"), Some(1234.5));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("abc"), None);
    }

    proptest! {
        #[test]
        fn either_separator_parses_to_the_same_value(whole in 0u32..1_000_000, frac in "[0-9]{1,6}") {
            let dotted = parse_decimal(&format!("{whole}.{frac}"));
            let commaed = parse_decimal(&format!("{whole},{frac}"));
            prop_assert!(dotted.is_some());
            prop_assert_eq!(dotted, commaed);
        }

        #[test]
        fn classify_never_panics(line in ".{0,80}") {
            let _ = classify(&line);
            let _ = details(&line);
        }
    }
}
