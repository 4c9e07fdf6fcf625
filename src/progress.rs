//! Test progress tracking.
//!
//! `apply` folds classified output events into a `ProgressState`. Stages only
//! move forward (`Connecting → MeasuringLatency → Downloading → Uploading →
//! Complete`); `Failed` is absorbing and reachable from anywhere. The tool's
//! text output is not cleanly ordered, so a stray "Download" reading during
//! the upload phase leaves the upload stage and its live reading untouched.

use crate::classify::ClassifiedEvent;

/// The phases of a speed test, in the order the tool runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Connecting,
    MeasuringLatency,
    Downloading,
    Uploading,
    Complete,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Connecting => "Connecting to server...",
            Stage::MeasuringLatency => "Testing latency...",
            Stage::Downloading => "Testing download...",
            Stage::Uploading => "Testing upload...",
            Stage::Complete => "Complete!",
            Stage::Failed => "Error occurred",
        }
    }

    /// Position in the forward sequence, used for step indicators.
    pub fn step(&self) -> usize {
        match self {
            Stage::Connecting => 0,
            Stage::MeasuringLatency => 1,
            Stage::Downloading => 2,
            Stage::Uploading => 3,
            Stage::Complete | Stage::Failed => 4,
        }
    }
}

/// Current stage plus the most recent readings shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub stage: Stage,
    pub server_name: Option<String>,
    pub server_location: Option<String>,
    /// Live throughput for the current download/upload stage.
    pub live_speed_mbps: Option<f64>,
    pub latency_ms: Option<f64>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    pub fn new() -> Self {
        Self {
            stage: Stage::Connecting,
            server_name: None,
            server_location: None,
            live_speed_mbps: None,
            latency_ms: None,
        }
    }

    /// Moves to `Failed`, keeping the readings gathered so far.
    pub fn fail(&self) -> Self {
        Self {
            stage: Stage::Failed,
            live_speed_mbps: None,
            ..self.clone()
        }
    }

    /// Human-readable server line, e.g. `UARNet - Lviv`.
    pub fn server_label(&self) -> Option<String> {
        let name = self.server_name.as_deref()?;
        Some(match self.server_location.as_deref() {
            Some(location) if !location.is_empty() => format!("{} - {}", name, location),
            _ => name.to_string(),
        })
    }
}

/// Returns the state that results from applying `event` to `state`.
pub fn apply(event: &ClassifiedEvent, state: &ProgressState) -> ProgressState {
    if state.stage.is_terminal() {
        return state.clone();
    }
    let mut next = state.clone();
    match event {
        ClassifiedEvent::ServerIdentified {
            name,
            location,
            latency_ms,
            ..
        } => {
            next.server_name = Some(name.clone());
            if location.is_some() {
                next.server_location = location.clone();
            }
            if let Some(ms) = latency_ms {
                return apply(&ClassifiedEvent::LatencyMeasured { ms: *ms }, &next);
            }
        }
        ClassifiedEvent::LatencyMeasured { ms } => {
            if next.stage <= Stage::MeasuringLatency {
                next.stage = Stage::MeasuringLatency;
                next.latency_ms = Some(*ms);
            }
        }
        ClassifiedEvent::DownloadSample { mbps } => {
            if next.stage <= Stage::Downloading {
                next.stage = Stage::Downloading;
                next.live_speed_mbps = Some(*mbps);
            }
        }
        ClassifiedEvent::UploadSample { mbps } => {
            next.stage = Stage::Uploading;
            next.live_speed_mbps = Some(*mbps);
        }
        ClassifiedEvent::Completed => {
            next.stage = Stage::Complete;
            next.live_speed_mbps = None;
        }
        ClassifiedEvent::Connecting | ClassifiedEvent::Unrecognized => {}
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fold(events: &[ClassifiedEvent]) -> ProgressState {
        events
            .iter()
            .fold(ProgressState::new(), |state, event| apply(event, &state))
    }

    #[test]
    fn starts_connecting() {
        let state = ProgressState::new();
        assert_eq!(state.stage, Stage::Connecting);
        assert!(state.server_name.is_none());
    }

    #[test]
    fn server_identified_keeps_stage_and_sets_name() {
        let state = fold(&[ClassifiedEvent::ServerIdentified {
            name: "UARNet".into(),
            location: Some("Lviv".into()),
            id: Some(2445),
            latency_ms: None,
        }]);
        assert_eq!(state.stage, Stage::Connecting);
        assert_eq!(state.server_label().as_deref(), Some("UARNet - Lviv"));
    }

    #[test]
    fn server_with_latency_moves_to_latency_stage() {
        let state = fold(&[ClassifiedEvent::ServerIdentified {
            name: "Example Corp".into(),
            location: None,
            id: Some(123),
            latency_ms: Some(12.5),
        }]);
        assert_eq!(state.stage, Stage::MeasuringLatency);
        assert_eq!(state.latency_ms, Some(12.5));
    }

    #[test]
    fn full_sequence_reaches_complete() {
        let state = fold(&[
            ClassifiedEvent::Connecting,
            ClassifiedEvent::LatencyMeasured { ms: 3.0 },
            ClassifiedEvent::DownloadSample { mbps: 90.0 },
            ClassifiedEvent::UploadSample { mbps: 40.0 },
        ]);
        assert_eq!(state.stage, Stage::Uploading);
        assert_eq!(state.live_speed_mbps, Some(40.0));
        let done = apply(&ClassifiedEvent::Completed, &state);
        assert_eq!(done.stage, Stage::Complete);
        assert_eq!(done.live_speed_mbps, None);
        assert_eq!(done.latency_ms, Some(3.0));
    }

    #[test]
    fn stray_download_during_upload_does_not_regress() {
        let state = fold(&[
            ClassifiedEvent::UploadSample { mbps: 40.0 },
            ClassifiedEvent::DownloadSample { mbps: 95.0 },
        ]);
        assert_eq!(state.stage, Stage::Uploading);
        assert_eq!(state.live_speed_mbps, Some(40.0));
    }

    #[test]
    fn late_latency_is_ignored() {
        let state = fold(&[
            ClassifiedEvent::LatencyMeasured { ms: 3.0 },
            ClassifiedEvent::DownloadSample { mbps: 95.0 },
            ClassifiedEvent::LatencyMeasured { ms: 40.0 },
        ]);
        assert_eq!(state.stage, Stage::Downloading);
        assert_eq!(state.latency_ms, Some(3.0));
    }

    #[test]
    fn repeated_sample_is_idempotent() {
        let sample = ClassifiedEvent::DownloadSample { mbps: 50.0 };
        let once = fold(&[sample.clone()]);
        let twice = apply(&sample, &once);
        assert_eq!(twice.stage, Stage::Downloading);
        assert_eq!(twice.live_speed_mbps, Some(50.0));
        assert_eq!(once, twice);
    }

    #[test]
    fn failed_is_absorbing() {
        let failed = fold(&[ClassifiedEvent::DownloadSample { mbps: 50.0 }]).fail();
        assert_eq!(failed.stage, Stage::Failed);
        let after = apply(&ClassifiedEvent::UploadSample { mbps: 1.0 }, &failed);
        assert_eq!(after, failed);
        let completed = apply(&ClassifiedEvent::Completed, &failed);
        assert_eq!(completed.stage, Stage::Failed);
    }

    #[test]
    fn complete_ignores_later_events() {
        let done = fold(&[ClassifiedEvent::Completed]);
        let after = apply(&ClassifiedEvent::DownloadSample { mbps: 5.0 }, &done);
        assert_eq!(after.stage, Stage::Complete);
        assert_eq!(after.live_speed_mbps, None);
    }

    fn any_event() -> impl Strategy<Value = ClassifiedEvent> {
        prop_oneof![
            Just(ClassifiedEvent::Connecting),
            Just(ClassifiedEvent::Completed),
            Just(ClassifiedEvent::Unrecognized),
            (0.0f64..1000.0).prop_map(|ms| ClassifiedEvent::LatencyMeasured { ms }),
            (0.0f64..1000.0).prop_map(|mbps| ClassifiedEvent::DownloadSample { mbps }),
            (0.0f64..1000.0).prop_map(|mbps| ClassifiedEvent::UploadSample { mbps }),
            proptest::option::of(0.0f64..100.0).prop_map(|latency_ms| {
                ClassifiedEvent::ServerIdentified {
                    name: "server".into(),
                    location: None,
                    id: None,
                    latency_ms,
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn stages_never_regress(events in proptest::collection::vec(any_event(), 0..40)) {
            let mut state = ProgressState::new();
            for event in &events {
                let next = apply(event, &state);
                prop_assert!(next.stage >= state.stage);
                state = next;
            }
        }
    }
}
