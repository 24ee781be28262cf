// src/events.rs
// Structured event stream emitted by the challenge engine. Rendering is the
// caller's problem: the CLI prints these, tests record them.

use serde::Serialize;

/// Outcome of one setup/validation/cleanup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        challenge_id: String,
        vm_name: String,
        snapshot_name: String,
    },
    SnapshotCreated {
        snapshot_name: String,
    },
    VmReady {
        ip: String,
    },
    SetupStep {
        index: usize,
        step_type: String,
        outcome: StepOutcome,
        detail: Option<String>,
    },
    UserReady {
        connect_hint: String,
        objective: String,
    },
    HintViewed {
        index: usize,
        text: String,
        cost: u32,
        running_score: u32,
    },
    ValidationStep {
        index: usize,
        step_type: String,
        outcome: StepOutcome,
        reasons: Vec<String>,
    },
    Result {
        passed: bool,
        final_score: u32,
        base_score: u32,
        hints_used: usize,
        total_hint_cost: u32,
        flag: Option<String>,
    },
    CleanupStep {
        name: String,
        outcome: StepOutcome,
        detail: Option<String>,
    },
    /// A file ownership/mode change performed by permission repair. Never
    /// silent; one event per touched file.
    PermissionRepaired {
        path: String,
        outcome: StepOutcome,
        detail: Option<String>,
    },
    RunFinished,
}

/// Where engine events go. Implementations must be cheap and non-blocking;
/// the engine calls this inline on its only thread.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Sink that drops everything. Handy for library callers that only care
/// about the returned report.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: RunEvent) {}
}

/// Records events in memory; the test suites assert over the sequence.
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<RunEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: RunEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let ev = RunEvent::VmReady {
            ip: "192.168.122.50".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "vm_ready");
        assert_eq!(json["ip"], "192.168.122.50");
    }

    #[test]
    fn recording_sink_preserves_order() {
        let sink = RecordingSink::new();
        sink.emit(RunEvent::RunStarted {
            challenge_id: "lvm-01".into(),
            vm_name: "vm".into(),
            snapshot_name: "snap".into(),
        });
        sink.emit(RunEvent::RunFinished);
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunEvent::RunStarted { .. }));
        assert!(matches!(events[1], RunEvent::RunFinished));
    }
}
