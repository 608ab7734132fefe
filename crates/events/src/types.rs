//! Event types for the test run event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event as observers receive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    /// Position of the event in the bus's publication order
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
        pub fn new(sequence: u64, event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events in a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Step events
    /// Step status changed
    #[serde(rename = "step.status_changed")]
    StepStatusChanged {
        step: String,
        from_status: String,
        to_status: String,
    },

    // Phase events
    /// A phase started on a guest (or standalone when `guest` is empty)
    #[serde(rename = "phase.started")]
    PhaseStarted {
        step: String,
        phase: String,
        guest: Option<String>,
    },

    /// A phase finished on a guest
    #[serde(rename = "phase.finished")]
    PhaseFinished {
        step: String,
        phase: String,
        guest: Option<String>,
        success: bool,
    },

    // Test events
    /// A test invocation started
    #[serde(rename = "test.started")]
    TestStarted {
        test: String,
        serial_number: u32,
        guest: String,
    },

    /// A test invocation produced its final result
    #[serde(rename = "test.finished")]
    TestFinished {
        test: String,
        serial_number: u32,
        guest: String,
        outcome: String,
    },

    // Guest events
    /// Guest was rebooted
    #[serde(rename = "guest.rebooted")]
    GuestRebooted {
        guest: String,
        reboot_count: u32,
        hard: bool,
    },

    // Run events
    /// The run was interrupted by a signal
    #[serde(rename = "run.interrupted")]
    RunInterrupted { guest: String },

    /// A test requested the run to abort
    #[serde(rename = "run.aborted")]
    RunAborted { test: String, guest: String },

    // System events
    /// A phase or unit failed outside of any test result
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the guest name associated with this event, if any
    pub fn guest(&self) -> Option<&str> {
        match self {
            Event::StepStatusChanged { .. } => None,
            Event::PhaseStarted { guest, .. } => guest.as_deref(),
            Event::PhaseFinished { guest, .. } => guest.as_deref(),
            Event::TestStarted { guest, .. } => Some(guest),
            Event::TestFinished { guest, .. } => Some(guest),
            Event::GuestRebooted { guest, .. } => Some(guest),
            Event::RunInterrupted { guest } => Some(guest),
            Event::RunAborted { guest, .. } => Some(guest),
            Event::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let event = Event::TestStarted {
            test: "/smoke".to_string(),
            serial_number: 1,
            guest: "default-0".to_string(),
        };
        let envelope = EventEnvelope::new(7, event);

        assert!(!envelope.id.is_nil());
        assert_eq!(envelope.sequence, 7);
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::StepStatusChanged {
            step: "execute".to_string(),
            from_status: "todo".to_string(),
            to_status: "done".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("step.status_changed"));
        assert!(json.contains("from_status"));
        assert!(json.contains("to_status"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"guest.rebooted","guest":"client","reboot_count":2,"hard":false}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        match event {
            Event::GuestRebooted {
                guest,
                reboot_count,
                hard,
            } => {
                assert_eq!(guest, "client");
                assert_eq!(reboot_count, 2);
                assert!(!hard);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_guest() {
        let event = Event::PhaseStarted {
            step: "prepare".to_string(),
            phase: "default-0".to_string(),
            guest: Some("server".to_string()),
        };
        assert_eq!(event.guest(), Some("server"));

        let standalone = Event::PhaseStarted {
            step: "discover".to_string(),
            phase: "default-0".to_string(),
            guest: None,
        };
        assert_eq!(standalone.guest(), None);

        let error_event = Event::Error {
            message: "test".to_string(),
            context: None,
        };
        assert_eq!(error_event.guest(), None);
    }
}
