//! Queue of phases, each run against its own subset of guests.

use std::sync::Arc;

use events::Event;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::guest::Guest;
use crate::phase::{Phase, PhaseContext, PhaseOutput, StepKind};
use crate::queue::{GuestlessTask, MultiGuestTask, Queue, QueueRun};

/// Phases are drained in the order they were enqueued. Callers sort them by
/// `order` first.
pub struct PhaseQueue {
    step: StepKind,
    ctx: Arc<PhaseContext>,
    queue: Queue<PhaseOutput>,
}

impl PhaseQueue {
    pub fn new(ctx: PhaseContext) -> Self {
        let step = ctx.step;
        Self {
            step,
            ctx: Arc::new(ctx),
            queue: Queue::new(step.as_str()),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a phase with the guests it applies to.
    ///
    /// Standalone phases ignore `guests`. A per-guest phase with no guests is
    /// rejected, it usually means a mistyped `where` filter.
    pub fn enqueue(&mut self, phase: &Phase, guests: &[Arc<dyn Guest>]) -> Result<u64> {
        let plugin = match phase {
            Phase::Standalone(_) => return self.enqueue_standalone(phase),
            Phase::PerGuest(plugin) => Arc::clone(plugin),
        };

        if guests.is_empty() {
            return Err(OrchestratorError::EmptyGuestSet(phase.name().to_string()));
        }

        let name = phase.name().to_string();
        let guests: Vec<Arc<dyn Guest>> = guests.iter().map(|guest| guest.reparent(&name)).collect();
        debug!(step = %self.step, phase = %name, guests = guests.len(), "Queueing phase");

        let ctx = Arc::clone(&self.ctx);
        let step = self.step;
        let phase_name = name.clone();
        let task = MultiGuestTask::new(name, guests, move |guest: &Arc<dyn Guest>| {
            ctx.config.emit(Event::PhaseStarted {
                step: step.as_str().to_string(),
                phase: phase_name.clone(),
                guest: Some(guest.name().to_string()),
            });
            let result = plugin.go(&ctx, guest);
            ctx.config.emit(Event::PhaseFinished {
                step: step.as_str().to_string(),
                phase: phase_name.clone(),
                guest: Some(guest.name().to_string()),
                success: result.is_ok(),
            });
            result
        });

        Ok(self.queue.enqueue(task))
    }

    pub fn enqueue_standalone(&mut self, phase: &Phase) -> Result<u64> {
        let plugin = match phase {
            Phase::Standalone(plugin) => Arc::clone(plugin),
            Phase::PerGuest(_) => {
                return Err(OrchestratorError::specification(format!(
                    "Phase '{}' must run on guests",
                    phase.name()
                )))
            }
        };

        let name = phase.name().to_string();
        debug!(step = %self.step, phase = %name, "Queueing standalone phase");

        let ctx = Arc::clone(&self.ctx);
        let step = self.step;
        let phase_name = name.clone();
        let task = GuestlessTask::new(name, move || {
            ctx.config.emit(Event::PhaseStarted {
                step: step.as_str().to_string(),
                phase: phase_name.clone(),
                guest: None,
            });
            let result = plugin.go(&ctx);
            ctx.config.emit(Event::PhaseFinished {
                step: step.as_str().to_string(),
                phase: phase_name,
                guest: None,
                success: result.is_ok(),
            });
            result
        });

        Ok(self.queue.enqueue(task))
    }

    /// Run all queued phases, stopping after the first phase that failed on
    /// any guest.
    pub fn run(self) -> QueueRun<PhaseOutput> {
        self.queue.run(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::guest::fake::FakeGuest;
    use crate::phase::{Configurable, PhaseCommon, RunsPerGuest, RunsStandalone, PHASE_ORDER_BASE};
    use events::EventBus;
    use std::sync::Mutex;

    /// Per-guest phase recording which phase copy of which guest it saw.
    pub(crate) struct RecordingPhase {
        pub(crate) common: PhaseCommon,
        pub(crate) seen: Arc<Mutex<Vec<(String, Option<String>)>>>,
        pub(crate) fail_on: Option<String>,
    }

    impl RecordingPhase {
        pub(crate) fn phase(name: &str, seen: &Arc<Mutex<Vec<(String, Option<String>)>>>) -> Phase {
            Phase::PerGuest(Arc::new(Self {
                common: PhaseCommon {
                    name: name.to_string(),
                    how: "recording".to_string(),
                    order: PHASE_ORDER_BASE,
                    where_: Vec::new(),
                    summary: None,
                },
                seen: Arc::clone(seen),
                fail_on: None,
            }))
        }
    }

    impl Configurable for RecordingPhase {
        fn common(&self) -> &PhaseCommon {
            &self.common
        }
    }

    impl RunsPerGuest for RecordingPhase {
        fn go(&self, _ctx: &PhaseContext, guest: &Arc<dyn Guest>) -> Result<PhaseOutput> {
            self.seen.lock().unwrap().push((
                guest.name().to_string(),
                guest.phase().map(str::to_string),
            ));
            if self.fail_on.as_deref() == Some(guest.name()) {
                return Err(OrchestratorError::phase_failed(self.name(), "requested failure"));
            }
            Ok(PhaseOutput::None)
        }
    }

    struct CountingStandalone {
        common: PhaseCommon,
    }

    impl Configurable for CountingStandalone {
        fn common(&self) -> &PhaseCommon {
            &self.common
        }
    }

    impl RunsStandalone for CountingStandalone {
        fn go(&self, ctx: &PhaseContext) -> Result<PhaseOutput> {
            Ok(PhaseOutput::Tests(ctx.tests.as_ref().clone()))
        }
    }

    fn guests(names: &[&str]) -> Vec<Arc<dyn Guest>> {
        names
            .iter()
            .map(|name| Arc::new(FakeGuest::new(name)) as Arc<dyn Guest>)
            .collect()
    }

    fn context() -> PhaseContext {
        PhaseContext::new(RunConfig::new("/tmp/run"), StepKind::Prepare, "/tmp/run/prepare")
    }

    #[test]
    fn test_enqueue_empty_guest_set_rejected() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut queue = PhaseQueue::new(context());

        let error = queue
            .enqueue(&RecordingPhase::phase("default-0", &seen), &[])
            .unwrap_err();

        assert!(matches!(error, OrchestratorError::EmptyGuestSet(ref name) if name == "default-0"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_guests_are_reparented() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let originals = guests(&["a", "b"]);
        let mut queue = PhaseQueue::new(context());
        queue
            .enqueue(&RecordingPhase::phase("install", &seen), &originals)
            .unwrap();

        assert_eq!(queue.run().count(), 2);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), Some("install".to_string())),
                ("b".to_string(), Some("install".to_string())),
            ]
        );
        assert!(originals.iter().all(|guest| guest.phase().is_none()));
    }

    #[test]
    fn test_phases_run_in_enqueue_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut queue = PhaseQueue::new(context());
        queue.enqueue(&RecordingPhase::phase("first", &seen), &guests(&["a"])).unwrap();
        queue.enqueue(&RecordingPhase::phase("second", &seen), &guests(&["a"])).unwrap();

        let names: Vec<_> = queue.run().map(|outcome| outcome.task_name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_failed_phase_stops_queue() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failing = Phase::PerGuest(Arc::new(RecordingPhase {
            common: PhaseCommon {
                name: "broken".to_string(),
                how: "recording".to_string(),
                order: PHASE_ORDER_BASE,
                where_: Vec::new(),
                summary: None,
            },
            seen: Arc::clone(&seen),
            fail_on: Some("b".to_string()),
        }));

        let mut queue = PhaseQueue::new(context());
        queue.enqueue(&failing, &guests(&["a", "b"])).unwrap();
        queue.enqueue(&RecordingPhase::phase("after", &seen), &guests(&["a"])).unwrap();

        let outcomes: Vec<_> = queue.run().collect();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.iter().filter(|o| o.is_failure()).count(), 1);
        assert!(seen.lock().unwrap().iter().all(|(_, phase)| phase.as_deref() == Some("broken")));
    }

    #[test]
    fn test_standalone_phase_and_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let ctx = PhaseContext::new(
            RunConfig::new("/tmp/run").with_event_bus(bus),
            StepKind::Discover,
            "/tmp/run/discover",
        )
        .with_tests(vec![testrun_core::TestDefinition::new("/t", "true")]);

        let phase = Phase::Standalone(Arc::new(CountingStandalone {
            common: PhaseCommon {
                name: "default-0".to_string(),
                how: "counting".to_string(),
                order: PHASE_ORDER_BASE,
                where_: Vec::new(),
                summary: None,
            },
        }));

        let mut queue = PhaseQueue::new(ctx);
        queue.enqueue(&phase, &[]).unwrap();
        let outcome = queue.run().next().unwrap();
        assert!(outcome.guest.is_none());
        assert!(matches!(outcome.into_result().unwrap(), PhaseOutput::Tests(tests) if tests.len() == 1));

        let events: Vec<_> = EventBus::drain(&mut rx).into_iter().map(|e| e.event).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], Event::PhaseFinished { success: true, guest: None, .. }));
    }
}
