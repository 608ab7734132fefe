//! Generic units of work and the FIFO queue that drains them.
//!
//! A task yields one [`TaskOutcome`] per unit it ran: exactly one for a
//! guestless task, one per guest for a multi-guest task. Guest units run
//! concurrently on a thread pool sized to the guest count, and their outcomes
//! are reported in the order they finished.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;

use rayon::ThreadPoolBuilder;
use tracing::{debug, info, info_span, warn};

use crate::error::{OrchestratorError, Result, RunExit};
use crate::guest::Guest;

#[derive(Debug)]
pub enum UnitStatus<T> {
    Succeeded(T),
    Failed(OrchestratorError),
    ExitRequested(RunExit),
}

/// What a single unit of a task produced.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub task_id: u64,
    pub task_name: String,
    pub guest: Option<Arc<dyn Guest>>,
    pub status: UnitStatus<T>,
}

impl<T> TaskOutcome<T> {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, UnitStatus::Failed(_))
    }

    pub fn is_exit_request(&self) -> bool {
        matches!(self.status, UnitStatus::ExitRequested(_))
    }

    pub fn guest_name(&self) -> Option<&str> {
        self.guest.as_ref().map(|guest| guest.name())
    }

    /// An exit request comes back as [`OrchestratorError::Exit`].
    pub fn into_result(self) -> Result<T> {
        match self.status {
            UnitStatus::Succeeded(value) => Ok(value),
            UnitStatus::Failed(error) => Err(error),
            UnitStatus::ExitRequested(exit) => Err(OrchestratorError::Exit(exit)),
        }
    }
}

/// Identity of a unit. Every outcome is a fresh value built from it.
#[derive(Debug, Clone)]
pub struct UnitOrigin {
    task_id: u64,
    task_name: String,
    guest: Option<Arc<dyn Guest>>,
}

impl UnitOrigin {
    pub fn new(task_id: u64, task_name: impl Into<String>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            guest: None,
        }
    }

    pub fn for_guest(&self, guest: &Arc<dyn Guest>) -> Self {
        Self {
            guest: Some(Arc::clone(guest)),
            ..self.clone()
        }
    }

    fn outcome<T>(&self, status: UnitStatus<T>) -> TaskOutcome<T> {
        TaskOutcome {
            task_id: self.task_id,
            task_name: self.task_name.clone(),
            guest: self.guest.clone(),
            status,
        }
    }

    pub fn succeeded<T>(&self, value: T) -> TaskOutcome<T> {
        self.outcome(UnitStatus::Succeeded(value))
    }

    pub fn failed<T>(&self, error: OrchestratorError) -> TaskOutcome<T> {
        self.outcome(UnitStatus::Failed(error))
    }

    pub fn exit_requested<T>(&self, exit: RunExit) -> TaskOutcome<T> {
        self.outcome(UnitStatus::ExitRequested(exit))
    }

    /// Classify a body's result. Exit requests are kept apart from errors.
    pub fn from_result<T>(&self, result: Result<T>) -> TaskOutcome<T> {
        match result {
            Ok(value) => self.succeeded(value),
            Err(OrchestratorError::Exit(exit)) => self.exit_requested(exit),
            Err(error) => self.failed(error),
        }
    }

    fn settle<T>(&self, caught: thread::Result<Result<T>>) -> TaskOutcome<T> {
        match caught {
            Ok(result) => self.from_result(result),
            Err(payload) => self.failed(OrchestratorError::Panicked(panic_message(payload))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub trait Task: Send {
    type Output;

    fn name(&self) -> &str;

    /// Run every unit of the task and hand back their outcomes.
    fn go(self: Box<Self>, task_id: u64) -> Vec<TaskOutcome<Self::Output>>;
}

type StandaloneBody<T> = Box<dyn FnOnce() -> Result<T> + Send>;

/// Runs its body exactly once.
pub struct GuestlessTask<T> {
    name: String,
    body: StandaloneBody<T>,
}

impl<T> GuestlessTask<T> {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }
}

impl<T: Send> Task for GuestlessTask<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn go(self: Box<Self>, task_id: u64) -> Vec<TaskOutcome<T>> {
        let GuestlessTask { name, body } = *self;
        let origin = UnitOrigin::new(task_id, &name);

        let span = info_span!("task", name = %name);
        let caught = {
            let _entered = span.enter();
            panic::catch_unwind(AssertUnwindSafe(body))
        };
        vec![origin.settle(caught)]
    }
}

type GuestBody<T> = dyn Fn(&Arc<dyn Guest>) -> Result<T> + Send + Sync;

/// Runs its body once per guest, all guests at the same time.
pub struct MultiGuestTask<T> {
    name: String,
    guests: Vec<Arc<dyn Guest>>,
    body: Arc<GuestBody<T>>,
}

impl<T> MultiGuestTask<T> {
    pub fn new<F>(name: impl Into<String>, guests: Vec<Arc<dyn Guest>>, body: F) -> Self
    where
        F: Fn(&Arc<dyn Guest>) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            guests,
            body: Arc::new(body),
        }
    }

    pub fn guests(&self) -> &[Arc<dyn Guest>] {
        &self.guests
    }
}

impl<T: Send> Task for MultiGuestTask<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn go(self: Box<Self>, task_id: u64) -> Vec<TaskOutcome<T>> {
        let MultiGuestTask { name, guests, body } = *self;
        if guests.is_empty() {
            return Vec::new();
        }

        let origin = UnitOrigin::new(task_id, &name);
        let pool_name = name.clone();
        let pool = match ThreadPoolBuilder::new()
            .num_threads(guests.len())
            .thread_name(move |index| format!("{}-{}", pool_name, index))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => return vec![origin.failed(OrchestratorError::ThreadPool(e.to_string()))],
        };

        // Pad labels so interleaved output lines up
        let width = guests.iter().map(|guest| guest.name().len()).max().unwrap_or(0);
        let (tx, rx) = mpsc::channel();

        debug!(task = %name, guests = guests.len(), "Starting guest units");
        pool.scope(|scope| {
            for guest in &guests {
                let tx = tx.clone();
                let body = &body;
                let origin = origin.for_guest(guest);
                scope.spawn(move |_| {
                    let label = format!("{:<width$}", guest.name(), width = width);
                    let span = info_span!("guest", guest = %label);
                    let caught = {
                        let _entered = span.enter();
                        panic::catch_unwind(AssertUnwindSafe(|| body(guest)))
                    };
                    let _ = tx.send(origin.settle(caught));
                });
            }
        });
        drop(tx);

        rx.into_iter().collect()
    }
}

/// FIFO holder of tasks.
pub struct Queue<T> {
    name: String,
    tasks: VecDeque<(u64, Box<dyn Task<Output = T>>)>,
    next_id: u64,
}

impl<T: Send + 'static> Queue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Add a task and return its id.
    pub fn enqueue<K>(&mut self, task: K) -> u64
    where
        K: Task<Output = T> + 'static,
    {
        self.next_id += 1;
        debug!(queue = %self.name, task = %task.name(), id = self.next_id, "Enqueued task");
        self.tasks.push_back((self.next_id, Box::new(task)));
        self.next_id
    }

    /// Drain the queue lazily.
    ///
    /// With `stop_on_error`, a task with any failing unit is the last one
    /// run. An exit request always stops the queue. Tasks left in the queue
    /// are abandoned.
    pub fn run(self, stop_on_error: bool) -> QueueRun<T> {
        QueueRun {
            name: self.name,
            tasks: self.tasks,
            pending: VecDeque::new(),
            stop_on_error,
            stopped: false,
        }
    }
}

pub struct QueueRun<T> {
    name: String,
    tasks: VecDeque<(u64, Box<dyn Task<Output = T>>)>,
    pending: VecDeque<TaskOutcome<T>>,
    stop_on_error: bool,
    stopped: bool,
}

impl<T> Iterator for QueueRun<T> {
    type Item = TaskOutcome<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(outcome) = self.pending.pop_front() {
                return Some(outcome);
            }
            if self.stopped {
                return None;
            }

            let (id, task) = self.tasks.pop_front()?;
            info!(queue = %self.name, task = %task.name(), id, "Running task");
            let outcomes = task.go(id);

            let failed = outcomes.iter().any(TaskOutcome::is_failure);
            let exit = outcomes.iter().any(TaskOutcome::is_exit_request);
            if exit || (failed && self.stop_on_error) {
                self.stopped = true;
                if !self.tasks.is_empty() {
                    warn!(
                        queue = %self.name,
                        abandoned = self.tasks.len(),
                        "Stopping queue, remaining tasks are abandoned"
                    );
                }
            }

            self.pending.extend(outcomes);
        }
    }
}
