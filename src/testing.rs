//! Test doubles shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::docker::{CommandOutput, DockerRunner};
use crate::health::{Endpoint, HealthProbe, ProbeFailure};
use crate::interrupt::{Clock, Interrupted};

pub const CONTAINER_ID: &str = "4f2a9c0d1e3b77aa99110c3e";

/// Ordered record of runtime calls and sleeps across doubles.
pub type Journal = Rc<RefCell<Vec<String>>>;

pub fn ok_output(stdout: &[u8]) -> CommandOutput {
    CommandOutput {
        status_code: 0,
        stdout: stdout.to_vec(),
        stderr: Vec::new(),
    }
}

#[derive(Default)]
pub struct MockDockerRunner {
    calls: RefCell<Vec<Vec<String>>>,
    outputs: RefCell<BTreeMap<String, VecDeque<Result<CommandOutput, io::ErrorKind>>>>,
    journal: Option<Journal>,
}

impl MockDockerRunner {
    pub fn with_journal(journal: &Journal) -> Self {
        Self {
            journal: Some(Rc::clone(journal)),
            ..Self::default()
        }
    }

    /// Queues a response for the next call whose first argument is `subcommand`.
    pub fn push_output(&self, subcommand: &str, output: CommandOutput) {
        self.outputs
            .borrow_mut()
            .entry(subcommand.to_string())
            .or_default()
            .push_back(Ok(output));
    }

    pub fn fail_spawn(&self, subcommand: &str, kind: io::ErrorKind) {
        self.outputs
            .borrow_mut()
            .entry(subcommand.to_string())
            .or_default()
            .push_back(Err(kind));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .count()
    }
}

impl DockerRunner for MockDockerRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, io::Error> {
        self.calls.borrow_mut().push(args.to_vec());
        let subcommand = args.first().cloned().unwrap_or_default();
        if let Some(journal) = &self.journal {
            journal.borrow_mut().push(format!("docker {subcommand}"));
        }
        let queued = self
            .outputs
            .borrow_mut()
            .get_mut(&subcommand)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(Ok(output)) => Ok(output),
            Some(Err(kind)) => Err(io::Error::new(kind, "mock spawn failure")),
            None => Ok(match subcommand.as_str() {
                "run" => ok_output(format!("{CONTAINER_ID}\n").as_bytes()),
                "inspect" => ok_output(b"true\n"),
                "logs" => ok_output(b"INFO: Application startup complete.\n"),
                _ => ok_output(b""),
            }),
        }
    }
}

/// Virtual time: only `sleep` advances it.
pub struct FakeClock {
    base: Instant,
    offset: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
    interrupt_on: Cell<Option<usize>>,
    interrupted: Cell<bool>,
    journal: Option<Journal>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(Vec::new()),
            interrupt_on: Cell::new(None),
            interrupted: Cell::new(false),
            journal: None,
        }
    }
}

impl FakeClock {
    pub fn with_journal(journal: &Journal) -> Self {
        Self {
            journal: Some(Rc::clone(journal)),
            ..Self::default()
        }
    }

    /// The `n`th call to `sleep` (1-based) is cut short by an interrupt.
    pub fn interrupt_on_sleep(&self, n: usize) {
        self.interrupt_on.set(Some(n));
    }

    pub fn interrupt_now(&self) {
        self.interrupted.set(true);
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    /// Moves virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.offset.set(self.offset.get() + duration);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }

    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.sleeps.borrow_mut().push(duration);
        if let Some(journal) = &self.journal {
            journal
                .borrow_mut()
                .push(format!("sleep {}s", duration.as_secs()));
        }
        if self.interrupt_on.get() == Some(self.sleeps.borrow().len()) {
            self.interrupted.set(true);
        }
        if self.interrupted.get() {
            return Err(Interrupted);
        }
        self.offset.set(self.offset.get() + duration);
        Ok(())
    }

    fn interrupted(&self) -> bool {
        self.interrupted.get()
    }
}

/// Answers every request with success unless failures were queued.
#[derive(Default)]
pub struct ScriptedProbe {
    metrics_failures: Cell<u32>,
    models_failures: Cell<u32>,
    requests: RefCell<Vec<Endpoint>>,
}

impl ScriptedProbe {
    /// The next `count` requests to `endpoint` fail with HTTP 503.
    pub fn fail(&self, endpoint: Endpoint, count: u32) {
        self.counter(endpoint).set(count);
    }

    pub fn requests(&self) -> Vec<Endpoint> {
        self.requests.borrow().clone()
    }

    fn counter(&self, endpoint: Endpoint) -> &Cell<u32> {
        match endpoint {
            Endpoint::Metrics => &self.metrics_failures,
            Endpoint::Models => &self.models_failures,
        }
    }
}

impl HealthProbe for ScriptedProbe {
    fn probe(&self, endpoint: Endpoint, _budget: Duration) -> Result<(), ProbeFailure> {
        self.requests.borrow_mut().push(endpoint);
        let remaining = self.counter(endpoint);
        if remaining.get() > 0 {
            remaining.set(remaining.get() - 1);
            return Err(ProbeFailure::Status(503));
        }
        Ok(())
    }
}
