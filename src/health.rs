//! Readiness polling for a freshly launched server.
//!
//! A loading server exposes `/metrics` before it can list models, so an
//! instance only counts as ready once both endpoints answer in the same cycle.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::IterationConfig;
use crate::docker::{short_id, DockerRunner, DockerRuntime};
use crate::error::SoakError;
use crate::interrupt::{Clock, Interrupted};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Metrics,
    Models,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Metrics => "/metrics",
            Self::Models => "/v1/models",
        }
    }
}

/// Why a single health request did not succeed. Never fatal.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
}

pub trait HealthProbe {
    /// `budget` is the time left before the startup deadline. A request must
    /// not outlive it.
    fn probe(&self, endpoint: Endpoint, budget: Duration) -> Result<(), ProbeFailure>;
}

#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::blocking::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(host: &str, port: u16, request_timeout: Duration) -> Result<Self, SoakError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://{host}:{port}"),
            request_timeout,
        })
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self, endpoint: Endpoint, budget: Duration) -> Result<(), ProbeFailure> {
        let response = self
            .client
            .get(self.url(endpoint))
            .timeout(self.request_timeout.min(budget))
            .send()
            .map_err(|err| ProbeFailure::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeFailure::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    NotChecked,
    Checking,
    Ready,
    Unready,
    RuntimeExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
    RuntimeExited,
}

impl Readiness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Timeout => "timeout",
            Self::RuntimeExited => "runtime_exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Hard upper bound on the whole wait. Checked around every health check
    /// and also caps each request.
    pub deadline: Duration,
    pub interval: Duration,
    pub capture_every: Duration,
}

impl PollSettings {
    pub fn from_config(cfg: &IterationConfig) -> Self {
        Self {
            deadline: cfg.startup_deadline(),
            interval: cfg.poll_interval(),
            capture_every: cfg.capture_every(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub readiness: Readiness,
    pub elapsed: Duration,
    pub cycles: u32,
}

/// One dual-endpoint check. Models is only asked once metrics answered.
/// `remaining` yields the budget left for each request; an exhausted budget
/// fails the check without sending anything.
pub fn check_once<P, B>(probe: &P, remaining: B) -> HealthState
where
    P: HealthProbe,
    B: Fn() -> Duration,
{
    for endpoint in [Endpoint::Metrics, Endpoint::Models] {
        let budget = remaining();
        if budget.is_zero() {
            debug!(endpoint = endpoint.path(), "no time left for request");
            return HealthState::Unready;
        }
        if let Err(failure) = probe.probe(endpoint, budget) {
            debug!(endpoint = endpoint.path(), %failure, "endpoint not ready");
            return HealthState::Unready;
        }
    }
    HealthState::Ready
}

/// Polls until both endpoints answer, the container stops, or the deadline
/// passes. `capture` runs every `capture_every` of elapsed polling time.
pub fn await_ready<R, P, C, F>(
    runtime: &DockerRuntime<'_, R>,
    probe: &P,
    clock: &C,
    container_id: &str,
    settings: PollSettings,
    mut capture: F,
) -> Result<PollReport, Interrupted>
where
    R: DockerRunner,
    P: HealthProbe,
    C: Clock,
    F: FnMut(Duration),
{
    let container = short_id(container_id);
    let started = clock.now();
    let mut state = HealthState::NotChecked;
    let mut cycles = 0u32;
    let mut next_capture = settings.capture_every;

    let transition = |state: &mut HealthState, next: HealthState| {
        if *state != next {
            debug!(container, from = ?*state, to = ?next, "health state changed");
            *state = next;
        }
    };

    loop {
        if clock.interrupted() {
            return Err(Interrupted);
        }
        let elapsed = clock.now().saturating_duration_since(started);
        if elapsed >= settings.deadline {
            return Ok(PollReport {
                readiness: Readiness::Timeout,
                elapsed,
                cycles,
            });
        }
        cycles += 1;

        if !runtime.is_running(container_id) {
            transition(&mut state, HealthState::RuntimeExited);
            return Ok(PollReport {
                readiness: Readiness::RuntimeExited,
                elapsed: clock.now().saturating_duration_since(started),
                cycles,
            });
        }

        transition(&mut state, HealthState::Checking);
        let checked = check_once(probe, || {
            settings
                .deadline
                .saturating_sub(clock.now().saturating_duration_since(started))
        });
        transition(&mut state, checked);
        let elapsed = clock.now().saturating_duration_since(started);
        if checked == HealthState::Ready && elapsed <= settings.deadline {
            return Ok(PollReport {
                readiness: Readiness::Ready,
                elapsed,
                cycles,
            });
        }
        if elapsed >= settings.deadline {
            transition(&mut state, HealthState::Unready);
            return Ok(PollReport {
                readiness: Readiness::Timeout,
                elapsed,
                cycles,
            });
        }

        if elapsed >= next_capture {
            capture(elapsed);
            while next_capture <= elapsed {
                next_capture += settings.capture_every;
            }
        }

        let remaining = settings.deadline.saturating_sub(elapsed);
        clock.sleep(settings.interval.min(remaining))?;
    }
}
