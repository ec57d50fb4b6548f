//! Iteration lifecycle: launch, await readiness, soak, tear down, cool down.
//!
//! The controller owns at most one [`InstanceHandle`] at a time. Teardown
//! consumes the handle, so an instance is torn down at most once and the next
//! launch cannot start while a previous container is still tracked.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::config::IterationConfig;
use crate::docker::{short_id, DockerRunner, DockerRuntime};
use crate::error::SoakError;
use crate::health::{await_ready, HealthProbe, PollSettings, Readiness};
use crate::interrupt::Clock;
use crate::logs::{capture, log_file_path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: String,
    /// Assigned once the launch has succeeded.
    pub log_path: Option<PathBuf>,
    pub created_at: DateTime<Local>,
}

impl InstanceHandle {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Launching,
    AwaitingReady,
    Soaking,
    TearingDown,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    LaunchFailed,
    ReadinessTimeout,
    RuntimeExited,
}

impl IterationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::LaunchFailed => "launch_failed",
            Self::ReadinessTimeout => "readiness_timeout",
            Self::RuntimeExited => "runtime_exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }
}

pub struct Controller<'a, R: DockerRunner, P: HealthProbe, C: Clock> {
    config: &'a IterationConfig,
    runtime: DockerRuntime<'a, R>,
    probe: &'a P,
    clock: &'a C,
    active: Option<InstanceHandle>,
    phase: Phase,
}

impl<'a, R: DockerRunner, P: HealthProbe, C: Clock> Controller<'a, R, P, C> {
    pub fn new(config: &'a IterationConfig, runner: &'a R, probe: &'a P, clock: &'a C) -> Self {
        Self {
            config,
            runtime: DockerRuntime::new(runner),
            probe,
            clock,
            active: None,
            phase: Phase::Idle,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn active(&self) -> Option<&InstanceHandle> {
        self.active.as_ref()
    }

    /// Runs every configured iteration. On interrupt or an unexpected fault the
    /// active instance is captured and torn down before returning.
    pub fn run(&mut self) -> Result<RunOutcome, SoakError> {
        let total = self.config.schedule.iterations;
        fs::create_dir_all(self.config.log_dir())?;
        info!(
            iterations = total,
            image = %self.config.server.image,
            model = %self.config.model.name,
            log_dir = %self.config.log_dir().display(),
            "starting soak run"
        );

        let mut current = None;
        match self.run_iterations(total, &mut current) {
            Ok(()) => {
                info!(iterations = total, "all iterations finished");
                Ok(RunOutcome::Completed)
            }
            Err(SoakError::Interrupted) => {
                match current {
                    Some(iteration) => {
                        info!(iteration, total, "test interrupted by user")
                    }
                    None => info!("test interrupted by user before the first iteration"),
                }
                self.abort_active(current);
                Ok(RunOutcome::Interrupted)
            }
            Err(err) => {
                error!(iteration = ?current, error = %err, "unexpected error");
                self.abort_active(current);
                Err(err)
            }
        }
    }

    fn run_iterations(&mut self, total: u32, current: &mut Option<u32>) -> Result<(), SoakError> {
        for iteration in 1..=total {
            if self.clock.interrupted() {
                return Err(SoakError::Interrupted);
            }
            *current = Some(iteration);
            let outcome = self.run_iteration(iteration, total)?;
            match outcome {
                IterationOutcome::Completed => {
                    info!(iteration, total, outcome = outcome.as_str(), "iteration finished")
                }
                _ => warn!(iteration, total, outcome = outcome.as_str(), "iteration failed"),
            }
            // A signal can land while no sleep is pending, e.g. during launch.
            if self.clock.interrupted() {
                return Err(SoakError::Interrupted);
            }
            if iteration < total {
                info!(
                    iteration,
                    cooldown_secs = self.config.schedule.cooldown_sec,
                    "cooling down"
                );
                self.clock.sleep(self.config.cooldown())?;
            }
        }
        Ok(())
    }

    /// Drives one container from launch to teardown.
    pub fn run_iteration(&mut self, iteration: u32, total: u32) -> Result<IterationOutcome, SoakError> {
        if let Some(stale) = &self.active {
            return Err(SoakError::Process(format!(
                "container {} from a previous iteration is still active",
                stale.short_id()
            )));
        }
        info!(iteration, total, "=== starting test iteration ===");

        self.enter(Phase::Launching);
        let id = match self.runtime.launch(self.config) {
            Ok(id) => id,
            Err(err) => {
                error!(
                    iteration,
                    op = err.op().as_str(),
                    error = %err,
                    hint = err.hint().unwrap_or(""),
                    "failed to start container"
                );
                self.enter(Phase::Aborted);
                self.enter(Phase::Idle);
                return Ok(IterationOutcome::LaunchFailed);
            }
        };
        let created_at = Local::now();
        info!(iteration, container = short_id(&id), "container started");
        let log_path = log_file_path(&self.config.log_dir(), &id, created_at);
        self.active = Some(InstanceHandle {
            id: id.clone(),
            log_path: None,
            created_at,
        });

        self.enter(Phase::AwaitingReady);
        if let Some(handle) = self.active.as_mut() {
            handle.log_path = Some(log_path.clone());
        }
        info!(
            iteration,
            container = short_id(&id),
            log_file = %log_path.display(),
            deadline_secs = self.config.schedule.startup_timeout_sec,
            "waiting for server readiness"
        );
        let report = {
            let runtime = &self.runtime;
            await_ready(
                runtime,
                self.probe,
                self.clock,
                &id,
                PollSettings::from_config(self.config),
                |elapsed| {
                    if let Err(err) = capture(runtime, &id, Some(&log_path)) {
                        warn!(
                            iteration,
                            container = short_id(&id),
                            elapsed_secs = elapsed.as_secs(),
                            error = %err,
                            "interim log capture failed"
                        );
                    }
                },
            )?
        };

        let outcome = match report.readiness {
            Readiness::Ready => None,
            Readiness::Timeout => Some(IterationOutcome::ReadinessTimeout),
            Readiness::RuntimeExited => Some(IterationOutcome::RuntimeExited),
        };
        if let Some(outcome) = outcome {
            warn!(
                iteration,
                container = short_id(&id),
                elapsed_secs = report.elapsed.as_secs(),
                cycles = report.cycles,
                readiness = report.readiness.as_str(),
                "server did not become ready"
            );
            self.enter(Phase::Aborted);
            self.teardown(Some(iteration));
            return Ok(outcome);
        }
        info!(
            iteration,
            container = short_id(&id),
            elapsed_secs = report.elapsed.as_secs(),
            "service is running successfully"
        );

        self.enter(Phase::Soaking);
        info!(iteration, soak_secs = self.config.schedule.soak_sec, "soaking");
        self.clock.sleep(self.config.soak())?;

        self.teardown(Some(iteration));
        Ok(IterationOutcome::Completed)
    }

    /// Final capture, stop, remove. Best effort: failures are logged and the
    /// handle is released regardless.
    fn teardown(&mut self, iteration: Option<u32>) {
        let Some(handle) = self.active.take() else {
            return;
        };
        self.enter(Phase::TearingDown);
        let container = handle.short_id();
        let age_secs = (Local::now() - handle.created_at).num_seconds();

        if let Err(err) = capture(&self.runtime, &handle.id, handle.log_path.as_deref()) {
            warn!(iteration = ?iteration, container, age_secs, error = %err, "final log capture failed");
        }
        match self.runtime.stop(&handle.id) {
            Ok(()) => debug!(iteration = ?iteration, container, "container stopped"),
            Err(err) => {
                error!(
                    iteration = ?iteration,
                    container,
                    age_secs,
                    error = %err,
                    hint = err.hint().unwrap_or(""),
                    "error stopping container"
                )
            }
        }
        match self.runtime.remove(&handle.id) {
            Ok(()) => info!(iteration = ?iteration, container, "container stopped and removed"),
            Err(err) => {
                error!(
                    iteration = ?iteration,
                    container,
                    age_secs,
                    error = %err,
                    hint = err.hint().unwrap_or(""),
                    "error removing container"
                )
            }
        }
        self.enter(Phase::Idle);
    }

    fn abort_active(&mut self, iteration: Option<u32>) {
        if self.active.is_some() {
            self.teardown(iteration);
        }
        self.enter(Phase::Idle);
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "phase transition");
            self.phase = phase;
        }
    }
}
