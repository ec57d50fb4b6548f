use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use thiserror::Error;

use crate::error::SoakError;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Returned from a suspension point when a shutdown signal has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Time source for the iteration loop. Every wait goes through `sleep` so an
/// interrupt is observed no later than the next slice.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> Result<(), Interrupted>;
    fn interrupted(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    shutdown: Arc<AtomicBool>,
}

impl SystemClock {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self { shutdown }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupted() {
                return Err(Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Routes SIGINT/SIGTERM into the returned flag. A second signal while the
/// first is still being handled exits immediately with status 1.
pub fn install_signal_handlers() -> Result<Arc<AtomicBool>, SoakError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&shutdown))?;
        flag::register(signal, Arc::clone(&shutdown))?;
    }
    Ok(shutdown)
}
