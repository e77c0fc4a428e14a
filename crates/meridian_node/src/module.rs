//! Module trait and runner.
//!
//! Every node module implements `set_up` plus a `loop_once` that performs
//! one unit of work and reports whether anything was done. The runner owns
//! the cadence: it re-polls immediately while work keeps coming and
//! otherwise sleeps until the module's next deadline or the poll timeout,
//! whichever is earlier. Modules that serve several sources alternate
//! between them with an integer-weighted round-robin picker.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error};

#[async_trait]
pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;

    async fn set_up(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Perform one unit of work. Returns true when something was done.
    async fn loop_once(&mut self) -> anyhow::Result<bool>;

    /// Earliest point the runner should wake the module even without work.
    fn next_wake(&self) -> Option<Instant> {
        None
    }
}

pub struct ModuleRunner {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ModuleRunner {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Spawn a module on the runtime.
pub fn start<M: Module>(mut module: M, poll_timeout: Duration) -> ModuleRunner {
    let name = module.name();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        if let Err(err) = module.set_up().await {
            error!("{name} set-up failed: {err:#}");
            return;
        }
        debug!("{name} started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match module.loop_once().await {
                Ok(true) => {}
                Ok(false) => {
                    let mut deadline = Instant::now() + poll_timeout;
                    if let Some(wake) = module.next_wake() {
                        deadline = deadline.min(wake);
                    }
                    tokio::select! {
                        _ = time::sleep_until(deadline) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(err) => {
                    error!("{name} failed: {err:#}");
                    break;
                }
            }
        }
        debug!("{name} stopped");
    });
    ModuleRunner {
        name,
        shutdown: shutdown_tx,
        join,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollSource {
    Main,
    Custom,
}

/// Integer-weighted alternation between a module's main channel and its
/// custom sources: `weights[0]` visits of the main channel, then
/// `weights[1]` visits of the custom sources, and around again.
pub struct WeightedPoller {
    weights: [u32; 2],
    counters: [u32; 2],
    current: usize,
}

impl WeightedPoller {
    pub fn new(weights: [u32; 2]) -> Self {
        Self {
            weights,
            counters: weights,
            current: 0,
        }
    }

    pub fn next_source(&mut self) -> PollSource {
        if self.counters[self.current] == 0 {
            self.current = 1 - self.current;
            self.counters[self.current] = self.weights[self.current];
            if self.counters[self.current] == 0 {
                // A zero-weighted side never gets the turn.
                self.current = 1 - self.current;
                self.counters[self.current] = self.weights[self.current];
            }
        }
        self.counters[self.current] = self.counters[self.current].saturating_sub(1);
        if self.current == 0 {
            PollSource::Main
        } else {
            PollSource::Custom
        }
    }
}
