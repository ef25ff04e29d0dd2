//! Task worker
//!
//! Drains due tasks from the engine's queue on a fixed tick and dispatches
//! them one by one. Handlers requeue their own follow-up when a collaborator
//! fails, so an error that still reaches the worker is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::CertificateEngine;

/// Tick used when none is configured
const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// Counters from one drain of the queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub failed: usize,
    pub expired_orders: usize,
}

#[derive(Debug)]
pub struct Worker {
    engine: Arc<CertificateEngine>,
    tick: Duration,
}

impl Worker {
    pub fn new(engine: Arc<CertificateEngine>) -> Self {
        Self {
            engine,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(10));
        self
    }

    /// Dispatch every task due now
    pub async fn run_once(&self) -> TickReport {
        let mut report = TickReport {
            expired_orders: self.engine.expire_stale_orders(),
            ..TickReport::default()
        };

        let ports = self.engine.ports();
        let due = ports.queue.take_due(ports.clock.now());
        for task in due {
            let name = task.name();
            report.dispatched += 1;
            if let Err(e) = self.engine.dispatch(task).await {
                report.failed += 1;
                error!(task = name, error = %e, "Task failed");
            }
        }

        if report.dispatched > 0 || report.expired_orders > 0 {
            debug!(
                dispatched = report.dispatched,
                failed = report.failed,
                expired_orders = report.expired_orders,
                "Worker tick"
            );
        }
        report
    }

    /// Tick until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(tick_ms = self.tick.as_millis() as u64, "Starting task worker");

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    info!(pending = self.engine.ports().queue.len(), "Task worker stopping");
                    break;
                }
            }
        }
    }
}
