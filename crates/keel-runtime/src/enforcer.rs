//! Background enforcement loop.
//!
//! Wakes up when a generation is committed or when the interval elapses, then resolves the last
//! generation and applies the plan. Wake-ups coalesce: several commits while a run is in progress
//! lead to a single follow-up run.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::apply::{ApplyReport, PlanExecutor};
use crate::engine::Engine;
use crate::error::EngineError;

pub struct Enforcer {
    engine: Arc<Engine>,
    executor: PlanExecutor,
    interval: Duration,
    last_report: Mutex<Option<ApplyReport>>,
}

impl Enforcer {
    pub fn new(engine: Arc<Engine>, executor: PlanExecutor, interval: Duration) -> Self {
        Self {
            engine,
            executor,
            interval,
            last_report: Mutex::new(None),
        }
    }

    /// Report of the most recent run.
    pub fn last_report(&self) -> Option<ApplyReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one enforcement pass against the last generation.
    pub async fn run_once(&self) -> Result<ApplyReport, EngineError> {
        let report = self.engine.apply_last(&self.executor).await?;
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        Ok(report)
    }

    /// Enforce until `shutdown` completes. Errors of a single pass are logged and the loop keeps
    /// going.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let notifier = self.engine.store().notifier();
        tokio::pin!(shutdown);
        info!(interval = ?self.interval, "Enforcer started");

        loop {
            match self.run_once().await {
                Ok(report) if !report.results.is_empty() => info!(
                    succeeded = report.succeeded(),
                    failed = report.failed(),
                    skipped = report.skipped(),
                    "Enforcement pass finished"
                ),
                Ok(_) => debug!("Enforcement pass had nothing to do"),
                Err(err) => error!(error = %err, "Enforcement pass failed"),
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = notifier.notified() => debug!("Woken up by policy change"),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Enforcer stopped");
    }
}
