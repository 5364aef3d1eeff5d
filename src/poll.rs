//! Poll loop for one measurement group.
//!
//! Each cycle walks `Reading -> Decoding -> Assembling -> Writing`, then the
//! loop sleeps for the group interval. Transport and decode errors end the
//! loop with an error; nothing else does. Write failures are logged per point
//! and the next cycle runs as usual.
//!
//! Shutdown is a `watch` flag checked before every read, before every write
//! and while sleeping. A read in flight is never interrupted, it is bounded by
//! the transport timeout instead.

use crate::assembler::assemble;
use crate::config::MeasurementGroup;
use crate::decoder::decode;
use crate::error::AppResult;
use crate::gate::FieldCache;
use crate::health::{ErrorSeverity, SystemHealthMonitor};
use crate::sink::{write_logged, PointSink, WriteOutcome};
use crate::transport::RegisterReader;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

/// Phase of the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Waiting for the register block
    Reading,
    /// Reinterpreting register words
    Decoding,
    /// Transforming, gating and building points
    Assembling,
    /// Handing points to the sink
    Writing,
    /// Waiting for the next cycle
    Sleeping,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollState::Reading => "reading",
            PollState::Decoding => "decoding",
            PollState::Assembling => "assembling",
            PollState::Writing => "writing",
            PollState::Sleeping => "sleeping",
        };
        f.write_str(name)
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Points the sink accepted
    pub points_written: usize,
    /// Points the sink had nothing to send for
    pub points_skipped: usize,
    /// Points the sink rejected
    pub write_failures: usize,
    /// Enumeration codes replaced by a fallback label
    pub unknown_codes: usize,
    /// Shutdown arrived before all points were written
    pub interrupted: bool,
}

/// Polls one measurement group until shutdown or a fatal error.
pub struct PollLoop {
    group: Arc<MeasurementGroup>,
    reader: Arc<dyn RegisterReader>,
    sink: Arc<dyn PointSink>,
    health: Option<SystemHealthMonitor>,
    shutdown: watch::Receiver<bool>,
    cache: FieldCache,
    state: PollState,
    label: String,
}

impl PollLoop {
    /// Create a loop. The field cache starts now, every entry at `0.0`.
    pub fn new(
        group: Arc<MeasurementGroup>,
        reader: Arc<dyn RegisterReader>,
        sink: Arc<dyn PointSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let cache = FieldCache::new(group.fields.len(), group.policy, Instant::now());
        let label = group.label();
        Self {
            group,
            reader,
            sink,
            health: None,
            shutdown,
            cache,
            state: PollState::Reading,
            label,
        }
    }

    /// Report heartbeats and problems to `monitor`.
    pub fn with_health(mut self, monitor: SystemHealthMonitor) -> Self {
        self.health = Some(monitor);
        self
    }

    /// Group label (`name@register`).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current phase.
    pub fn state(&self) -> PollState {
        self.state
    }

    /// The group's field cache.
    pub fn cache(&self) -> &FieldCache {
        &self.cache
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown (`Ok`) or a transport or decode error (`Err`).
    #[instrument(name = "poll_loop", skip_all, fields(group = %self.label))]
    pub async fn run(mut self) -> AppResult<()> {
        info!(
            register = self.group.register,
            count = self.group.count,
            interval = ?self.group.interval,
            "Poll loop started"
        );

        let mut cycles: u64 = 0;
        loop {
            if self.shutdown_requested() {
                break;
            }

            let report = match self.run_cycle().await {
                Ok(report) => report,
                Err(e) => {
                    error!(state = %self.state, error = %e, "Poll loop terminated");
                    return Err(e);
                }
            };
            cycles += 1;
            if report.interrupted {
                break;
            }

            if let Some(health) = &self.health {
                let status = format!(
                    "{} written, {} skipped, {} failed",
                    report.points_written, report.points_skipped, report.write_failures
                );
                health.heartbeat(&self.label, Some(status)).await;
            }

            self.state = PollState::Sleeping;
            if self.sleep_or_shutdown(self.group.interval).await {
                break;
            }
        }

        info!(cycles, "Poll loop stopped");
        Ok(())
    }

    /// Run one cycle without sleeping.
    pub async fn run_cycle(&mut self) -> AppResult<CycleReport> {
        let group = Arc::clone(&self.group);
        let mut report = CycleReport::default();

        self.state = PollState::Reading;
        debug!(register = group.register, count = group.count, "Reading registers");
        let words = self
            .reader
            .read_holding_registers(group.register, group.count)
            .await?;

        self.state = PollState::Decoding;
        let values = decode(&words, &group.layout)?;

        self.state = PollState::Assembling;
        let cycle = assemble(&group, &values, &mut self.cache, Instant::now(), Utc::now())?;
        report.unknown_codes = cycle.unknown_codes.len();

        if let Some(health) = &self.health {
            for unknown in &cycle.unknown_codes {
                health
                    .report_error(
                        self.label.as_str(),
                        ErrorSeverity::Warning,
                        unknown.to_string(),
                        [("code", unknown.code.to_string())],
                    )
                    .await;
            }
        }

        self.state = PollState::Writing;
        for point in cycle.into_points() {
            if self.shutdown_requested() {
                debug!("Shutdown requested, dropping remaining points");
                report.interrupted = true;
                break;
            }
            match write_logged(self.sink.as_ref(), &point).await {
                Some(WriteOutcome::Written) => report.points_written += 1,
                Some(WriteOutcome::Skipped) => report.points_skipped += 1,
                None => report.write_failures += 1,
            }
        }

        if report.write_failures > 0 {
            if let Some(health) = &self.health {
                health
                    .report_error(
                        self.label.as_str(),
                        ErrorSeverity::Error,
                        format!("{} point writes failed", report.write_failures),
                        Vec::<(String, String)>::new(),
                    )
                    .await;
            }
        }

        Ok(report)
    }

    /// Sleep for `duration`. Returns true when shutdown was requested meanwhile.
    ///
    /// A dropped sender counts as shutdown.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow_and_update() {
                        return true;
                    }
                }
            }
        }
    }
}
