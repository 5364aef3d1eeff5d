//! Supervisor for the poll loops.
//!
//! Spawns one task per measurement group, all sharing the register reader and
//! the sink. A loop that fails stays dead: the supervisor marks it failed in
//! the health monitor and keeps the others running. Only when every loop has
//! died does [`Daemon::run`] return an error.

use crate::config::MeasurementGroup;
use crate::error::{AppResult, DaqError};
use crate::health::{LoopState, SystemHealth, SystemHealthMonitor};
use crate::poll::PollLoop;
use crate::sink::PointSink;
use crate::transport::RegisterReader;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Requests a graceful stop of every poll loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal shutdown. Loops finish their current read and stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was signalled.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// How the poll loops ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSummary {
    /// Loops started
    pub groups: usize,
    /// Loops that ended with an error
    pub failed: usize,
}

/// Runs every measurement group until shutdown.
pub struct Daemon {
    groups: Vec<Arc<MeasurementGroup>>,
    reader: Arc<dyn RegisterReader>,
    sink: Arc<dyn PointSink>,
    health: SystemHealthMonitor,
    shutdown: ShutdownHandle,
    report_interval: Duration,
}

impl Daemon {
    /// Supervisor for `groups`, reading through `reader` and writing to `sink`.
    pub fn new(
        groups: Vec<Arc<MeasurementGroup>>,
        reader: Arc<dyn RegisterReader>,
        sink: Arc<dyn PointSink>,
    ) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            groups,
            reader,
            sink,
            health: SystemHealthMonitor::default(),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
            report_interval: Duration::from_secs(300),
        }
    }

    /// Use `monitor` instead of a private one.
    pub fn with_health(mut self, monitor: SystemHealthMonitor) -> Self {
        self.health = monitor;
        self
    }

    /// How often the aggregate health is logged.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Handle that stops the daemon.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Shared health monitor.
    pub fn health(&self) -> &SystemHealthMonitor {
        &self.health
    }

    /// Run until shutdown or until every loop has failed.
    pub async fn run(self) -> AppResult<DaemonSummary> {
        let total = self.groups.len();
        if total == 0 {
            return Err(DaqError::Configuration(
                "No measurement groups to poll".to_string(),
            ));
        }

        let mut tasks = JoinSet::new();
        let mut labels = HashMap::with_capacity(total);
        for group in &self.groups {
            let poll = PollLoop::new(
                Arc::clone(group),
                Arc::clone(&self.reader),
                Arc::clone(&self.sink),
                self.shutdown.tx.subscribe(),
            )
            .with_health(self.health.clone());

            let label = poll.label().to_string();
            self.health.register(label.as_str(), group.interval).await;
            let task = tasks.spawn(poll.run());
            labels.insert(task.id(), label);
        }
        info!(groups = total, "Polling started");

        let mut report = tokio::time::interval(self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        report.tick().await;

        let mut failed = 0;
        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    None => break,
                    Some(Ok((id, Ok(())))) => {
                        let label = labels.remove(&id).unwrap_or_default();
                        debug!(group = %label, "Poll loop ended");
                        self.health.mark_stopped(&label).await;
                    }
                    Some(Ok((id, Err(e)))) => {
                        failed += 1;
                        let label = labels.remove(&id).unwrap_or_default();
                        self.health.mark_failed(&label, e.to_string()).await;
                        error!(
                            group = %label,
                            error = %e,
                            running = tasks.len(),
                            "Measurement group is no longer polled"
                        );
                    }
                    Some(Err(e)) => {
                        failed += 1;
                        let label = labels.remove(&e.id()).unwrap_or_default();
                        self.health
                            .mark_failed(&label, format!("poll task aborted: {e}"))
                            .await;
                        error!(
                            group = %label,
                            error = %e,
                            running = tasks.len(),
                            "Poll task aborted"
                        );
                    }
                },
                _ = report.tick() => self.log_health().await,
            }
        }

        let summary = DaemonSummary {
            groups: total,
            failed,
        };
        if failed == total && !self.shutdown.is_triggered() {
            error!(groups = total, "Every measurement group has failed");
            return Err(DaqError::AllGroupsFailed(total));
        }

        info!(groups = total, failed, "Polling stopped");
        Ok(summary)
    }

    async fn log_health(&self) {
        let running = self.health.count_in_state(LoopState::Running).await;
        let failed = self.health.count_in_state(LoopState::Failed).await;
        match self.health.get_system_health().await {
            SystemHealth::Healthy => debug!(running, failed, "System health: healthy"),
            status => warn!(running, failed, %status, "System health degraded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeasurementGroupConfig;
    use crate::mock::{MemorySink, MockRegisterReader};
    use crate::transport::{RegisterReader, TransportError};
    use async_trait::async_trait;

    /// Panics on reads at `panic_at`, serves `inner` otherwise.
    struct PanickingReader {
        inner: MockRegisterReader,
        panic_at: u16,
    }

    #[async_trait]
    impl RegisterReader for PanickingReader {
        async fn read_holding_registers(
            &self,
            start: u16,
            count: u16,
        ) -> Result<Vec<u16>, TransportError> {
            if start == self.panic_at {
                panic!("reader bug at {start}");
            }
            self.inner.read_holding_registers(start, count).await
        }
    }

    fn group(name: &str, register: u16) -> Arc<MeasurementGroup> {
        let cfg = MeasurementGroupConfig {
            measurement_group: name.to_string(),
            register,
            count: 2,
            format: ">hh".to_string(),
            names: vec!["state".into(), "temp".into()],
            funcs: vec!["as_int".into(), "fixed_point_to_float_10".into()],
            tags: vec![false, false],
            interval: 1.0,
            cache_values: false,
            denoise_values: false,
            cache_timeout: 300.0,
        };
        Arc::new(MeasurementGroup::from_config(&cfg).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_all_loops_cleanly() {
        let reader = Arc::new(MockRegisterReader::new());
        reader.set_registers(1000, &[1, 215]).await;
        reader.set_registers(2000, &[2, 480]).await;
        let sink = Arc::new(MemorySink::new());

        let daemon = Daemon::new(
            vec![group("heat_pump", 1000), group("boiler", 2000)],
            reader,
            sink.clone(),
        );
        let shutdown = daemon.shutdown_handle();
        let handle = tokio::spawn(daemon.run());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.trigger();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, DaemonSummary { groups: 2, failed: 0 });
        assert_eq!(sink.points_for("heat_pump").await.len(), 3);
        assert_eq!(sink.points_for("boiler").await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn all_groups_failing_is_an_error() {
        let reader = Arc::new(MockRegisterReader::new());
        let sink = Arc::new(MemorySink::new());

        let daemon = Daemon::new(vec![group("heat_pump", 1000)], reader, sink);
        let health = daemon.health().clone();

        let err = daemon.run().await.unwrap_err();
        assert!(matches!(err, DaqError::AllGroupsFailed(1)));
        assert_eq!(health.count_in_state(LoopState::Failed).await, 1);
        assert_eq!(health.get_system_health().await, SystemHealth::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_group_does_not_stop_siblings() {
        let reader = Arc::new(MockRegisterReader::new());
        reader.set_registers(1000, &[1, 215]).await;
        reader.set_registers(2000, &[2, 480]).await;
        reader
            .push_failure(
                2000,
                TransportError::Io {
                    start: 2000,
                    count: 2,
                    message: "connection reset".into(),
                },
            )
            .await;
        let sink = Arc::new(MemorySink::new());

        let daemon = Daemon::new(
            vec![group("heat_pump", 1000), group("boiler", 2000)],
            reader.clone(),
            sink.clone(),
        );
        let health = daemon.health().clone();
        let shutdown = daemon.shutdown_handle();
        let handle = tokio::spawn(daemon.run());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown.trigger();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(reader.read_count(2000).await, 1);
        assert_eq!(reader.read_count(1000).await, 4);
        assert!(sink.points_for("boiler").await.is_empty());
        assert_eq!(health.count_in_state(LoopState::Failed).await, 1);
        assert_eq!(health.count_in_state(LoopState::Stopped).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_loop_is_marked_failed() {
        let inner = MockRegisterReader::new();
        inner.set_registers(1000, &[1, 215]).await;
        let reader = Arc::new(PanickingReader {
            inner,
            panic_at: 2000,
        });
        let sink = Arc::new(MemorySink::new());

        let daemon = Daemon::new(
            vec![group("heat_pump", 1000), group("boiler", 2000)],
            reader,
            sink,
        );
        let health = daemon.health().clone();
        let shutdown = daemon.shutdown_handle();
        let handle = tokio::spawn(daemon.run());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let boiler = health
            .get_group_health()
            .await
            .into_iter()
            .find(|g| g.label == "boiler@2000")
            .unwrap();
        assert_eq!(boiler.state, LoopState::Failed);

        shutdown.trigger();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, DaemonSummary { groups: 2, failed: 1 });
    }
}
