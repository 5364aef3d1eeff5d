//! Poll loop health monitoring.
//!
//! A dead poll loop leaves one group dark while the others keep writing, which
//! is easy to miss from the database side. Every loop registers here, beats
//! once per completed cycle and reports its failure. The supervisor logs the
//! aggregate status periodically and decides the exit code from it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Severity level for health errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational message
    Info = 0,
    /// Degraded but still writing (unknown codes, rejected writes)
    Warning = 1,
    /// A cycle lost data
    Error = 2,
    /// A poll loop died
    Critical = 3,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A reported problem
#[derive(Debug, Clone)]
pub struct HealthError {
    /// Group label that reported the error
    pub group: String,
    /// Error severity level
    pub severity: ErrorSeverity,
    /// Human-readable error message
    pub message: String,
    /// When the error occurred
    pub timestamp: Instant,
    /// Extra context (register, field, code)
    pub context: HashMap<String, String>,
}

/// Lifecycle of a poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Polling
    Running,
    /// Ended on shutdown
    Stopped,
    /// Ended with an error, stays dead
    Failed,
}

/// Health of one measurement group
#[derive(Debug, Clone)]
pub struct GroupHealth {
    /// Group label (`name@register`)
    pub label: String,
    /// Poll interval the loop was configured with
    pub interval: Duration,
    /// Last completed cycle, or registration time
    pub last_heartbeat: Instant,
    /// Completed cycles
    pub cycles: u64,
    /// Loop lifecycle
    pub state: LoopState,
    /// Whether the loop is running and beat recently
    pub is_healthy: bool,
    /// Last status message
    pub status_message: Option<String>,
}

/// Overall status across all groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemHealth {
    /// All loops running, no recent problems
    Healthy,
    /// Recent warnings or errors, every loop still running
    Degraded,
    /// A loop failed or stopped beating
    Critical,
}

impl fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemHealth::Healthy => write!(f, "healthy"),
            SystemHealth::Degraded => write!(f, "degraded"),
            SystemHealth::Critical => write!(f, "critical"),
        }
    }
}

/// Configuration for the health monitor
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Missed cycles after which a running loop counts as unresponsive
    pub missed_cycles: u32,
    /// Slack added to the heartbeat deadline (covers read timeouts)
    pub grace: Duration,
    /// How long reported errors affect the system status
    pub error_window: Duration,
    /// Maximum number of errors to keep in history
    pub max_error_history: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            missed_cycles: 3,
            grace: Duration::from_secs(10),
            error_window: Duration::from_secs(300),
            max_error_history: 1000,
        }
    }
}

impl HealthMonitorConfig {
    fn heartbeat_deadline(&self, interval: Duration) -> Duration {
        interval * self.missed_cycles + self.grace
    }
}

struct HealthMonitorState {
    groups: HashMap<String, GroupHealth>,
    error_history: VecDeque<HealthError>,
    config: HealthMonitorConfig,
}

impl HealthMonitorState {
    fn push_error(&mut self, error: HealthError) {
        self.error_history.push_back(error);
        if self.error_history.len() > self.config.max_error_history {
            self.error_history.pop_front();
        }
    }

    fn refresh(&mut self, now: Instant) {
        let config = &self.config;
        for group in self.groups.values_mut() {
            let deadline = config.heartbeat_deadline(group.interval);
            group.is_healthy = group.state == LoopState::Running
                && now.saturating_duration_since(group.last_heartbeat) <= deadline;
        }
    }
}

/// Shared health registry for all poll loops.
///
/// Cloning is cheap, clones share the same state.
///
/// # Example
/// ```no_run
/// use lambda_daq::health::{ErrorSeverity, SystemHealthMonitor};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let monitor = SystemHealthMonitor::new(Default::default());
///     monitor.register("heat_pump@1000", Duration::from_secs(5)).await;
///     monitor.heartbeat("heat_pump@1000", None).await;
///     monitor
///         .report_error(
///             "heat_pump@1000",
///             ErrorSeverity::Warning,
///             "Unknown enumeration code",
///             [("code", "77")],
///         )
///         .await;
///     println!("System health: {}", monitor.get_system_health().await);
/// }
/// ```
#[derive(Clone)]
pub struct SystemHealthMonitor {
    state: Arc<RwLock<HealthMonitorState>>,
}

impl SystemHealthMonitor {
    /// Create a new health monitor with the given configuration
    pub fn new(config: HealthMonitorConfig) -> Self {
        let state = HealthMonitorState {
            groups: HashMap::new(),
            error_history: VecDeque::new(),
            config,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Start tracking a group polled every `interval`.
    pub async fn register(&self, label: impl Into<String>, interval: Duration) {
        let label = label.into();
        let health = GroupHealth {
            label: label.clone(),
            interval,
            last_heartbeat: Instant::now(),
            cycles: 0,
            state: LoopState::Running,
            is_healthy: true,
            status_message: None,
        };
        self.state.write().await.groups.insert(label, health);
    }

    /// Record a completed cycle. Unknown labels are registered on the fly.
    pub async fn heartbeat(&self, label: &str, status_message: Option<String>) {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let group = state
            .groups
            .entry(label.to_string())
            .or_insert_with(|| GroupHealth {
                label: label.to_string(),
                interval: Duration::ZERO,
                last_heartbeat: now,
                cycles: 0,
                state: LoopState::Running,
                is_healthy: true,
                status_message: None,
            });
        group.last_heartbeat = now;
        group.cycles += 1;
        group.status_message = status_message;
    }

    /// Report a problem of a group.
    pub async fn report_error(
        &self,
        group: impl Into<String>,
        severity: ErrorSeverity,
        message: impl Into<String>,
        context: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) {
        let error = HealthError {
            group: group.into(),
            severity,
            message: message.into(),
            timestamp: Instant::now(),
            context: context
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        self.state.write().await.push_error(error);
    }

    /// Mark a loop as dead and record why, at critical severity.
    pub async fn mark_failed(&self, label: &str, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.write().await;
        if let Some(group) = state.groups.get_mut(label) {
            group.state = LoopState::Failed;
            group.is_healthy = false;
            group.status_message = Some(message.clone());
        }
        state.push_error(HealthError {
            group: label.to_string(),
            severity: ErrorSeverity::Critical,
            message,
            timestamp: Instant::now(),
            context: HashMap::new(),
        });
    }

    /// Mark a loop as ended on shutdown.
    pub async fn mark_stopped(&self, label: &str) {
        let mut state = self.state.write().await;
        if let Some(group) = state.groups.get_mut(label) {
            group.state = LoopState::Stopped;
            group.is_healthy = false;
        }
    }

    /// Get the overall system health status
    pub async fn get_system_health(&self) -> SystemHealth {
        let mut state = self.state.write().await;
        let now = Instant::now();
        state.refresh(now);

        let window = state.config.error_window;
        let recent: Vec<ErrorSeverity> = state
            .error_history
            .iter()
            .filter(|err| now.saturating_duration_since(err.timestamp) <= window)
            .map(|err| err.severity)
            .collect();

        let unhealthy_loop = state.groups.values().any(|g| match g.state {
            LoopState::Failed => true,
            LoopState::Running => !g.is_healthy,
            LoopState::Stopped => false,
        });

        if unhealthy_loop || recent.contains(&ErrorSeverity::Critical) {
            SystemHealth::Critical
        } else if recent.iter().any(|s| *s >= ErrorSeverity::Warning) {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }

    /// Health of every group, ordered by label.
    pub async fn get_group_health(&self) -> Vec<GroupHealth> {
        let mut state = self.state.write().await;
        state.refresh(Instant::now());

        let mut groups: Vec<_> = state.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.label.cmp(&b.label));
        groups
    }

    /// Most recent errors first, up to `limit` or all.
    pub async fn get_error_history(&self, limit: Option<usize>) -> Vec<HealthError> {
        let state = self.state.read().await;
        let newest_first = state.error_history.iter().rev().cloned();
        match limit {
            Some(limit) => newest_first.take(limit).collect(),
            None => newest_first.collect(),
        }
    }

    /// Number of groups in `state`.
    pub async fn count_in_state(&self, loop_state: LoopState) -> usize {
        let state = self.state.read().await;
        state
            .groups
            .values()
            .filter(|g| g.state == loop_state)
            .count()
    }

    /// Get the number of errors in history
    pub async fn error_count(&self) -> usize {
        self.state.read().await.error_history.len()
    }
}

impl Default for SystemHealthMonitor {
    fn default() -> Self {
        Self::new(HealthMonitorConfig::default())
    }
}
