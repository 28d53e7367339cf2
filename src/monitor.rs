//! Security event monitoring and escalation
//!
//! Receives classification and sandbox outcomes as [`SecurityEvent`]s,
//! keeps a bounded in-memory log, tracks per-`(type, source)` rate windows
//! and escalates anomalies as `SuspiciousActivity` events. A periodic
//! correlation pass looks for bursts across sources.
//!
//! All state sits behind one mutex that is held only for in-memory
//! mutation. Alert callbacks run after it is released.

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::types::{SecurityEvent, SecurityEventType, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Source recorded on events the monitor raises itself
pub const MONITOR_SOURCE: &str = "security_monitor";

/// Receives every recorded and escalated event
pub type AlertCallback = Arc<dyn Fn(&SecurityEvent) + Send + Sync>;

/// Cross-type correlation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CorrelationRule {
    MaliciousFileBurst,
    UnauthorizedAccessBurst,
}

#[derive(Default)]
struct MonitorState {
    log: VecDeque<SecurityEvent>,
    counts: HashMap<SecurityEventType, u64>,
    /// (event_type, source) -> timestamps (ms) inside the rate window
    windows: HashMap<(SecurityEventType, String), VecDeque<i64>>,
    /// Last time each correlation rule fired (ms)
    last_fired: HashMap<CorrelationRule, i64>,
    total: u64,
    dropped: u64,
}

/// Point-in-time summary of the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub total_recorded: u64,
    pub retained: usize,
    pub dropped: u64,
    pub unresolved: usize,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, usize>,
}

/// Security event monitor. Share it through an `Arc`.
pub struct SecurityEventMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    callbacks: RwLock<Vec<AlertCallback>>,
}

impl std::fmt::Debug for SecurityEventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEventMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SecurityEventMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(MonitorState {
                log: VecDeque::with_capacity(config.log_capacity.min(4096)),
                ..Default::default()
            }),
            config,
            callbacks: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback invoked for every recorded and escalated event
    pub fn add_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&SecurityEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Record an event.
    ///
    /// Returns the escalations the event triggered (empty in the normal
    /// case). Escalations are recorded too and reach every callback.
    pub fn record(&self, event: SecurityEvent) -> Vec<SecurityEvent> {
        let window_ms = secs_to_ms(self.config.rate_window_secs);
        let mut escalations = Vec::new();

        {
            let mut state = self.lock();
            self.append(&mut state, event.clone());

            // escalations are their own type and never feed the rate rule
            if event.event_type != SecurityEventType::SuspiciousActivity {
                let key = (event.event_type, event.source.clone());
                let window = state.windows.entry(key).or_default();
                let cutoff = event.timestamp - window_ms;
                window.retain(|&t| t > cutoff);
                window.push_back(event.timestamp);

                if window.len() > self.config.rate_threshold {
                    let count = window.len();
                    let escalation = SecurityEvent::new(
                        SecurityEventType::SuspiciousActivity,
                        Severity::High,
                        MONITOR_SOURCE,
                        format!(
                            "{} {} events from {} within {}s (threshold {})",
                            count,
                            event.event_type,
                            event.source,
                            self.config.rate_window_secs,
                            self.config.rate_threshold
                        ),
                    )
                    .at(event.timestamp)
                    .with_detail("rule", "rate")
                    .with_detail("trigger_type", event.event_type.as_str())
                    .with_detail("trigger_source", event.source.as_str())
                    .with_detail("trigger_event", event.id.as_str())
                    .with_detail("count", count as u64)
                    .with_detail("window_secs", self.config.rate_window_secs);
                    self.append(&mut state, escalation.clone());
                    escalations.push(escalation);
                }
            }
        }

        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = ?event.severity,
            source = %event.source,
            "Security event: {}",
            event.description
        );
        for escalation in &escalations {
            tracing::info!(
                event_id = %escalation.id,
                trigger_type = %event.event_type,
                source = %event.source,
                "Escalated: {}",
                escalation.description
            );
        }

        self.notify(&event);
        for escalation in &escalations {
            self.notify(escalation);
        }
        escalations
    }

    /// Append to the ring log, evicting the oldest entry at capacity
    fn append(&self, state: &mut MonitorState, event: SecurityEvent) {
        if state.log.len() >= self.config.log_capacity {
            state.log.pop_front();
            state.dropped += 1;
        }
        *state.counts.entry(event.event_type).or_insert(0) += 1;
        state.total += 1;
        state.log.push_back(event);
    }

    fn notify(&self, event: &SecurityEvent) {
        let callbacks: Vec<AlertCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(event_id = %event.id, "Alert callback panicked");
            }
        }
    }

    /// Run the cross-type correlation pass against the current time
    pub fn correlate(&self) -> Vec<SecurityEvent> {
        self.correlate_at(chrono::Utc::now().timestamp_millis())
    }

    /// Run the correlation pass as of `now` (Unix ms).
    ///
    /// Each rule fires at most once per lookback window while its condition
    /// holds.
    pub fn correlate_at(&self, now: i64) -> Vec<SecurityEvent> {
        let lookback_ms = secs_to_ms(self.config.correlation_lookback_secs);
        let cutoff = now - lookback_ms;
        let mut escalations = Vec::new();

        {
            let mut state = self.lock();
            let mut malicious = 0usize;
            let mut unauthorized = 0usize;
            for event in state.log.iter().filter(|e| e.timestamp > cutoff) {
                match event.event_type {
                    SecurityEventType::MaliciousFileDetected => malicious += 1,
                    SecurityEventType::UnauthorizedAccess => unauthorized += 1,
                    _ => {}
                }
            }

            let rules = [
                (
                    CorrelationRule::MaliciousFileBurst,
                    malicious,
                    self.config.dangerous_file_threshold,
                    SecurityEventType::MaliciousFileDetected,
                    Severity::High,
                ),
                (
                    CorrelationRule::UnauthorizedAccessBurst,
                    unauthorized,
                    self.config.unauthorized_threshold,
                    SecurityEventType::UnauthorizedAccess,
                    Severity::Medium,
                ),
            ];
            for (rule, count, threshold, event_type, severity) in rules {
                if count <= threshold {
                    continue;
                }
                let cooling = state
                    .last_fired
                    .get(&rule)
                    .is_some_and(|&fired| now - fired < lookback_ms);
                if cooling {
                    continue;
                }
                state.last_fired.insert(rule, now);

                let escalation = SecurityEvent::new(
                    SecurityEventType::SuspiciousActivity,
                    severity,
                    MONITOR_SOURCE,
                    format!(
                        "{} {} events across all sources within {}s (threshold {})",
                        count, event_type, self.config.correlation_lookback_secs, threshold
                    ),
                )
                .at(now)
                .with_detail("rule", "correlation")
                .with_detail("trigger_type", event_type.as_str())
                .with_detail("count", count as u64)
                .with_detail("window_secs", self.config.correlation_lookback_secs);
                self.append(&mut state, escalation.clone());
                escalations.push(escalation);
            }

            // drop rate windows that have gone quiet
            let window_ms = secs_to_ms(self.config.rate_window_secs);
            state
                .windows
                .retain(|_, window| window.back().is_some_and(|&t| t > now - window_ms));
        }

        for escalation in &escalations {
            tracing::info!(
                event_id = %escalation.id,
                severity = ?escalation.severity,
                "Correlated: {}",
                escalation.description
            );
            self.notify(escalation);
        }
        escalations
    }

    /// Spawn the periodic correlation pass.
    ///
    /// The task stops on its own once the last `Arc` to the monitor is
    /// dropped; abort the handle to stop it earlier.
    pub fn spawn_correlation(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.correlation_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                let escalations = monitor.correlate();
                if !escalations.is_empty() {
                    tracing::debug!(count = escalations.len(), "Correlation pass escalated");
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Operator surface
    // -----------------------------------------------------------------------

    /// Mark an event resolved. Returns false when the id is unknown (or
    /// already evicted) or the event was already resolved.
    pub fn resolve(&self, id: &str) -> bool {
        let mut state = self.lock();
        match state.log.iter_mut().find(|e| e.id == id) {
            Some(event) if !event.resolved => {
                event.resolved = true;
                tracing::info!(event_id = %id, event_type = %event.event_type, "Security event resolved");
                true
            }
            _ => false,
        }
    }

    /// Most recent events, newest first
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.lock().log.iter().rev().take(limit).cloned().collect()
    }

    pub fn unresolved(&self) -> Vec<SecurityEvent> {
        self.lock()
            .log
            .iter()
            .filter(|e| !e.resolved)
            .cloned()
            .collect()
    }

    pub fn by_type(&self, event_type: SecurityEventType) -> Vec<SecurityEvent> {
        self.lock()
            .log
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Events recorded per type since creation, evicted ones included
    pub fn counts(&self) -> HashMap<SecurityEventType, u64> {
        self.lock().counts.clone()
    }

    pub fn total_recorded(&self) -> u64 {
        self.lock().total
    }

    /// Events evicted from the ring log
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    pub fn stats(&self) -> MonitorStats {
        let state = self.lock();
        let mut by_severity = BTreeMap::new();
        for event in &state.log {
            let key = serde_json::to_value(event.severity)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            *by_severity.entry(key).or_insert(0) += 1;
        }
        MonitorStats {
            total_recorded: state.total,
            retained: state.log.len(),
            dropped: state.dropped,
            unresolved: state.log.iter().filter(|e| !e.resolved).count(),
            by_type: state
                .counts
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), *n))
                .collect(),
            by_severity,
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR_MS: i64 = 3_600_000;

    fn monitor() -> SecurityEventMonitor {
        SecurityEventMonitor::new(MonitorConfig::default()).unwrap()
    }

    fn event(event_type: SecurityEventType, source: &str, ts: i64) -> SecurityEvent {
        SecurityEvent::new(event_type, Severity::Medium, source, "test event").at(ts)
    }

    #[test]
    fn test_sixth_event_escalates_exactly_once() {
        let monitor = monitor();
        let base = 1_700_000_000_000;
        for i in 0..5 {
            let escalations =
                monitor.record(event(SecurityEventType::AuthenticationFailure, "10.0.0.7", base + i * 60_000));
            assert!(escalations.is_empty(), "escalated early on call {}", i + 1);
        }

        let escalations =
            monitor.record(event(SecurityEventType::AuthenticationFailure, "10.0.0.7", base + 300_000));
        assert_eq!(escalations.len(), 1);
        let escalation = &escalations[0];
        assert_eq!(escalation.event_type, SecurityEventType::SuspiciousActivity);
        assert_eq!(escalation.severity, Severity::High);
        assert_eq!(escalation.details["count"], 6);
        assert_eq!(escalation.details["trigger_source"], "10.0.0.7");

        assert_eq!(monitor.by_type(SecurityEventType::SuspiciousActivity).len(), 1);
        assert_eq!(monitor.total_recorded(), 7);
    }

    #[test]
    fn test_rate_window_is_per_key_and_prunes() {
        let monitor = monitor();
        let base = 1_700_000_000_000;
        // five from each of two sources never escalates
        for i in 0..5 {
            assert!(monitor
                .record(event(SecurityEventType::FileUpload, "a", base + i))
                .is_empty());
            assert!(monitor
                .record(event(SecurityEventType::FileUpload, "b", base + i))
                .is_empty());
        }
        // a sixth from `a` more than an hour after the first five does not
        let late = base + HOUR_MS + 10;
        assert!(monitor
            .record(event(SecurityEventType::FileUpload, "a", late))
            .is_empty());
    }

    #[test]
    fn test_escalations_do_not_retrigger() {
        let monitor = monitor();
        let base = 1_700_000_000_000;
        for i in 0..10 {
            monitor.record(event(SecurityEventType::SuspiciousActivity, "x", base + i));
        }
        assert_eq!(monitor.total_recorded(), 10);
    }

    #[test]
    fn test_ring_log_evicts_and_counts_drops() {
        let monitor = SecurityEventMonitor::new(MonitorConfig {
            log_capacity: 3,
            ..Default::default()
        })
        .unwrap();
        for i in 0..5 {
            monitor.record(event(SecurityEventType::FileUpload, &format!("s{}", i), i));
        }

        assert_eq!(monitor.dropped_count(), 2);
        assert_eq!(monitor.total_recorded(), 5);
        assert_eq!(monitor.counts()[&SecurityEventType::FileUpload], 5);
        let recent = monitor.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].source, "s4");
        assert_eq!(recent[2].source, "s2");
    }

    #[test]
    fn test_callbacks_see_events_and_escalations() {
        let monitor = monitor();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        monitor.add_alert_callback(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        monitor.add_alert_callback(|_| panic!("broken sink"));

        for i in 0..6 {
            monitor.record(event(SecurityEventType::UnauthorizedAccess, "u", i));
        }
        // six events plus one escalation, despite the panicking callback
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_callback_can_query_monitor() {
        let monitor = Arc::new(monitor());
        let inner = Arc::clone(&monitor);
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = Arc::clone(&observed);
        monitor.add_alert_callback(move |_| {
            observed_clone.store(inner.total_recorded() as usize, Ordering::SeqCst);
        });

        monitor.record(event(SecurityEventType::FileUpload, "s", 1));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_correlation_rules_and_cooldown() {
        let monitor = SecurityEventMonitor::new(MonitorConfig {
            // keep the rate rule out of the way
            rate_threshold: 100,
            ..Default::default()
        })
        .unwrap();
        let now = 1_700_000_000_000;

        for i in 0..4 {
            monitor.record(event(
                SecurityEventType::MaliciousFileDetected,
                &format!("upload-{}", i),
                now - 10_000 - i,
            ));
        }
        for i in 0..6 {
            monitor.record(event(
                SecurityEventType::UnauthorizedAccess,
                &format!("client-{}", i),
                now - 20_000,
            ));
        }

        let escalations = monitor.correlate_at(now);
        assert_eq!(escalations.len(), 2);
        assert_eq!(escalations[0].severity, Severity::High);
        assert_eq!(escalations[0].details["trigger_type"], "malicious_file_detected");
        assert_eq!(escalations[1].severity, Severity::Medium);

        // standing condition inside the cooldown: no repeat
        assert!(monitor.correlate_at(now + 60_000).is_empty());
        // events outside the lookback no longer count
        assert!(monitor.correlate_at(now + 400_000).is_empty());
    }

    #[test]
    fn test_correlation_below_threshold() {
        let monitor = monitor();
        let now = 1_700_000_000_000;
        for i in 0..3 {
            monitor.record(event(SecurityEventType::MaliciousFileDetected, "s", now - i));
        }
        assert!(monitor.correlate_at(now).is_empty());
    }

    #[test]
    fn test_resolve_and_queries() {
        let monitor = monitor();
        monitor.record(event(SecurityEventType::FileUpload, "a", 1));
        monitor.record(event(SecurityEventType::PluginViolation, "b", 2));
        let target = monitor.recent(1)[0].id.clone();

        assert_eq!(monitor.unresolved().len(), 2);
        assert!(monitor.resolve(&target));
        assert!(!monitor.resolve(&target));
        assert!(!monitor.resolve("no-such-id"));
        assert_eq!(monitor.unresolved().len(), 1);

        let stats = monitor.stats();
        assert_eq!(stats.total_recorded, 2);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.by_type["plugin_violation"], 1);
        assert_eq!(stats.by_severity["medium"], 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MonitorConfig {
            log_capacity: 0,
            ..Default::default()
        };
        assert!(SecurityEventMonitor::new(config).is_err());
    }

    #[tokio::test]
    async fn test_spawned_correlation_runs() {
        let monitor = Arc::new(
            SecurityEventMonitor::new(MonitorConfig {
                correlation_interval_secs: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        for i in 0..4 {
            monitor.record(SecurityEvent::new(
                SecurityEventType::MaliciousFileDetected,
                Severity::High,
                format!("upload-{}", i),
                "dangerous archive",
            ));
        }

        let handle = monitor.spawn_correlation();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.abort();

        let escalations = monitor.by_type(SecurityEventType::SuspiciousActivity);
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].details["rule"], "correlation");
    }
}
