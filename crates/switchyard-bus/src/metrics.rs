use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const TREND_SAMPLES: usize = 60;

#[derive(Default)]
struct Rolling {
    latency_ms: f64,
    error_rate: f64,
    trend: VecDeque<f64>,
    last_sample: Option<(DateTime<Utc>, u64)>,
}

/// Counters and moving averages for bus traffic.
///
/// Shared between the bus, its workers, and the metrics middleware.
pub struct CommunicationMetrics {
    started_at: DateTime<Utc>,
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    rolling: Mutex<Rolling>,
}

impl CommunicationMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            rolling: Mutex::new(Rolling::default()),
        }
    }

    /// Fold one send into the moving averages.
    ///
    /// Latency is halved toward the newest sample; the error rate decays by a
    /// tenth per send and moves a tenth toward 1 on failure.
    pub fn observe_send(&self, latency: Duration, success: bool) {
        let sample = latency.as_secs_f64() * 1000.0;
        let mut rolling = self.rolling.lock();
        rolling.latency_ms = if rolling.latency_ms == 0.0 {
            sample
        } else {
            (rolling.latency_ms + sample) / 2.0
        };
        rolling.error_rate = if success {
            rolling.error_rate * 0.9
        } else {
            (rolling.error_rate * 9.0 + 1.0) / 10.0
        };
        drop(rolling);

        if success {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a successful delivery.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a message that exhausted its retries.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an expired message.
    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one retry.
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Append a messages-per-second sample covering the time since the
    /// previous sample. Keeps the last 60 samples.
    pub fn sample_throughput(&self, now: DateTime<Utc>) {
        let processed = self.processed();
        let mut rolling = self.rolling.lock();
        if let Some((at, count)) = rolling.last_sample {
            let secs = (now - at).num_milliseconds().max(1) as f64 / 1000.0;
            let rate = processed.saturating_sub(count) as f64 / secs;
            rolling.trend.push_back(rate);
            while rolling.trend.len() > TREND_SAMPLES {
                rolling.trend.pop_front();
            }
        }
        rolling.last_sample = Some((now, processed));
    }

    fn processed(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.expired.load(Ordering::Relaxed)
    }

    /// Point-in-time view; queue and agent figures are supplied by the bus.
    pub fn snapshot(
        &self,
        queue_sizes: HashMap<String, usize>,
        active_agents: usize,
        healthy_agents: usize,
    ) -> BusMetrics {
        let now = Utc::now();
        let total = self.sent.load(Ordering::Relaxed);
        let uptime = (now - self.started_at).num_milliseconds().max(1) as f64 / 1000.0;
        let rolling = self.rolling.lock();
        BusMetrics {
            total_messages: total,
            messages_per_second: total as f64 / uptime,
            average_latency_ms: rolling.latency_ms,
            error_rate: rolling.error_rate,
            queue_sizes,
            active_agents,
            healthy_agents,
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            throughput_trend: rolling.trend.iter().copied().collect(),
            timestamp: now,
        }
    }
}

impl Default for CommunicationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of bus traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMetrics {
    /// Sends accepted since start.
    pub total_messages: u64,
    /// Settled messages per second over the last sample.
    pub messages_per_second: f64,
    /// Moving average of send latency.
    pub average_latency_ms: f64,
    /// Moving average of failed sends.
    pub error_rate: f64,
    /// Queue length per priority tier.
    pub queue_sizes: HashMap<String, usize>,
    /// Registered agents.
    pub active_agents: usize,
    /// Registered agents passing their health check.
    pub healthy_agents: usize,
    /// Messages delivered.
    pub delivered: u64,
    /// Messages failed after retries.
    pub failed: u64,
    /// Messages expired before delivery.
    pub expired: u64,
    /// Retry attempts.
    pub retried: u64,
    /// Sends refused by validation or capacity.
    pub rejected: u64,
    /// Messages settled per second, one sample per health check.
    pub throughput_trend: Vec<f64>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_average() {
        let metrics = CommunicationMetrics::new();
        metrics.observe_send(Duration::from_millis(10), true);
        metrics.observe_send(Duration::from_millis(30), true);
        let snap = metrics.snapshot(HashMap::new(), 0, 0);
        assert!((snap.average_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(snap.total_messages, 2);
    }

    #[test]
    fn test_error_rate_moves_toward_failures() {
        let metrics = CommunicationMetrics::new();
        metrics.observe_send(Duration::ZERO, false);
        let after_fail = metrics.snapshot(HashMap::new(), 0, 0).error_rate;
        assert!((after_fail - 0.1).abs() < 1e-9);

        metrics.observe_send(Duration::ZERO, true);
        let after_ok = metrics.snapshot(HashMap::new(), 0, 0).error_rate;
        assert!((after_ok - 0.09).abs() < 1e-9);
        assert_eq!(metrics.snapshot(HashMap::new(), 0, 0).rejected, 1);
    }

    #[test]
    fn test_throughput_trend_bounded() {
        let metrics = CommunicationMetrics::new();
        let start = Utc::now();
        for i in 0..(TREND_SAMPLES as i64 + 10) {
            metrics.record_delivered();
            metrics.sample_throughput(start + chrono::Duration::seconds(i));
        }
        let trend = metrics.snapshot(HashMap::new(), 0, 0).throughput_trend;
        assert_eq!(trend.len(), TREND_SAMPLES);
        assert!((trend[0] - 1.0).abs() < 1e-9);
    }
}
