use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

const LATENCY_WINDOW: usize = 1000;

/// Request counters for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Statistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean over the most recent responses, in milliseconds.
    pub average_response_time_ms: f64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    total: u64,
    successful: u64,
    failed: u64,
    latencies: VecDeque<Duration>,
}

impl StatsRecorder {
    pub fn record(&mut self, success: bool, latency: Duration) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    pub fn snapshot(&self) -> Statistics {
        let average_response_time_ms = if self.latencies.is_empty() {
            0.0
        } else {
            let sum: Duration = self.latencies.iter().sum();
            sum.as_secs_f64() * 1000.0 / self.latencies.len() as f64
        };
        Statistics {
            total_requests: self.total,
            successful_requests: self.successful,
            failed_requests: self.failed,
            average_response_time_ms,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
