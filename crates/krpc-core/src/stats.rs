//! Server statistics.

use crate::config::StatsConfig;
use std::time::Duration;

/// Exponential moving average. The first sample is taken as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MovingAverage {
    value: f32,
    primed: bool,
}

impl MovingAverage {
    pub fn update(&mut self, sample: f32) {
        if self.primed {
            let alpha = StatsConfig::MOVING_AVERAGE_ALPHA;
            self.value = alpha * sample + (1.0 - alpha) * self.value;
        } else {
            self.value = sample;
            self.primed = true;
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// Measurements from one request-loop pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcUpdateSample {
    pub rpcs_executed: u64,
    pub total: Duration,
    pub poll: Duration,
    pub exec: Duration,
}

/// Totals and smoothed rates reported through `KRPC.GetStatus`.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub rpcs_executed: u64,
    pub stream_rpcs_executed: u64,
    /// Bytes moved by clients that have since disconnected.
    pub closed_bytes_read: u64,
    pub closed_bytes_written: u64,
    pub rpc_rate: MovingAverage,
    pub stream_rpc_rate: MovingAverage,
    pub bytes_read_rate: MovingAverage,
    pub bytes_written_rate: MovingAverage,
    pub time_per_rpc_update: MovingAverage,
    pub poll_time_per_rpc_update: MovingAverage,
    pub exec_time_per_rpc_update: MovingAverage,
    pub time_per_stream_update: MovingAverage,
    /// Exec time of the most recent pass, unsmoothed, for rate control.
    pub last_exec_time: Duration,
}

impl Stats {
    pub fn record_rpc_update(&mut self, sample: RpcUpdateSample) {
        self.rpcs_executed += sample.rpcs_executed;
        self.time_per_rpc_update.update(sample.total.as_secs_f32());
        self.poll_time_per_rpc_update.update(sample.poll.as_secs_f32());
        self.exec_time_per_rpc_update.update(sample.exec.as_secs_f32());
        self.last_exec_time = sample.exec;
    }

    pub fn record_stream_update(&mut self, executed: u64, elapsed: Duration) {
        self.stream_rpcs_executed += executed;
        self.time_per_stream_update.update(elapsed.as_secs_f32());
    }

    /// Update the per-second rates from the deltas of one tick.
    pub fn record_rates(
        &mut self,
        elapsed: Duration,
        rpcs: u64,
        stream_rpcs: u64,
        bytes_read: u64,
        bytes_written: u64,
    ) {
        let seconds = elapsed.as_secs_f32();
        if seconds <= 0.0 {
            return;
        }
        self.rpc_rate.update(rpcs as f32 / seconds);
        self.stream_rpc_rate.update(stream_rpcs as f32 / seconds);
        self.bytes_read_rate.update(bytes_read as f32 / seconds);
        self.bytes_written_rate.update(bytes_written as f32 / seconds);
    }

    pub fn clear(&mut self) {
        *self = Stats::default();
    }
}
