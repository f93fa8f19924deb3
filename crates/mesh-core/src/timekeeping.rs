//! Clock-offset estimation between peers.
//!
//! Each round is a single request/response exchange:
//!
//! ```text
//! Local                            Remote
//!   |--- timekeepRequest (sentAt) --->|
//!   |<-- timekeepResponse ------------|  (respondedAt = remote clock)
//!   |    (receivedAt = local clock)   |
//!   |                                 |
//!   |  rtt    = receivedAt - sentAt   |
//!   |  offset = respondedAt - sentAt - rtt / 2
//! ```
//!
//! `offset` is what must be added to a local timestamp to express it on the
//! remote clock. Samples are smoothed with an EWMA; samples whose round trip
//! is far above the recent median (a congested link) get a much smaller
//! weight so they cannot drag the estimate.

use crate::protocol::{ControllerMessage, SinkLatencyUpdateMessage};
use crate::reconnect::duration_ms;
use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// One completed request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimekeepSample {
    /// Round-trip time in milliseconds
    pub rtt: f64,
    /// Remote clock minus local clock, in milliseconds
    pub offset: f64,
}

impl TimekeepSample {
    pub fn from_exchange(sent_at: f64, responded_at: f64, received_at: f64) -> Self {
        let rtt = received_at - sent_at;
        Self {
            rtt,
            offset: responded_at - sent_at - rtt / 2.0,
        }
    }
}

/// Timekeeping schedule and smoothing parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimekeepConfig {
    /// Steady-state delay between rounds
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Maximum random deviation applied to `interval`
    #[serde(with = "duration_ms")]
    pub jitter: Duration,
    /// Rounds sent quickly after a connection opens
    pub initial_burst: u32,
    #[serde(with = "duration_ms")]
    pub burst_interval: Duration,
    /// EWMA weight of a new sample
    pub alpha: f64,
    /// Number of recent round trips used for the median
    pub window: usize,
    /// Samples with `rtt > outlier_factor * median` are outliers
    pub outlier_factor: f64,
    /// Multiplier applied to `alpha` for outliers
    pub outlier_weight: f64,
}

impl Default for TimekeepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jitter: Duration::from_secs(1),
            initial_burst: 5,
            burst_interval: Duration::from_millis(250),
            alpha: 0.1,
            window: 20,
            outlier_factor: 2.0,
            outlier_weight: 0.1,
        }
    }
}

/// Delay before the next round, given how many were already sent on this
/// connection.
pub fn next_delay<R: Rng>(config: &TimekeepConfig, sent_so_far: u32, rng: &mut R) -> Duration {
    if sent_so_far < config.initial_burst {
        return config.burst_interval;
    }

    let jitter = config.jitter.as_secs_f64();
    if jitter <= 0.0 {
        return config.interval;
    }
    let deviation = rng.random_range(-jitter..=jitter);
    Duration::from_secs_f64((config.interval.as_secs_f64() + deviation).max(0.0))
}

/// Smoothed offset and round trip for one peer.
#[derive(Debug, Clone)]
pub struct TimekeepEstimator {
    config: TimekeepConfig,
    offset: Option<f64>,
    rtt: Option<f64>,
    recent_rtts: VecDeque<f64>,
    sample_count: u64,
}

impl TimekeepEstimator {
    pub fn new(config: TimekeepConfig) -> Self {
        Self {
            recent_rtts: VecDeque::with_capacity(config.window),
            config,
            offset: None,
            rtt: None,
            sample_count: 0,
        }
    }

    /// Fold a sample into the estimate. Returns false if it was rejected.
    pub fn add_sample(&mut self, sample: TimekeepSample) -> bool {
        if !sample.rtt.is_finite() || !sample.offset.is_finite() || sample.rtt < 0.0 {
            return false;
        }

        let alpha = match self.median_rtt() {
            Some(median) if sample.rtt > self.config.outlier_factor * median => {
                debug!(
                    "Down-weighting timekeeping sample: rtt {:.1}ms, median {:.1}ms",
                    sample.rtt, median
                );
                self.config.alpha * self.config.outlier_weight
            }
            _ => self.config.alpha,
        };

        self.offset = Some(match self.offset {
            Some(current) => current + alpha * (sample.offset - current),
            None => sample.offset,
        });
        self.rtt = Some(match self.rtt {
            Some(current) => current + alpha * (sample.rtt - current),
            None => sample.rtt,
        });

        if self.recent_rtts.len() >= self.config.window.max(1) {
            self.recent_rtts.pop_front();
        }
        self.recent_rtts.push_back(sample.rtt);
        self.sample_count += 1;
        true
    }

    /// Smoothed remote-minus-local offset in ms, once a sample was accepted.
    pub fn offset(&self) -> Option<f64> {
        self.offset
    }

    pub fn rtt(&self) -> Option<f64> {
        self.rtt
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Forget everything, e.g. after the remote restarted.
    pub fn reset(&mut self) {
        self.offset = None;
        self.rtt = None;
        self.recent_rtts.clear();
        self.sample_count = 0;
    }

    fn median_rtt(&self) -> Option<f64> {
        if self.recent_rtts.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.recent_rtts.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        })
    }
}

impl Default for TimekeepEstimator {
    fn default() -> Self {
        Self::new(TimekeepConfig::default())
    }
}

/// Default minimum latency change (ms) worth telling peers about.
pub const DEFAULT_LATENCY_THRESHOLD: f64 = 5.0;

/// Tracks the last latency announced per sink and decides when a new
/// `sinkLatencyUpdate` is worth broadcasting.
#[derive(Debug, Clone)]
pub struct LatencyReporter {
    threshold: f64,
    reported: HashMap<String, f64>,
}

impl LatencyReporter {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            reported: HashMap::new(),
        }
    }

    pub fn update(&mut self, sink_uuid: &str, latency: f64) -> Option<ControllerMessage> {
        if !latency.is_finite() {
            return None;
        }
        if let Some(previous) = self.reported.get(sink_uuid) {
            if (latency - previous).abs() < self.threshold {
                return None;
            }
        }

        self.reported.insert(sink_uuid.to_string(), latency);
        Some(ControllerMessage::SinkLatencyUpdate(SinkLatencyUpdateMessage {
            sink_uuid: sink_uuid.to_string(),
            latency,
        }))
    }

    /// Drop a sink so its next update is always reported.
    pub fn forget(&mut self, sink_uuid: &str) {
        self.reported.remove(sink_uuid);
    }
}

impl Default for LatencyReporter {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_THRESHOLD)
    }
}
