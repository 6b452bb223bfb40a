//! Metric primitives backing the per-remote aggregates.
//!
//! Three kinds exist, mirroring the usual metrics-library contract:
//! [Counter] for monotonic totals, [Meter] for event counts with rates and
//! [Histogram] for numeric samples with summary statistics.
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of recent samples kept by a [Histogram] for percentile queries.
pub const HISTOGRAM_WINDOW: usize = 1028;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Monotonic counter.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    value: u64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self) {
        self.value += 1;
    }

    pub fn add(&mut self, n: u64) {
        self.value += n;
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

/// Event counter with a mean rate since creation and a one-minute
/// exponentially weighted moving average.
#[derive(Clone, Debug)]
pub struct Meter {
    count: u64,
    started: Instant,
    last_tick: Instant,
    uncounted: u64,
    one_minute: Option<f64>,
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

impl Meter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            count: 0,
            started: now,
            last_tick: now,
            uncounted: 0,
            one_minute: None,
        }
    }

    pub fn notify(&mut self, n: u64) {
        self.tick_if_due(Instant::now());
        self.count += n;
        self.uncounted += n;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Events per second since the meter was created.
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if self.count == 0 || elapsed <= 0.0 {
            return 0.0;
        }
        self.count as f64 / elapsed
    }

    /// Events per second, exponentially decayed over roughly one minute.
    ///
    /// Ticks that fell due since the last notification are applied on read,
    /// so a quiet meter decays towards zero.
    pub fn one_minute_rate(&self) -> f64 {
        self.one_minute_rate_at(Instant::now())
    }

    fn one_minute_rate_at(&self, now: Instant) -> f64 {
        let mut rate = self.one_minute;
        let mut uncounted = self.uncounted;
        let mut behind = now.saturating_duration_since(self.last_tick);
        while behind >= TICK_INTERVAL {
            rate = Some(ewma_step(rate, uncounted));
            uncounted = 0;
            behind -= TICK_INTERVAL;
        }
        rate.unwrap_or(0.0)
    }

    fn tick_if_due(&mut self, now: Instant) {
        let mut behind = now.saturating_duration_since(self.last_tick);
        while behind >= TICK_INTERVAL {
            self.one_minute = Some(ewma_step(self.one_minute, self.uncounted));
            self.uncounted = 0;
            self.last_tick += TICK_INTERVAL;
            behind -= TICK_INTERVAL;
        }
    }
}

fn ewma_step(rate: Option<f64>, uncounted: u64) -> f64 {
    let alpha = 1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0).exp();
    let instant_rate = uncounted as f64 / TICK_INTERVAL.as_secs_f64();
    match rate {
        Some(rate) => rate + alpha * (instant_rate - rate),
        None => instant_rate,
    }
}

/// Numeric sample accumulator.
///
/// `count`, `min`, `max` and `mean` cover every sample ever submitted.
/// Percentiles are computed over the most recent [HISTOGRAM_WINDOW] samples
/// using the nearest-rank method.
#[derive(Clone, Debug, Default)]
pub struct Histogram {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    window: VecDeque<f64>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));

        if self.window.len() == HISTOGRAM_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum / self.count as f64)
    }

    /// `p` is given in percent, e.g. `95.0`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }

        let mut values: Vec<f64> = self.window.iter().copied().collect();
        values.sort_by(|a, b| a.total_cmp(b));

        let p = p.clamp(0.0, 100.0);
        let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
        Some(values[rank.saturating_sub(1).min(values.len() - 1)])
    }

    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.count,
            min: self.min(),
            max: self.max(),
            mean: self.mean(),
            p95: self.percentile(95.0),
        }
    }
}

/// Point-in-time copy of a [Meter].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MeterSummary {
    pub count: u64,
    pub mean_rate: f64,
    pub one_minute_rate: f64,
}

impl From<&Meter> for MeterSummary {
    fn from(meter: &Meter) -> Self {
        Self {
            count: meter.count(),
            mean_rate: meter.mean_rate(),
            one_minute_rate: meter.one_minute_rate(),
        }
    }
}

/// Point-in-time copy of a [Histogram].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub p95: Option<f64>,
}
