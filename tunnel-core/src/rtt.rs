//! Round-trip time estimation for one connection.
//!
//! Smoothed RTT / RTT variance in the RFC 6298 style, with the update order
//! used by the tunnel: SRTT is updated first and the variance measures the
//! distance between the new SRTT and the sample.
//!
//! ```text
//! SRTT   <- (1 - alpha) * SRTT + alpha * R
//! RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R|
//! RTO    <- clamp(SRTT + K * RTTVAR, min_rto, max_rto)
//! ```
//!
//! A sliding-window histogram of raw samples tracks the base (minimum) RTT.

use std::collections::VecDeque;
use std::time::Duration;

/// Tuning for the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttOptions {
    /// RTO used before the first sample.
    pub initial_rto: Duration,
    /// Lower bound for the RTO.
    pub min_rto: Duration,
    /// Upper bound for the RTO.
    pub max_rto: Duration,
    /// Variance multiplier in the RTO formula.
    pub k: f64,
    /// SRTT smoothing factor.
    pub alpha: f64,
    /// RTTVAR smoothing factor.
    pub beta: f64,
    /// Number of raw samples kept in the histogram.
    pub histogram_size: usize,
}

impl Default for RttOptions {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(100),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_millis(500),
            k: 10.0,
            alpha: 0.125,
            beta: 0.25,
            histogram_size: 10,
        }
    }
}

/// Sliding window over the most recent raw RTT samples.
#[derive(Debug, Clone)]
pub struct RttHistogram {
    size: usize,
    samples: VecDeque<Duration>,
}

impl RttHistogram {
    /// Create a histogram keeping at most `size` samples.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            samples: VecDeque::with_capacity(size.max(1)),
        }
    }

    /// Add a sample, evicting the oldest one when the window is full.
    pub fn add(&mut self, sample: Duration) {
        if self.samples.len() >= self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Smallest sample in the window.
    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    /// Mean of the window.
    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(Duration::as_secs_f64).sum();
        Some(Duration::from_secs_f64(total / self.samples.len() as f64))
    }

    /// Sample standard deviation of the window (zero below two samples).
    pub fn std_dev(&self) -> Duration {
        let n = self.samples.len();
        if n < 2 {
            return Duration::ZERO;
        }
        let mean = self.samples.iter().map(Duration::as_secs_f64).sum::<f64>() / n as f64;
        let var = self
            .samples
            .iter()
            .map(|s| (s.as_secs_f64() - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        Duration::from_secs_f64(var.sqrt())
    }

    /// Number of samples in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if no samples were recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-connection RTT estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    options: RttOptions,
    /// Smoothed RTT in seconds.
    srtt: f64,
    /// RTT variance in seconds.
    rttvar: f64,
    rto: Duration,
    initialized: bool,
    histogram: RttHistogram,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(RttOptions::default())
    }
}

impl RttEstimator {
    /// Create an estimator with no samples yet.
    pub fn new(options: RttOptions) -> Self {
        Self {
            options,
            srtt: 0.0,
            rttvar: 0.0,
            rto: clamp(options.initial_rto, &options),
            initialized: false,
            histogram: RttHistogram::new(options.histogram_size),
        }
    }

    /// Feed one reliable RTT sample.
    ///
    /// Samples from retransmitted segments must not be passed here.
    pub fn update(&mut self, sample: Duration) {
        let r = sample.as_secs_f64();
        if !self.initialized {
            self.srtt = r;
            self.rttvar = r / 3.0;
            self.initialized = true;
        } else {
            let o = &self.options;
            self.srtt = (1.0 - o.alpha) * self.srtt + o.alpha * r;
            self.rttvar = (1.0 - o.beta) * self.rttvar + o.beta * (self.srtt - r).abs();
        }
        self.histogram.add(sample);

        let rto = Duration::from_secs_f64(self.srtt + self.options.k * self.rttvar);
        self.rto = clamp(rto, &self.options);
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, `None` before the first sample.
    pub fn srtt(&self) -> Option<Duration> {
        self.initialized.then(|| Duration::from_secs_f64(self.srtt))
    }

    /// RTT variance, `None` before the first sample.
    pub fn rttvar(&self) -> Option<Duration> {
        self.initialized.then(|| Duration::from_secs_f64(self.rttvar))
    }

    /// Smallest recent RTT.
    pub fn base_rtt(&self) -> Option<Duration> {
        self.histogram.min()
    }

    /// Raw sample window.
    pub fn histogram(&self) -> &RttHistogram {
        &self.histogram
    }

    /// Check if at least one sample was recorded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

fn clamp(rto: Duration, options: &RttOptions) -> Duration {
    rto.clamp(options.min_rto, options.max_rto.max(options.min_rto))
}
