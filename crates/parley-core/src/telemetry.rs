//! Speed and ETA estimation.
//!
//! Turns cumulative byte counts into the speed and ETA the UI shows. Speed
//! is an exponential moving average of KB/s measured between updates;
//! downloads use a lower smoothing factor than uploads, whose delivered
//! byte count jumps with the channel's buffered amount.
//!
//! The displayed ETA may fall freely. It rises only when the increase is
//! both at least `eta_suppress_secs` and at least `eta_suppress_ratio` of
//! the previous value, and never beyond `eta_increase_cap` times it.
//! Updates are throttled to `min_update_interval` except the final one.

use std::time::{Duration, Instant};

use crate::config::TelemetryConfig;
use crate::transfer::TransferDirection;

/// One displayed update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    /// Smoothed speed in KB/s
    pub speed_kbps: f64,
    /// Dampened ETA in seconds, once a speed is known
    pub eta_secs: Option<u64>,
}

/// Per-transfer speed and ETA estimator.
#[derive(Debug, Clone)]
pub struct TelemetryEstimator {
    smoothing: f64,
    min_interval: Duration,
    eta_cap: f64,
    suppress_ratio: f64,
    suppress_secs: f64,
    baseline: Option<(Instant, u64)>,
    speed: Option<f64>,
    displayed_eta: Option<u64>,
    finished: bool,
}

impl TelemetryEstimator {
    /// Create an estimator for a transfer in `direction`.
    #[must_use]
    pub fn new(direction: TransferDirection, config: &TelemetryConfig) -> Self {
        let smoothing = match direction {
            TransferDirection::Download => config.download_smoothing,
            TransferDirection::Upload => config.upload_smoothing,
        };
        Self {
            smoothing: smoothing.clamp(0.01, 1.0),
            min_interval: config.min_update_interval,
            eta_cap: config.eta_increase_cap.max(1.0),
            suppress_ratio: config.eta_suppress_ratio.max(0.0),
            suppress_secs: config.eta_suppress_secs.max(0.0),
            baseline: None,
            speed: None,
            displayed_eta: None,
            finished: false,
        }
    }

    /// Feed a sample.
    ///
    /// `transferred` is the cumulative byte count, `in_flight` bytes already
    /// on their way but not yet counted. Returns a reading when the display
    /// should change.
    pub fn sample(
        &mut self,
        transferred: u64,
        total: u64,
        in_flight: u64,
        now: Instant,
    ) -> Option<TelemetryReading> {
        if self.finished {
            return None;
        }

        if transferred >= total {
            self.finished = true;
            self.displayed_eta = Some(0);
            return Some(TelemetryReading {
                speed_kbps: self.speed.unwrap_or(0.0),
                eta_secs: Some(0),
            });
        }

        let Some((since, base_bytes)) = self.baseline else {
            self.baseline = Some((now, transferred));
            return None;
        };

        let elapsed = now.saturating_duration_since(since);
        if elapsed < self.min_interval || elapsed.is_zero() {
            return None;
        }

        let delta = transferred.saturating_sub(base_bytes);
        let instant_kbps = delta as f64 / 1024.0 / elapsed.as_secs_f64();
        let speed = self.speed.map_or(instant_kbps, |prev| {
            self.smoothing.mul_add(instant_kbps, (1.0 - self.smoothing) * prev)
        });
        self.speed = Some(speed);
        self.baseline = Some((now, transferred));

        let remaining = total.saturating_sub(transferred).saturating_sub(in_flight);
        if speed > 0.0 {
            let raw = (remaining as f64 / 1024.0 / speed).ceil() as u64;
            self.displayed_eta = Some(self.dampen(raw));
        }

        Some(TelemetryReading {
            speed_kbps: speed,
            eta_secs: self.displayed_eta,
        })
    }

    /// Feed an upload sample.
    ///
    /// Bytes still sitting in the channel's send buffer are not delivered yet.
    pub fn sample_upload(
        &mut self,
        sent: u64,
        buffered: u64,
        total: u64,
        now: Instant,
    ) -> Option<TelemetryReading> {
        self.sample(sent.saturating_sub(buffered), total, 0, now)
    }

    /// Currently displayed ETA.
    #[must_use]
    pub const fn displayed_eta(&self) -> Option<u64> {
        self.displayed_eta
    }

    /// Current smoothed speed in KB/s.
    #[must_use]
    pub const fn speed(&self) -> Option<f64> {
        self.speed
    }

    fn dampen(&self, raw: u64) -> u64 {
        let Some(prev) = self.displayed_eta else {
            return raw;
        };
        if raw <= prev {
            return raw;
        }

        let increase = (raw - prev) as f64;
        if increase < self.suppress_secs || increase < prev as f64 * self.suppress_ratio {
            return prev;
        }
        let ceiling = (prev as f64 * self.eta_cap).floor() as u64;
        raw.min(ceiling.max(prev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1024;

    fn config() -> TelemetryConfig {
        TelemetryConfig {
            download_smoothing: 0.5,
            upload_smoothing: 0.5,
            min_update_interval: Duration::from_millis(500),
            eta_increase_cap: 1.25,
            eta_suppress_ratio: 0.10,
            eta_suppress_secs: 2.0,
        }
    }

    #[test]
    fn test_first_sample_sets_baseline() {
        let mut est = TelemetryEstimator::new(TransferDirection::Download, &config());
        assert!(est.sample(0, 1000 * KB, 0, Instant::now()).is_none());
    }

    #[test]
    fn test_speed_and_eta() {
        let mut est = TelemetryEstimator::new(TransferDirection::Download, &config());
        let start = Instant::now();
        est.sample(0, 1000 * KB, 0, start);

        let reading = est
            .sample(100 * KB, 1000 * KB, 0, start + Duration::from_secs(1))
            .unwrap();
        assert!((reading.speed_kbps - 100.0).abs() < 1e-9);
        assert_eq!(reading.eta_secs, Some(9));
    }

    #[test]
    fn test_updates_are_throttled() {
        let mut est = TelemetryEstimator::new(TransferDirection::Download, &config());
        let start = Instant::now();
        est.sample(0, 1000 * KB, 0, start);
        assert!(est
            .sample(10 * KB, 1000 * KB, 0, start + Duration::from_millis(100))
            .is_none());
        assert!(est
            .sample(50 * KB, 1000 * KB, 0, start + Duration::from_millis(600))
            .is_some());
    }

    #[test]
    fn test_final_update_is_immediate() {
        let mut est = TelemetryEstimator::new(TransferDirection::Download, &config());
        let start = Instant::now();
        est.sample(0, 100 * KB, 0, start);
        let reading = est
            .sample(100 * KB, 100 * KB, 0, start + Duration::from_millis(1))
            .unwrap();
        assert_eq!(reading.eta_secs, Some(0));
        assert!(est.sample(100 * KB, 100 * KB, 0, start + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_in_flight_bytes_shorten_eta() {
        let start = Instant::now();
        let mut plain = TelemetryEstimator::new(TransferDirection::Download, &config());
        let mut discounted = TelemetryEstimator::new(TransferDirection::Download, &config());
        plain.sample(0, 1000 * KB, 0, start);
        discounted.sample(0, 1000 * KB, 0, start);

        let later = start + Duration::from_secs(1);
        let a = plain.sample(100 * KB, 1000 * KB, 0, later).unwrap();
        let b = discounted.sample(100 * KB, 1000 * KB, 400 * KB, later).unwrap();
        assert!(b.eta_secs.unwrap() < a.eta_secs.unwrap());
    }

    #[test]
    fn test_eta_increase_is_capped() {
        let mut est = TelemetryEstimator::new(TransferDirection::Download, &config());
        let total = 100_000 * KB;
        let mut now = Instant::now();
        let mut transferred = 0;
        est.sample(transferred, total, 0, now);

        // Fast, then a sudden crawl.
        let mut previous: Option<u64> = None;
        for rate in [1000, 1000, 1000, 10, 10, 10, 10, 10] {
            now += Duration::from_secs(1);
            transferred += rate * KB;
            let eta = est.sample(transferred, total, 0, now).unwrap().eta_secs.unwrap();
            if let Some(prev) = previous {
                assert!(eta as f64 <= prev as f64 * 1.25, "{prev} -> {eta}");
            }
            previous = Some(eta);
        }
    }

    #[test]
    fn test_small_eta_increase_suppressed() {
        let mut est = TelemetryEstimator::new(TransferDirection::Download, &config());
        est.displayed_eta = Some(100);
        assert_eq!(est.dampen(101), 100);
        assert_eq!(est.dampen(109), 100);
        assert_eq!(est.dampen(115), 115);
        assert_eq!(est.dampen(400), 125);
        assert_eq!(est.dampen(40), 40);
    }

    #[test]
    fn test_upload_discounts_buffered_bytes() {
        let mut est = TelemetryEstimator::new(TransferDirection::Upload, &config());
        let start = Instant::now();
        est.sample_upload(0, 0, 1000 * KB, start);
        let reading = est
            .sample_upload(300 * KB, 200 * KB, 1000 * KB, start + Duration::from_secs(1))
            .unwrap();
        assert!((reading.speed_kbps - 100.0).abs() < 1e-9);
    }
}
