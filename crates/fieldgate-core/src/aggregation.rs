//! Windowed aggregation of meter samples.
//!
//! One [`AggregationBuffer`] exists per device. Samples accumulate until the
//! window elapses, then [`AggregationBuffer::flush`] turns them into a single
//! [`AggregatedRecord`] and starts a fresh window.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

use fieldgate_types::{AggregatedRecord, RawSample, round_to};

/// Running min/max/sum for one metric.
#[derive(Debug, Clone, Copy)]
struct Summary {
    min: f64,
    max: f64,
    sum: f64,
}

impl Summary {
    fn new(first: f64) -> Self {
        Self {
            min: first,
            max: first,
            sum: first,
        }
    }

    fn push(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    /// `(avg, min, max)` rounded to `decimals`.
    fn finish(&self, count: usize, decimals: i32) -> (f64, f64, f64) {
        (
            round_to(self.sum / count as f64, decimals),
            round_to(self.min, decimals),
            round_to(self.max, decimals),
        )
    }
}

/// Accumulates samples for one device over a fixed window.
#[derive(Debug)]
pub struct AggregationBuffer {
    window: Duration,
    samples: Vec<RawSample>,
    window_start: Instant,
}

impl AggregationBuffer {
    /// Create an empty buffer whose first window starts now.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Vec::new(),
            window_start: Instant::now(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Append a sample to the current window.
    pub fn add_sample(&mut self, sample: RawSample) {
        self.samples.push(sample);
    }

    /// Whether the current window has run its full length.
    pub fn window_elapsed(&self) -> bool {
        self.window_start.elapsed() >= self.window
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Summarize and clear the current window.
    ///
    /// Returns `None` and leaves the window running when nothing was
    /// collected. Energy is cumulative, so the record carries the most recent
    /// value rather than an average.
    pub fn flush(&mut self) -> Option<AggregatedRecord> {
        if self.samples.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.samples);
        self.window_start = Instant::now();

        let (first, rest) = samples.split_first()?;
        let mut voltage = Summary::new(first.reading.voltage);
        let mut current = Summary::new(first.reading.current);
        let mut power = Summary::new(first.reading.power);
        for sample in rest {
            voltage.push(sample.reading.voltage);
            current.push(sample.reading.current);
            power.push(sample.reading.power);
        }

        let count = samples.len();
        let (voltage_avg, voltage_min, voltage_max) = voltage.finish(count, 2);
        let (current_avg, current_min, current_max) = current.finish(count, 3);
        let (power_avg, power_min, power_max) = power.finish(count, 2);
        let energy = rest.last().unwrap_or(first).reading.energy;

        Some(AggregatedRecord {
            voltage_avg,
            voltage_min,
            voltage_max,
            current_avg,
            current_min,
            current_max,
            power_avg,
            power_min,
            power_max,
            energy,
            sample_count: count as u32,
            timestamp: OffsetDateTime::now_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_types::MeterReading;

    fn sample(voltage: f64, current: f64, power: f64, energy: f64) -> RawSample {
        RawSample::new(
            "meter-1",
            MeterReading {
                voltage,
                current,
                power,
                energy,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_flush_three_samples() {
        let mut buffer = AggregationBuffer::new(Duration::from_secs(300));
        buffer.add_sample(sample(12.0, 1.0, 12.0, 5.0));
        buffer.add_sample(sample(12.5, 1.1, 13.75, 5.0));
        buffer.add_sample(sample(13.0, 1.2, 15.6, 5.1));

        let record = buffer.flush().unwrap();

        assert_eq!(record.voltage_avg, 12.5);
        assert_eq!(record.voltage_min, 12.0);
        assert_eq!(record.voltage_max, 13.0);
        assert_eq!(record.current_avg, 1.1);
        assert_eq!(record.current_min, 1.0);
        assert_eq!(record.current_max, 1.2);
        assert_eq!(record.power_avg, 13.78);
        assert_eq!(record.power_min, 12.0);
        assert_eq!(record.power_max, 15.6);
        assert_eq!(record.energy, 5.1);
        assert_eq!(record.sample_count, 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_flush_is_none() {
        let mut buffer = AggregationBuffer::new(Duration::from_secs(60));
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_energy_is_last_not_max() {
        let mut buffer = AggregationBuffer::new(Duration::from_secs(60));
        buffer.add_sample(sample(12.0, 1.0, 12.0, 9.0));
        buffer.add_sample(sample(12.0, 1.0, 12.0, 2.0));

        assert_eq!(buffer.flush().unwrap().energy, 2.0);
    }

    #[test]
    fn test_single_sample_min_avg_max_equal() {
        let mut buffer = AggregationBuffer::new(Duration::from_secs(60));
        buffer.add_sample(sample(12.34, 0.5, 6.17, 1.0));

        let record = buffer.flush().unwrap();

        assert_eq!(record.sample_count, 1);
        assert_eq!(record.voltage_min, record.voltage_avg);
        assert_eq!(record.voltage_max, record.voltage_avg);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapsed_and_reset() {
        let mut buffer = AggregationBuffer::new(Duration::from_secs(300));
        assert!(!buffer.window_elapsed());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!buffer.window_elapsed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(buffer.window_elapsed());

        buffer.add_sample(sample(12.0, 1.0, 12.0, 1.0));
        assert!(buffer.flush().is_some());
        assert!(!buffer.window_elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush_keeps_window_running() {
        let mut buffer = AggregationBuffer::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(buffer.window_elapsed());

        assert!(buffer.flush().is_none());
        assert!(buffer.window_elapsed());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn min_avg_max_ordered(values in proptest::collection::vec(0.0f64..500.0, 1..50)) {
                let mut buffer = AggregationBuffer::new(Duration::from_secs(60));
                for v in &values {
                    buffer.add_sample(sample(*v, *v / 100.0, *v, 0.0));
                }
                let record = buffer.flush().unwrap();
                prop_assert!(record.voltage_min <= record.voltage_avg);
                prop_assert!(record.voltage_avg <= record.voltage_max);
                prop_assert!(record.power_min <= record.power_avg);
                prop_assert!(record.power_avg <= record.power_max);
                prop_assert_eq!(record.sample_count as usize, values.len());
            }
        }
    }
}
