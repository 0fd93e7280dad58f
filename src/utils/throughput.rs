//! Rolling throughput sampler
//!
//! Records how long each unit of work took and, once per reporting interval,
//! logs the rate and the average duration for the window before starting a
//! new one.

use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug)]
pub struct Throughput {
    name: String,
    interval: Duration,
    window_start: Instant,
    durations: Vec<Duration>,
}

impl Throughput {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            window_start: Instant::now(),
            durations: Vec::new(),
        }
    }

    /// Run `f`, recording how long it took.
    pub fn record<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        self.durations.push(started.elapsed());
        result
    }

    pub fn count(&self) -> usize {
        self.durations.len()
    }

    /// Events per second since the window started.
    pub fn rate(&self) -> f64 {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.durations.len() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn average(&self) -> Option<Duration> {
        let count = u32::try_from(self.durations.len()).ok().filter(|c| *c > 0)?;
        Some(self.durations.iter().sum::<Duration>() / count)
    }

    pub fn reset(&mut self) {
        self.window_start = Instant::now();
        self.durations.clear();
    }

    /// Log a report and reset if the interval has elapsed. Returns whether a
    /// report was emitted.
    pub fn report_if_due(&mut self) -> bool {
        if self.window_start.elapsed() < self.interval {
            return false;
        }
        self.report();
        self.reset();
        true
    }

    pub fn report(&self) {
        let average_ms = self
            .average()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or_default();
        info!(
            name = %self.name,
            jobs = self.count(),
            jobs_per_sec = %format!("{:.02}", self.rate()),
            average_ms = %format!("{average_ms:.02}"),
            "throughput"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_returns_result_and_counts() {
        let mut t = Throughput::new("test", Duration::from_secs(60));
        let v = t.record(|| 41 + 1);
        assert_eq!(v, 42);
        assert_eq!(t.count(), 1);
        assert!(t.average().is_some());
    }

    #[test]
    fn empty_window_has_no_average() {
        let t = Throughput::new("test", Duration::from_secs(60));
        assert!(t.average().is_none());
    }

    #[test]
    fn report_resets_once_due() {
        let mut t = Throughput::new("test", Duration::ZERO);
        t.record(|| ());
        assert!(t.report_if_due());
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn report_waits_for_interval() {
        let mut t = Throughput::new("test", Duration::from_secs(3600));
        t.record(|| ());
        assert!(!t.report_if_due());
        assert_eq!(t.count(), 1);
    }
}
