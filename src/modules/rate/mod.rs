//! Adaptive request pacing.
//!
//! Tracks a rolling one-hour window of request timestamps and enforces an
//! hourly quota plus a minimum inter-request spacing. Delay computation
//! scales with recent traffic density and with a multiplier that grows on
//! blocking responses and decays on successes.

use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60 * 60);
const DENSITY_WINDOW: Duration = Duration::from_secs(5 * 60);
const MULTIPLIER_CAP: f64 = 5.0;
const CEILING_FLOOR: usize = 20;

/// Pacing knobs. Delay ranges are in seconds.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Requests allowed per rolling hour before the controller sleeps the
    /// window off.
    pub hourly_ceiling: usize,
    /// Minimum gap between consecutive requests.
    pub min_spacing: Duration,
    pub normal_delay: (f64, f64),
    pub retry_delay: (f64, f64),
    pub error_delay: (f64, f64),
    /// Hard cap on any computed delay.
    pub max_delay: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            hourly_ceiling: 50,
            min_spacing: Duration::from_secs(3),
            normal_delay: (5.0, 12.0),
            retry_delay: (10.0, 20.0),
            error_delay: (15.0, 30.0),
            max_delay: Duration::from_secs(120),
        }
    }
}

/// Which delay range applies to the upcoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayClass {
    Normal,
    Retry,
    Error,
}

/// Sliding-window rate controller with adaptive backoff.
#[derive(Debug)]
pub struct RateController {
    config: RateConfig,
    window: VecDeque<Instant>,
    last_request: Option<Instant>,
    delay_multiplier: f64,
    current_ceiling: usize,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        let current_ceiling = config.hourly_ceiling;
        Self {
            config,
            window: VecDeque::new(),
            last_request: None,
            delay_multiplier: 1.0,
            current_ceiling,
        }
    }

    /// Sleep until both the hourly quota and the minimum spacing allow the
    /// next request.
    pub async fn enforce_quota(&mut self) {
        let now = Instant::now();
        if let Some(wait) = self.quota_wait(now) {
            log::info!("hourly quota reached, pausing {:.0}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
        if let Some(wait) = self.spacing_wait(Instant::now()) {
            tokio::time::sleep(wait).await;
        }
    }

    /// Randomized delay for the given class, scaled by recent traffic
    /// density and the blocking multiplier, capped at `max_delay`.
    pub fn compute_delay(&mut self, class: DelayClass) -> Duration {
        let now = Instant::now();
        self.prune(now);

        let (lo, hi) = match class {
            DelayClass::Normal => self.config.normal_delay,
            DelayClass::Retry => self.config.retry_delay,
            DelayClass::Error => self.config.error_delay,
        };
        let base = if hi > lo {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };

        let recent = self
            .window
            .iter()
            .filter(|at| now.duration_since(**at) < DENSITY_WINDOW)
            .count();
        let density = if recent > 10 {
            2.0
        } else if recent > 5 {
            1.5
        } else {
            1.0
        };

        let near_ceiling = if self.window.len() as f64 > self.current_ceiling as f64 * 0.8 {
            3.0
        } else {
            1.0
        };

        let seconds = base * density * near_ceiling * self.delay_multiplier;
        Duration::from_secs_f64(seconds).min(self.config.max_delay)
    }

    pub fn record_request(&mut self) {
        let now = Instant::now();
        self.window.push_back(now);
        self.last_request = Some(now);
    }

    /// React to a blocking response: grow the multiplier and shrink the
    /// effective ceiling.
    pub fn on_blocking(&mut self) {
        self.delay_multiplier = (self.delay_multiplier * 1.5).min(MULTIPLIER_CAP);
        self.current_ceiling = self.current_ceiling.saturating_sub(10).max(CEILING_FLOOR);
        log::warn!(
            "blocking response, multiplier {:.2}, ceiling {}",
            self.delay_multiplier,
            self.current_ceiling
        );
    }

    /// React to a success: decay the multiplier toward 1.0 and restore the
    /// ceiling toward its configured value.
    pub fn on_success(&mut self) {
        if self.delay_multiplier > 1.0 {
            self.delay_multiplier = (self.delay_multiplier * 0.9).max(1.0);
        }
        self.current_ceiling = (self.current_ceiling + 5).min(self.config.hourly_ceiling);
    }

    pub fn delay_multiplier(&self) -> f64 {
        self.delay_multiplier
    }

    pub fn hourly_ceiling(&self) -> usize {
        self.current_ceiling
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.duration_since(*oldest) > WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Remaining wait for the hourly quota, if it is currently exhausted.
    /// Clears the window once the wait is decided so the next request
    /// starts a fresh hour.
    fn quota_wait(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        if self.window.len() < self.current_ceiling {
            return None;
        }
        let oldest = *self.window.front()?;
        let age = now.duration_since(oldest);
        self.window.clear();
        WINDOW.checked_sub(age).filter(|wait| !wait.is_zero())
    }

    fn spacing_wait(&self, now: Instant) -> Option<Duration> {
        let last = self.last_request?;
        let elapsed = now.duration_since(last);
        self.config
            .min_spacing
            .checked_sub(elapsed)
            .filter(|wait| !wait.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_delay_config() -> RateConfig {
        RateConfig {
            normal_delay: (5.0, 5.0),
            retry_delay: (10.0, 10.0),
            error_delay: (15.0, 15.0),
            ..Default::default()
        }
    }

    #[test]
    fn prune_drops_entries_older_than_an_hour() {
        let mut controller = RateController::new(RateConfig::default());
        let now = Instant::now();
        if let Some(old) = now.checked_sub(Duration::from_secs(3601)) {
            controller.window.push_back(old);
        }
        controller.window.push_back(now);
        controller.prune(now);
        assert_eq!(controller.window.len(), 1);
    }

    #[test]
    fn quota_wait_fires_at_ceiling_and_clears_window() {
        let config = RateConfig {
            hourly_ceiling: 3,
            ..Default::default()
        };
        let mut controller = RateController::new(config);
        let now = Instant::now();

        for _ in 0..2 {
            controller.window.push_back(now);
        }
        assert!(controller.quota_wait(now).is_none());

        controller.window.push_back(now);
        let wait = controller.quota_wait(now).unwrap();
        assert!(wait <= WINDOW);
        assert!(wait > Duration::from_secs(3590));
        assert!(controller.window.is_empty());
    }

    #[test]
    fn spacing_wait_respects_min_gap() {
        let mut controller = RateController::new(RateConfig::default());
        let now = Instant::now();
        assert!(controller.spacing_wait(now).is_none());

        controller.last_request = Some(now);
        let wait = controller.spacing_wait(now).unwrap();
        assert!(wait <= Duration::from_secs(3));

        let later = now + Duration::from_secs(5);
        assert!(controller.spacing_wait(later).is_none());
    }

    #[test]
    fn multiplier_grows_on_blocking_and_decays_to_one() {
        let mut controller = RateController::new(RateConfig::default());
        controller.on_blocking();
        assert!((controller.delay_multiplier() - 1.5).abs() < 1e-9);
        controller.on_blocking();
        assert!((controller.delay_multiplier() - 2.25).abs() < 1e-9);

        let mut previous = controller.delay_multiplier();
        for _ in 0..100 {
            controller.on_success();
            assert!(controller.delay_multiplier() <= previous);
            previous = controller.delay_multiplier();
        }
        assert!((controller.delay_multiplier() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn multiplier_is_capped() {
        let mut controller = RateController::new(RateConfig::default());
        for _ in 0..20 {
            controller.on_blocking();
        }
        assert!((controller.delay_multiplier() - MULTIPLIER_CAP).abs() < 1e-9);
    }

    #[test]
    fn delay_grows_after_blocking() {
        let mut controller = RateController::new(fixed_delay_config());
        let before = controller.compute_delay(DelayClass::Normal);
        controller.on_blocking();
        let after = controller.compute_delay(DelayClass::Normal);
        assert!(after > before);
    }

    #[test]
    fn ceiling_shrinks_and_restores_within_bounds() {
        let mut controller = RateController::new(RateConfig::default());
        assert_eq!(controller.hourly_ceiling(), 50);

        for _ in 0..10 {
            controller.on_blocking();
        }
        assert_eq!(controller.hourly_ceiling(), CEILING_FLOOR);

        for _ in 0..20 {
            controller.on_success();
        }
        assert_eq!(controller.hourly_ceiling(), 50);
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let mut controller = RateController::new(RateConfig {
            error_delay: (30.0, 30.0),
            max_delay: Duration::from_secs(40),
            ..Default::default()
        });
        for _ in 0..20 {
            controller.on_blocking();
        }
        let delay = controller.compute_delay(DelayClass::Error);
        assert!(delay <= Duration::from_secs(40));
    }
}
