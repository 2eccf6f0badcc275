//! # World Clock
//!
//! Simulated time of one world. Delayed messages fire against
//! [`Clock::now`], not wall time.

use std::time::Duration;

/// Accumulated simulated time.
#[derive(Clone, Debug, PartialEq)]
pub struct Clock {
    now: Duration,
    delta: Duration,
    speed: f64,
    paused: bool,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Clock {
    /// Creates a clock at zero running at `speed`.
    #[must_use]
    pub fn new(speed: f64) -> Self {
        Self {
            now: Duration::ZERO,
            delta: Duration::ZERO,
            speed: sanitize_speed(speed),
            paused: false,
        }
    }

    /// Accumulated simulated time.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Simulated time added by the last update.
    #[inline]
    #[must_use]
    pub fn delta(&self) -> Duration {
        self.delta
    }

    /// Speed factor applied to real time.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Sets the speed factor. Negative or non-finite values stop the clock.
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = sanitize_speed(speed);
    }

    /// True while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pauses or resumes.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Advances by `real` scaled by the speed factor.
    pub fn update(&mut self, real: Duration) {
        self.delta = if self.paused {
            Duration::ZERO
        } else if (self.speed - 1.0).abs() < f64::EPSILON {
            // Exact at normal speed
            real
        } else {
            Duration::try_from_secs_f64(real.as_secs_f64() * self.speed).unwrap_or_else(|_| {
                tracing::warn!(speed = self.speed, ?real, "scaled frame time overflows, saturating");
                Duration::MAX
            })
        };
        // Saturates instead of wrapping after extreme speeds
        self.now = self.now.saturating_add(self.delta);
    }

    /// Moves the clock to an absolute time without producing a delta.
    pub fn set_now(&mut self, now: Duration) {
        self.now = now;
        self.delta = Duration::ZERO;
    }
}

fn sanitize_speed(speed: f64) -> f64 {
    if speed.is_finite() && speed >= 0.0 {
        speed
    } else {
        tracing::warn!(speed, "invalid clock speed, clamping to 0");
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_scales_delta() {
        let mut clock = Clock::new(2.0);
        clock.update(Duration::from_millis(10));
        assert_eq!(clock.delta(), Duration::from_millis(20));
        assert_eq!(clock.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_paused_clock_holds() {
        let mut clock = Clock::default();
        clock.set_paused(true);
        clock.update(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(clock.delta(), Duration::ZERO);
    }

    #[test]
    fn test_huge_speed_saturates() {
        let mut clock = Clock::new(1e300);
        clock.update(Duration::from_millis(16));
        assert_eq!(clock.delta(), Duration::MAX);
        assert_eq!(clock.now(), Duration::MAX);
        clock.update(Duration::from_millis(16));
        assert_eq!(clock.now(), Duration::MAX);
    }

    #[test]
    fn test_invalid_speed_clamped() {
        let mut clock = Clock::new(f64::NAN);
        assert_eq!(clock.speed(), 0.0);
        clock.set_speed(-1.0);
        assert_eq!(clock.speed(), 0.0);
    }
}
