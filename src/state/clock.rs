//! Local one-second countdown approximating the authority's timer.

/// Signal raised by [`Clock::tick`] when the countdown reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Arm cycle that produced the signal.
    pub cycle: u64,
}

/// Countdown with one-second resolution.
///
/// The clock never goes negative and raises [`Expired`] at most once per arm
/// cycle. After expiry it holds at zero until [`Clock::arm`] is called again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clock {
    remaining: u32,
    running: bool,
    fired: bool,
    cycle: u64,
}

impl Clock {
    /// Create a disarmed clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the countdown to `seconds` and start ticking.
    ///
    /// Every call opens a new arm cycle; the caller driving the ticks uses
    /// [`Clock::cycle`] to restart its interval so a previous timer never keeps
    /// ticking alongside the new one.
    pub fn arm(&mut self, seconds: u32) {
        self.remaining = seconds;
        self.running = true;
        self.fired = false;
        self.cycle += 1;
    }

    /// Stop ticking without raising [`Expired`].
    pub fn disarm(&mut self) {
        self.running = false;
    }

    /// Advance the countdown by exactly one second.
    pub fn tick(&mut self) -> Option<Expired> {
        if !self.running {
            return None;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 && !self.fired {
            self.fired = true;
            self.running = false;
            return Some(Expired { cycle: self.cycle });
        }

        None
    }

    /// Overwrite the remaining time with an authoritative value (last write wins).
    ///
    /// Negative values clamp to zero. A clock that already expired in the
    /// current cycle stays at zero; a value of zero on a running clock makes
    /// the next tick raise [`Expired`].
    pub fn sync(&mut self, seconds: i64) {
        if self.fired {
            return;
        }
        self.remaining = u32::try_from(seconds.max(0)).unwrap_or(u32::MAX);
    }

    /// Seconds left on the countdown.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Whether ticks currently decrement the countdown.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether [`Expired`] has been raised for the current arm cycle.
    pub fn has_expired(&self) -> bool {
        self.fired
    }

    /// Identifier of the current arm cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_is_idle() {
        let mut clock = Clock::new();
        assert!(!clock.is_running());
        assert_eq!(clock.tick(), None);
        assert_eq!(clock.remaining(), 0);
    }

    #[test]
    fn counts_down_and_fires_once() {
        let mut clock = Clock::new();
        clock.arm(3);

        assert_eq!(clock.tick(), None);
        assert_eq!(clock.tick(), None);
        assert_eq!(clock.tick(), Some(Expired { cycle: 1 }));
        assert_eq!(clock.remaining(), 0);

        for _ in 0..5 {
            assert_eq!(clock.tick(), None);
        }
        assert_eq!(clock.remaining(), 0);
    }

    #[test]
    fn disarm_never_fires() {
        let mut clock = Clock::new();
        clock.arm(2);
        clock.tick();
        clock.disarm();

        assert_eq!(clock.tick(), None);
        assert_eq!(clock.remaining(), 1);
        assert!(!clock.has_expired());
    }

    #[test]
    fn rearm_starts_new_cycle() {
        let mut clock = Clock::new();
        clock.arm(1);
        assert_eq!(clock.tick(), Some(Expired { cycle: 1 }));

        clock.arm(2);
        assert_eq!(clock.cycle(), 2);
        assert_eq!(clock.tick(), None);
        assert_eq!(clock.tick(), Some(Expired { cycle: 2 }));
    }

    #[test]
    fn sync_is_last_write_wins() {
        let mut clock = Clock::new();
        clock.arm(10);
        clock.tick();
        clock.sync(42);
        assert_eq!(clock.remaining(), 42);
        clock.tick();
        assert_eq!(clock.remaining(), 41);
    }

    #[test]
    fn sync_to_zero_or_below_expires_on_next_tick() {
        let mut clock = Clock::new();
        clock.arm(10);
        clock.sync(-4);
        assert_eq!(clock.remaining(), 0);
        assert_eq!(clock.tick(), Some(Expired { cycle: 1 }));
        assert_eq!(clock.tick(), None);
    }

    #[test]
    fn sync_after_expiry_holds_zero() {
        let mut clock = Clock::new();
        clock.arm(1);
        clock.tick();
        clock.sync(30);
        assert_eq!(clock.remaining(), 0);
        assert_eq!(clock.tick(), None);
    }

    #[test]
    fn interleaved_syncs_and_ticks_fire_exactly_once() {
        let mut clock = Clock::new();
        clock.arm(5);
        let script: [Option<i64>; 12] = [
            None,
            Some(7),
            None,
            Some(-1),
            None,
            Some(3),
            None,
            None,
            Some(2),
            None,
            None,
            None,
        ];

        let mut fired = 0;
        for step in script {
            match step {
                Some(value) => clock.sync(value),
                None => {
                    if clock.tick().is_some() {
                        fired += 1;
                    }
                }
            }
        }

        assert_eq!(fired, 1);
        assert_eq!(clock.remaining(), 0);
    }
}
