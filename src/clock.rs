use std::time::Instant;

/// Monotonic stopwatch used for busy/idle accounting.
///
/// `reset` returns the seconds elapsed since the previous reset (or
/// construction) and restarts the window. `get` reads the same span without
/// restarting it.
#[derive(Debug, Clone)]
pub struct Clock {
    last: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    pub fn reset(&mut self) -> f32 {
        let now = Instant::now();
        let seconds = now.duration_since(self.last).as_secs_f32();
        self.last = now;
        seconds
    }

    pub fn get(&self) -> f32 {
        self.last.elapsed().as_secs_f32()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reset_restarts_window() {
        let mut clock = Clock::new();

        thread::sleep(Duration::from_millis(20));
        let first = clock.reset();
        assert!(first >= 0.02);

        // The window restarted, so the next read is close to zero.
        assert!(clock.get() < first);
    }

    #[test]
    fn test_get_does_not_restart() {
        let clock = Clock::new();

        thread::sleep(Duration::from_millis(10));
        let a = clock.get();
        thread::sleep(Duration::from_millis(10));
        let b = clock.get();

        assert!(b > a);
    }
}
