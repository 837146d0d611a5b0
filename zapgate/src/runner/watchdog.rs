//! Stall watchdog state machine.
//!
//! Consumes ffmpeg progress lines and a clock; enforces a start deadline
//! (first meaningful progress) and a stall deadline (progress while
//! running). Pure: the driver task feeds it lines and ticks.

use std::time::{Duration, Instant};

use super::stderr::{parse_out_time_ms, parse_total_size};

/// Watchdog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Spawned, waiting for the first meaningful progress.
    Starting,
    /// Progress observed; stall deadline armed.
    Running,
    /// Progress dried up while running.
    Stalled,
    /// No progress ever arrived within the start deadline.
    TimedOut,
}

impl WatchdogState {
    /// Terminal states require killing the child.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WatchdogState::Stalled | WatchdogState::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchdogState::Starting => "starting",
            WatchdogState::Running => "running",
            WatchdogState::Stalled => "stalled",
            WatchdogState::TimedOut => "start_timeout",
        }
    }
}

/// The stall watchdog.
#[derive(Debug)]
pub struct StallWatchdog {
    state: WatchdogState,
    started_at: Instant,
    last_progress: Instant,
    /// Highest accepted total_size; smaller values are transcoder artefacts
    /// and must not count as progress.
    max_total_size: i64,
    start_deadline: Duration,
    stall_deadline: Duration,
}

impl StallWatchdog {
    pub fn new(start_deadline: Duration, stall_deadline: Duration, now: Instant) -> Self {
        Self {
            state: WatchdogState::Starting,
            started_at: now,
            last_progress: now,
            max_total_size: 0,
            start_deadline,
            stall_deadline,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Feed one stderr line. Returns true when the line carried meaningful
    /// progress.
    ///
    /// Meaningful progress is `out_time_ms > 0` or a strictly increasing
    /// `total_size`. Once running the machine never returns to starting.
    pub fn observe_line(&mut self, line: &str, now: Instant) -> bool {
        if self.state.is_fatal() {
            return false;
        }

        let mut meaningful = false;

        if let Some(out_time) = parse_out_time_ms(line)
            && out_time > 0
        {
            meaningful = true;
        }

        if let Some(size) = parse_total_size(line) {
            if size > self.max_total_size {
                self.max_total_size = size;
                meaningful = true;
            }
            // Non-monotonic sizes are ignored entirely.
        }

        if meaningful {
            self.last_progress = now;
            if self.state == WatchdogState::Starting {
                self.state = WatchdogState::Running;
            }
        }

        meaningful
    }

    /// Evaluate deadlines against the clock; returns the (possibly new)
    /// state.
    pub fn tick(&mut self, now: Instant) -> WatchdogState {
        match self.state {
            WatchdogState::Starting => {
                if now.duration_since(self.started_at) >= self.start_deadline {
                    self.state = WatchdogState::TimedOut;
                }
            }
            WatchdogState::Running => {
                if now.duration_since(self.last_progress) >= self.stall_deadline {
                    self.state = WatchdogState::Stalled;
                }
            }
            WatchdogState::Stalled | WatchdogState::TimedOut => {}
        }
        self.state
    }

    /// Highest total_size accepted so far.
    pub fn max_total_size(&self) -> i64 {
        self.max_total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog(start_secs: u64, stall_secs: u64) -> (StallWatchdog, Instant) {
        let now = Instant::now();
        (
            StallWatchdog::new(
                Duration::from_secs(start_secs),
                Duration::from_secs(stall_secs),
                now,
            ),
            now,
        )
    }

    #[test]
    fn starts_in_starting() {
        let (dog, _) = watchdog(10, 5);
        assert_eq!(dog.state(), WatchdogState::Starting);
    }

    #[test]
    fn out_time_moves_to_running() {
        let (mut dog, now) = watchdog(10, 5);
        assert!(dog.observe_line("out_time_ms=40000", now));
        assert_eq!(dog.state(), WatchdogState::Running);
    }

    #[test]
    fn zero_out_time_is_not_progress() {
        let (mut dog, now) = watchdog(10, 5);
        assert!(!dog.observe_line("out_time_ms=0", now));
        assert_eq!(dog.state(), WatchdogState::Starting);
    }

    #[test]
    fn total_size_must_strictly_increase() {
        let (mut dog, now) = watchdog(10, 5);
        assert!(dog.observe_line("total_size=1000", now));
        assert_eq!(dog.state(), WatchdogState::Running);

        // Repeat and regression are artefacts, not progress.
        assert!(!dog.observe_line("total_size=1000", now));
        assert!(!dog.observe_line("total_size=500", now));
        assert_eq!(dog.max_total_size(), 1000);

        assert!(dog.observe_line("total_size=1001", now));
        assert_eq!(dog.max_total_size(), 1001);
    }

    #[test]
    fn start_deadline_times_out() {
        let (mut dog, now) = watchdog(10, 5);
        assert_eq!(dog.tick(now + Duration::from_secs(9)), WatchdogState::Starting);
        assert_eq!(dog.tick(now + Duration::from_secs(10)), WatchdogState::TimedOut);
        assert!(dog.state().is_fatal());
    }

    #[test]
    fn stall_deadline_fires_from_running() {
        let (mut dog, now) = watchdog(10, 5);
        dog.observe_line("out_time_ms=1", now);

        assert_eq!(dog.tick(now + Duration::from_secs(4)), WatchdogState::Running);
        assert_eq!(dog.tick(now + Duration::from_secs(5)), WatchdogState::Stalled);
    }

    #[test]
    fn progress_rearms_the_stall_deadline() {
        let (mut dog, now) = watchdog(10, 5);
        dog.observe_line("out_time_ms=1", now);
        dog.observe_line("total_size=10", now + Duration::from_secs(4));

        assert_eq!(dog.tick(now + Duration::from_secs(8)), WatchdogState::Running);
        assert_eq!(dog.tick(now + Duration::from_secs(9)), WatchdogState::Stalled);
    }

    #[test]
    fn never_returns_to_starting() {
        let (mut dog, now) = watchdog(10, 5);
        dog.observe_line("out_time_ms=1", now);
        assert_eq!(dog.state(), WatchdogState::Running);

        // Garbage lines never regress the machine.
        dog.observe_line("frame=0", now + Duration::from_secs(1));
        assert_eq!(dog.state(), WatchdogState::Running);
    }

    #[test]
    fn fatal_state_ignores_late_progress() {
        let (mut dog, now) = watchdog(1, 5);
        dog.tick(now + Duration::from_secs(2));
        assert_eq!(dog.state(), WatchdogState::TimedOut);

        assert!(!dog.observe_line("out_time_ms=99", now + Duration::from_secs(3)));
        assert_eq!(dog.state(), WatchdogState::TimedOut);
    }
}
