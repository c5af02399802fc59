use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Waits between client reconnection attempts: 1s, 2s, 5s, then 10s
/// forever. Capping at the last entry keeps retry load on the server
/// predictable instead of stretching out indefinitely.
pub const DEFAULT_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Retry driver for the client connection.
///
/// `attempt` schedules one firing and is idempotent while that firing
/// is pending. The first attempt after construction or [`reset`]
/// fires immediately; each later attempt advances one schedule slot.
///
/// [`reset`]: ReconnectTimer::reset
#[derive(Debug)]
pub struct ReconnectTimer {
    schedule: Vec<Duration>,
    position: Option<usize>,
    deadline: Option<Instant>,
}

impl Default for ReconnectTimer {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEDULE.to_vec())
    }
}

impl ReconnectTimer {
    pub fn new(schedule: Vec<Duration>) -> Self {
        assert!(!schedule.is_empty(), "backoff schedule must be nonempty");
        Self {
            schedule,
            position: None,
            deadline: None,
        }
    }

    /// Schedule the next firing unless one is already pending. Returns
    /// whether this call armed the timer.
    pub fn attempt(&mut self) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        let delay = match self.position {
            None => Duration::ZERO,
            Some(slot) => self.schedule[slot],
        };
        self.position = Some(match self.position {
            None => 0,
            Some(slot) => (slot + 1).min(self.schedule.len() - 1),
        });
        self.deadline = Some(Instant::now() + delay);
        true
    }

    /// Cancel any pending firing and rewind to the immediate-retry
    /// position. Called on successful connection.
    pub fn reset(&mut self) {
        self.position = None;
        self.deadline = None;
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    /// Wait until the scheduled firing. Calling this with nothing
    /// scheduled is a programming error.
    pub async fn fired(&mut self) {
        let deadline = self.deadline.expect("no reconnect attempt scheduled");
        sleep_until(deadline).await;
        self.deadline = None;
    }
}
