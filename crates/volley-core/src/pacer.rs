use std::time::Duration;
use tokio::time::{sleep_until, Instant};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Constant-rate pacer using integer-only math.
///
/// Hit `n` (zero based) is due `n / rate` seconds after the first call to
/// [`Pacer::wait`]. Late hits are not skipped, so a slow consumer catches up
/// in a burst rather than losing requests.
#[derive(Debug, Clone)]
pub struct Pacer {
    /// Target rate in hits per second, 0 means unpaced
    rate: u64,
    started: Option<Instant>,
    hits: u64,
}

impl Pacer {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            started: None,
            hits: 0,
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_unpaced(&self) -> bool {
        self.rate == 0
    }

    /// Hits handed out so far.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Offset from the start at which hit `n` is due.
    pub fn due(&self, n: u64) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        let nanos = (n as u128) * NANOS_PER_SECOND / (self.rate as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Wait until the next hit is due and claim it.
    pub async fn wait(&mut self) {
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = self.due(self.hits);
        self.hits += 1;
        if !due.is_zero() {
            sleep_until(started + due).await;
        }
    }
}
