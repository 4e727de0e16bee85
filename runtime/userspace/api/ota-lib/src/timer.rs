// Licensed under the Apache-2.0 license

use std::thread;
use std::time::Duration;

/// Blocking wait used between update attempts and receive polls.
pub trait Delay: Sync {
    fn delay(&self, duration: Duration);
}

/// [`Delay`] backed by the host scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn std_delay_sleeps() {
        let start = Instant::now();
        StdDelay.delay(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
