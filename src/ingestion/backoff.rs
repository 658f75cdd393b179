//! Exponential backoff capped at 60 s, shared by all four ingestion
//! adapters' reconnect loops (§4.3: "Adapters recover from broker
//! disconnects with exponential backoff capped at 60 s").

use std::time::Duration;

pub struct Backoff {
    current: Duration,
    max: Duration,
    initial: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { current: initial, max, initial }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        for _ in 0..10 {
            b.next();
        }
        assert_eq!(b.current(), Duration::from_secs(60));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.current(), Duration::from_secs(1));
    }
}
