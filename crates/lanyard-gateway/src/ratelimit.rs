use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Parameters for a sliding-window limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub max_events: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

/// Flat minimum-interval limiter. `check` either records a hit or reports
/// how long the caller has to wait.
#[derive(Debug)]
pub struct MinInterval {
    interval: Duration,
    last: Option<Instant>,
}

impl MinInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn check(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.interval {
                return Err(self.interval - elapsed);
            }
        }
        self.last = Some(now);
        Ok(())
    }
}

/// Sliding-window limiter with a cooldown. Exceeding `max_events` within
/// `window` starts the cooldown; further attempts during it do not extend it.
#[derive(Debug)]
pub struct SlidingWindow {
    params: RateWindow,
    hits: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl SlidingWindow {
    pub fn new(params: RateWindow) -> Self {
        Self {
            params,
            hits: VecDeque::with_capacity(params.max_events),
            cooldown_until: None,
        }
    }

    pub fn check(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(until - now);
            }
            self.cooldown_until = None;
        }
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.params.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.params.max_events {
            self.hits.clear();
            self.cooldown_until = Some(now + self.params.cooldown);
            return Err(self.params.cooldown);
        }
        self.hits.push_back(now);
        Ok(())
    }
}
