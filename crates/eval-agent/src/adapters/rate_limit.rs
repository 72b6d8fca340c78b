//! Per-backend request throttle.
//!
//! Two limits, both shared by every task calling the backend:
//! a minimum spacing between request starts derived from
//! `requests_per_minute`, and a cap on requests in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
    in_flight: Arc<Semaphore>,
}

/// Held for the duration of one request.
#[derive(Debug)]
pub struct RatePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: Option<u32>, max_in_flight: usize) -> Self {
        let interval = requests_per_minute
            .filter(|&rpm| rpm > 0)
            .map(|rpm| Duration::from_secs(60) / rpm);
        Self {
            interval,
            next_slot: Mutex::new(None),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, Semaphore::MAX_PERMITS)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait for an in-flight slot, then for this request's start time.
    pub async fn acquire(&self) -> RatePermit {
        // Never closed.
        let permit = Arc::clone(&self.in_flight).acquire_owned().await.ok();

        if let Some(interval) = self.interval {
            let start = {
                let mut next = self.next_slot.lock().await;
                let now = Instant::now();
                let start = match *next {
                    Some(slot) if slot > now => slot,
                    _ => now,
                };
                *next = Some(start + interval);
                start
            };
            tokio::time::sleep_until(start).await;
        }

        RatePermit { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_spaced() {
        let limiter = RateLimiter::new(Some(60), 10);
        assert_eq!(limiter.interval(), Some(Duration::from_secs(1)));
        let started = Instant::now();
        for _ in 0..3 {
            let _p = limiter.acquire().await;
        }
        // First request is immediate, the next two wait one interval each.
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_get_distinct_slots() {
        let limiter = Arc::new(RateLimiter::new(Some(120), 10));
        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let _p = l.acquire().await;
                Instant::now()
            }));
        }
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap().duration_since(started));
        }
        times.sort();
        assert_eq!(times[0], Duration::ZERO);
        assert!(times[3] >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_in_flight_cap() {
        let limiter = RateLimiter::new(None, 1);
        let held = limiter.acquire().await;
        let second = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(second.is_err());
        drop(held);
        let _p = limiter.acquire().await;
    }
}
