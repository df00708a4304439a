//! C6 — Rate Limiter.
//!
//! Sliding window admission control. Ground: `pg_mcp_server/utils
//! /rate_limiter.py`'s `RateLimiter`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitUsage {
    pub current: u32,
    pub max: u32,
    pub window_seconds: u64,
    pub remaining: u32,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    records: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_seconds)
    }

    /// `probe(key) -> (allowed, reason?)` per spec.md §4.6.
    pub fn probe(&self, key: &str) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision {
                allowed: true,
                retry_after_secs: None,
            };
        }

        if self.config.max_requests == 0 {
            return RateLimitDecision {
                allowed: false,
                retry_after_secs: Some(self.config.window_seconds),
            };
        }

        let now = Instant::now();
        let window = self.window();
        let mut records = self.records.lock().expect("rate limiter mutex poisoned");
        let entry = records.entry(key.to_string()).or_default();

        while let Some(front) = entry.front() {
            if now.duration_since(*front) > window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() as u32 >= self.config.max_requests {
            let retry_after = entry
                .front()
                .map(|oldest| {
                    let elapsed = now.duration_since(*oldest);
                    window.saturating_sub(elapsed).as_secs()
                })
                .unwrap_or(self.config.window_seconds);
            return RateLimitDecision {
                allowed: false,
                retry_after_secs: Some(retry_after),
            };
        }

        entry.push_back(now);
        RateLimitDecision {
            allowed: true,
            retry_after_secs: None,
        }
    }

    pub fn usage(&self, key: &str) -> RateLimitUsage {
        let now = Instant::now();
        let window = self.window();
        let mut records = self.records.lock().expect("rate limiter mutex poisoned");
        let current = records
            .get_mut(key)
            .map(|entry| {
                while let Some(front) = entry.front() {
                    if now.duration_since(*front) > window {
                        entry.pop_front();
                    } else {
                        break;
                    }
                }
                entry.len() as u32
            })
            .unwrap_or(0);

        RateLimitUsage {
            current,
            max: self.config.max_requests,
            window_seconds: self.config.window_seconds,
            remaining: self.config.max_requests.saturating_sub(current),
        }
    }

    pub fn reset(&self, key: Option<&str>) {
        let mut records = self.records.lock().expect("rate limiter mutex poisoned");
        match key {
            Some(k) => {
                records.remove(k);
            }
            None => records.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_n_then_denies() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            window_seconds: 60,
            enabled: true,
        });
        let results: Vec<bool> = (0..5).map(|_| limiter.probe("db1").allowed).collect();
        assert_eq!(results, vec![true, true, true, false, false]);
        let usage = limiter.usage("db1");
        assert_eq!(usage.current, 3);
        assert_eq!(usage.remaining, 0);
    }

    #[test]
    fn zero_max_denies_unconditionally() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 0,
            window_seconds: 30,
            enabled: true,
        });
        let decision = limiter.probe("x");
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(30));
    }

    #[test]
    fn disabled_always_allows() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window_seconds: 1,
            enabled: false,
        });
        for _ in 0..10 {
            assert!(limiter.probe("x").allowed);
        }
    }
}
