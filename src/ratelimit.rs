// ABOUTME: Token-bucket rate limiting keyed by IP or user with background sweeping
// ABOUTME: Includes trusted-proxy-aware client IP extraction for limiter keys
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Rate limiting
//!
//! One [`RateLimiter`] instance per layer (per-IP, per-user). Each key owns a
//! token bucket behind its own mutex so only the target bucket serializes;
//! the bucket map itself sits behind a reader-writer lock. A sweep loop
//! evicts buckets untouched for ten minutes using the collect-under-read,
//! delete-under-write pattern.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::headers;

/// A single token bucket.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token-bucket limiter over string keys.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    rate: f64,
    burst: f64,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter replenishing `rate` tokens per second with the given
    /// burst capacity. A rate of zero disables the limiter: every call to
    /// [`RateLimiter::allow`] succeeds.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            buckets: RwLock::new(HashMap::new()),
            rate,
            burst: f64::from(burst),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Whether this limiter layer is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.rate > 0.0
    }

    /// Take one token from the bucket for `key`. Returns whether the request
    /// is allowed.
    pub fn allow(&self, key: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let bucket = self.bucket_for(key);
        let Ok(mut bucket) = bucket.lock() else {
            // Poisoned bucket mutex: fail open.
            return true;
        };

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn bucket_for(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Ok(buckets) = self.buckets.read() {
            if let Some(bucket) = buckets.get(key) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = match self.buckets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                tokens: self.burst,
                last_refill: Instant::now(),
                last_seen: Instant::now(),
            }))
        });
        Arc::clone(bucket)
    }

    /// Spawn the bucket eviction loop.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, idle: Duration) {
        let limiter = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.sweep_once(idle),
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            *slot = Some(handle);
        }
    }

    /// One eviction pass: collect idle keys under the read lock, delete
    /// under the write lock with a re-check.
    pub fn sweep_once(&self, idle: Duration) {
        let now = Instant::now();
        let stale: Vec<String> = {
            let Ok(buckets) = self.buckets.read() else {
                return;
            };
            buckets
                .iter()
                .filter(|(_, bucket)| {
                    bucket
                        .lock()
                        .map(|b| now.duration_since(b.last_seen) > idle)
                        .unwrap_or(true)
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let Ok(mut buckets) = self.buckets.write() else {
            return;
        };
        for key in stale {
            let still_idle = buckets.get(&key).is_some_and(|bucket| {
                bucket
                    .lock()
                    .map(|b| now.duration_since(b.last_seen) > idle)
                    .unwrap_or(true)
            });
            if still_idle {
                buckets.remove(&key);
            }
        }
    }

    /// Stop the sweep loop. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Number of live buckets (sweeper observability and tests).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().map(|b| b.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

/// Determine the client IP for limiter keys.
///
/// Without `trust_proxy` the TCP peer is authoritative and forwarding headers
/// are ignored, since any client can write them. With `trust_proxy`, the
/// *last* `X-Forwarded-For` entry wins (the one appended by the trusted
/// proxy, not the client-spoofable first entry), falling back to `X-Real-IP`
/// and then the peer.
#[must_use]
pub fn client_ip(peer: Option<IpAddr>, header_map: &HeaderMap, trust_proxy: bool) -> Option<IpAddr> {
    if !trust_proxy {
        return peer;
    }

    if let Some(forwarded) = header_map
        .get(headers::X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(last) = forwarded.split(',').next_back() {
            if let Ok(ip) = last.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    if let Some(real_ip) = header_map
        .get(headers::X_REAL_IP)
        .and_then(|v| v.to_str().ok())
    {
        if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
            return Some(ip);
        }
    }

    peer
}
