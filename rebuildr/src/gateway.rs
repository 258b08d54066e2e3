//! Rate-limited egress gateway.
//!
//! A per-hostname token bucket: each configured host gets a single consumer
//! task refilled by a ticker, and a caller blocks by sending a callback into
//! the bucket's queue and waiting for its invocation. Unconfigured hosts are
//! not limited. Bucket depth provides short-term burst absorption; there is
//! deliberately no fairness across hosts.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::errors::{RebuildError, RebuildResult};

const BUCKET_DEPTH: usize = 300;

/// Per-host admission control for scraping and upstream fetches.
pub struct RateLimiter {
    buckets: HashMap<String, mpsc::Sender<oneshot::Sender<()>>>,
}

fn spawn_bucket(interval: Duration) -> mpsc::Sender<oneshot::Sender<()>> {
    let (tx, mut rx) = mpsc::channel::<oneshot::Sender<()>>(BUCKET_DEPTH);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while let Some(waiter) = rx.recv().await {
            ticker.tick().await;
            // the waiter may have been cancelled while queued
            let _ = waiter.send(());
        }
    });
    tx
}

impl RateLimiter {
    /// A limiter for the given `(host, min interval)` pairs.
    pub fn new(hosts: impl IntoIterator<Item = (String, Duration)>) -> Self {
        let buckets = hosts
            .into_iter()
            .map(|(host, interval)| (host, spawn_bucket(interval)))
            .collect();
        RateLimiter { buckets }
    }

    /// Whether `host` is rate-limited at all.
    pub fn limits(&self, host: &str) -> bool {
        self.buckets.contains_key(host)
    }

    /// Acquire one token for `host`, honoring caller cancellation. Returns
    /// immediately for unconfigured hosts.
    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> RebuildResult<()> {
        let Some(bucket) = self.buckets.get(host) else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        bucket
            .send(tx)
            .await
            .map_err(|_| RebuildError::internal(format!("rate bucket for {host} is gone")))?;
        tokio::select! {
            token = rx => token.map_err(|_| {
                RebuildError::internal(format!("rate bucket for {host} dropped the waiter"))
            }),
            _ = cancel.cancelled() => Err(RebuildError::Canceled {
                message: format!("gave up waiting for a {host} token"),
            }),
        }
    }
}
