//! The upstream release feed: decide interest, batch into the work queue.

use async_trait::async_trait;
use rebuildr_schema::Ecosystem;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::errors::RebuildResult;

/// One upstream release event, as the feed ingests it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEvent {
    /// Which registry published
    pub ecosystem: Ecosystem,
    /// Package name
    pub package: String,
    /// Published version
    pub version: String,
    /// Published artifact, when the event names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// The predicate deciding which events become rebuild tasks.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    ecosystems: BTreeSet<Ecosystem>,
    packages: Option<HashMap<Ecosystem, HashSet<String>>>,
}

impl Tracker {
    /// Track every package of the given ecosystems.
    pub fn all_of(ecosystems: impl IntoIterator<Item = Ecosystem>) -> Self {
        Tracker {
            ecosystems: ecosystems.into_iter().collect(),
            packages: None,
        }
    }

    /// Track only an explicit per-ecosystem package allowlist.
    pub fn allowlist(packages: HashMap<Ecosystem, HashSet<String>>) -> Self {
        Tracker {
            ecosystems: packages.keys().copied().collect(),
            packages: Some(packages),
        }
    }

    /// Whether an event is interesting.
    pub fn tracks(&self, event: &ReleaseEvent) -> bool {
        if !self.ecosystems.contains(&event.ecosystem) {
            return false;
        }
        match &self.packages {
            None => true,
            Some(packages) => packages
                .get(&event.ecosystem)
                .is_some_and(|set| set.contains(&event.package)),
        }
    }
}

/// Where tracked events go, one batch at a time.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue one batch of tasks.
    async fn enqueue(&self, batch: Vec<ReleaseEvent>) -> RebuildResult<()>;
}

/// In-memory queue for tests.
#[derive(Default)]
pub struct MemQueue {
    batches: Mutex<Vec<Vec<ReleaseEvent>>>,
}

impl MemQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of enqueued batches.
    pub fn batches(&self) -> Vec<Vec<ReleaseEvent>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkQueue for MemQueue {
    async fn enqueue(&self, batch: Vec<ReleaseEvent>) -> RebuildResult<()> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Tracker plus queue: the feed endpoint's worker.
pub struct Feed {
    tracker: Tracker,
    queue: Arc<dyn WorkQueue>,
    batch_size: usize,
}

impl Feed {
    /// A feed batching `batch_size` tracked events per enqueue.
    pub fn new(tracker: Tracker, queue: Arc<dyn WorkQueue>, batch_size: usize) -> Self {
        Feed {
            tracker,
            queue,
            batch_size: batch_size.max(1),
        }
    }

    /// Filter and enqueue; returns how many events were tracked.
    pub async fn ingest(&self, events: Vec<ReleaseEvent>) -> RebuildResult<usize> {
        let tracked: Vec<ReleaseEvent> = events
            .into_iter()
            .filter(|event| self.tracker.tracks(event))
            .collect();
        let count = tracked.len();
        for chunk in tracked.chunks(self.batch_size) {
            self.queue.enqueue(chunk.to_vec()).await?;
        }
        debug!(count, "feed ingested events");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ecosystem: Ecosystem, package: &str) -> ReleaseEvent {
        ReleaseEvent {
            ecosystem,
            package: package.to_owned(),
            version: "1.0.0".to_owned(),
            artifact: None,
        }
    }

    #[test]
    fn tracker_predicates() {
        let all_npm = Tracker::all_of([Ecosystem::Npm]);
        assert!(all_npm.tracks(&event(Ecosystem::Npm, "left-pad")));
        assert!(!all_npm.tracks(&event(Ecosystem::Pypi, "absl-py")));

        let allow = Tracker::allowlist(HashMap::from([(
            Ecosystem::Pypi,
            HashSet::from(["absl-py".to_owned()]),
        )]));
        assert!(allow.tracks(&event(Ecosystem::Pypi, "absl-py")));
        assert!(!allow.tracks(&event(Ecosystem::Pypi, "requests")));
        assert!(!allow.tracks(&event(Ecosystem::Npm, "absl-py")));
    }

    #[tokio::test]
    async fn ingest_batches_tracked_events() {
        let queue = Arc::new(MemQueue::new());
        let feed = Feed::new(Tracker::all_of([Ecosystem::Npm]), queue.clone(), 2);

        let count = feed
            .ingest(vec![
                event(Ecosystem::Npm, "a"),
                event(Ecosystem::Pypi, "skipped"),
                event(Ecosystem::Npm, "b"),
                event(Ecosystem::Npm, "c"),
            ])
            .await
            .unwrap();
        assert_eq!(count, 3);

        let batches = queue.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }
}
