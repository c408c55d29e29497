//! Versioned per-node snapshot cache.
//!
//! Each node ID owns a watch slot holding the latest routing snapshot.
//! Setting a snapshot replaces the previous one atomically; subscribers
//! (the discovery streams) observe only the newest value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::watch;

use crate::proto::xds::v1::{Cluster, Listener, RouteConfiguration};

/// A versioned routing program for one node's sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: String,
    pub clusters: Vec<Cluster>,
    pub routes: Vec<RouteConfiguration>,
    pub listeners: Vec<Listener>,
}

type Slot = watch::Sender<Option<Arc<Snapshot>>>;

#[derive(Default)]
pub struct SnapshotCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot stored for a node.
    pub fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("snapshot cache lock poisoned"))?;

        slots
            .entry(node_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(Arc::new(snapshot)));

        Ok(())
    }

    /// Subscribes to a node's snapshot slot. Works before the first
    /// snapshot lands; the receiver then starts out empty.
    pub fn subscribe(&self, node_id: &str) -> Result<watch::Receiver<Option<Arc<Snapshot>>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("snapshot cache lock poisoned"))?;

        Ok(slots
            .entry(node_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe())
    }

    /// Returns the currently stored snapshot for a node.
    pub fn get_snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        let slots = self.slots.lock().ok()?;

        slots.get(node_id).and_then(|slot| slot.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: &str) -> Snapshot {
        Snapshot {
            version: version.into(),
            clusters: Vec::new(),
            routes: Vec::new(),
            listeners: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replaces_snapshots_atomically() {
        let cache = SnapshotCache::new();

        cache.set_snapshot("node-0", snapshot("1.0")).unwrap();
        cache.set_snapshot("node-0", snapshot("2.0")).unwrap();

        assert_eq!(cache.get_snapshot("node-0").unwrap().version, "2.0");
        assert!(cache.get_snapshot("node-1").is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_updates() {
        let cache = SnapshotCache::new();

        let mut rx = cache.subscribe("node-0").unwrap();
        assert!(rx.borrow().is_none());

        cache.set_snapshot("node-0", snapshot("1.0")).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().version, "1.0");
    }
}
