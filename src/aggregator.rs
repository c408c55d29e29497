//! Central-side aggregation of actual state reports.
//!
//! Every satellite periodically reports its observed deployment. The
//! aggregator folds those reports into the global actual state file,
//! keeping in-flight transitions sticky: a host recorded as `stopping`
//! stays `stopping` until it reports `stopped`, and one recorded as
//! `starting` stays `starting` until it reports `running`. A `starting`
//! report with a single host entry marks a freshly connected node, which
//! triggers a forced re-emit of the current desired state.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::Result;
use log::{debug, error};

use crate::deployment::{self, DeploymentConfig, NodeState};
use crate::watcher::WatcherHandle;

const ACTUAL_STATE_FILE_MODE: u32 = 0o644;

/// Applies the sticky-state rule for one host.
pub fn apply_sticky(previous: NodeState, new: NodeState) -> NodeState {
    match (previous, new) {
        (NodeState::Stopping, NodeState::Running) => NodeState::Stopping,
        (NodeState::Starting, NodeState::Stopped) => NodeState::Starting,
        _ => new,
    }
}

pub struct ActualStateAggregator {
    actual_state_path: PathBuf,
    watcher: WatcherHandle,
    global: DeploymentConfig,
}

impl ActualStateAggregator {
    pub fn new(actual_state_path: PathBuf, watcher: WatcherHandle) -> Self {
        Self {
            actual_state_path,
            watcher,
            global: DeploymentConfig::new(),
        }
    }

    /// Folds one actual-state report into the persisted global state.
    pub async fn handle(&mut self, report: DeploymentConfig) -> Result<()> {
        for (hostname, node) in &report {
            match node.state {
                // helper state requesting transmission of the deployment
                // configuration upon node startup
                NodeState::Starting => {
                    if report.len() == 1 {
                        debug!("Node {} connected, re-emitting desired state", hostname);
                        self.watcher.diff(true).await;
                    }
                }
                NodeState::Running | NodeState::Stopped => {
                    self.global.insert(hostname.clone(), node.clone());
                }
                NodeState::Stopping => {}
            }
        }

        let mut persisted = match tokio::fs::read(&self.actual_state_path).await {
            Ok(bytes) => deployment::from_json(&bytes).unwrap_or_else(|e| {
                error!("Discarding malformed actual state file: {}", e);
                DeploymentConfig::new()
            }),
            Err(_) => DeploymentConfig::new(),
        };

        for (hostname, node) in &self.global {
            let mut node = node.clone();

            if let Some(previous) = persisted.get(hostname) {
                node.state = apply_sticky(previous.state, node.state);
            }

            persisted.insert(hostname.clone(), node);
        }

        let json = deployment::to_json(&persisted)?;
        tokio::fs::write(&self.actual_state_path, json).await?;
        tokio::fs::set_permissions(
            &self.actual_state_path,
            std::fs::Permissions::from_mode(ACTUAL_STATE_FILE_MODE),
        )
        .await?;

        Ok(())
    }
}
