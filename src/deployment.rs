//! Deployment configuration data model.
//!
//! A deployment configuration maps node hostnames to the state of the node
//! and the container images that run (or shall run) on it. It is the JSON
//! payload carried inside `DeploymentConfiguration` messages and the schema
//! of the desired/actual state files on the central node.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// State of a node within a deployment configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Starting,
    Running,
    Stopping,
    #[default]
    Stopped,
}

/// State of a node and the containerized software that (shall) run(s) on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    pub state: NodeState,
    #[serde(rename = "container")]
    pub images: Vec<String>,
}

/// Mapping of node hostnames to their `NodeConfig`.
pub type DeploymentConfig = BTreeMap<String, NodeConfig>;

/// Parses JSON into a `DeploymentConfig`.
pub fn from_json(bytes: &[u8]) -> anyhow::Result<DeploymentConfig> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Returns the pretty-printed JSON representation of a `DeploymentConfig`.
pub fn to_json(config: &DeploymentConfig) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(config)?)
}

/// A single-host configuration announcing a node that is starting up.
pub fn for_starting_node(hostname: &str) -> DeploymentConfig {
    single_host(hostname, NodeState::Starting)
}

/// A single-host configuration announcing a node that has shut down.
pub fn for_stopped_node(hostname: &str) -> DeploymentConfig {
    single_host(hostname, NodeState::Stopped)
}

fn single_host(hostname: &str, state: NodeState) -> DeploymentConfig {
    let mut config = DeploymentConfig::new();
    config.insert(
        hostname.to_string(),
        NodeConfig {
            state,
            images: Vec::new(),
        },
    );

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_from_json() {
        let content = r#"{
            "host-1": {
                "state": "running",
                "container": ["localhost/image1:latest", "localhost/image2:v1"]
            },
            "host-2": {
                "state": "running",
                "container": ["localhost/image3:latest"]
            }
        }"#;

        let config = from_json(content.as_bytes()).expect("parse");

        assert_eq!(config.len(), 2);
        assert_eq!(config["host-1"].state, NodeState::Running);
        assert_eq!(
            config["host-1"].images,
            vec!["localhost/image1:latest", "localhost/image2:v1"]
        );
        assert_eq!(config["host-2"].images, vec!["localhost/image3:latest"]);
    }

    #[test]
    fn json_round_trip_is_identity() {
        let mut config = DeploymentConfig::new();
        config.insert(
            "host-1".into(),
            NodeConfig {
                state: NodeState::Running,
                images: vec!["localhost/image1:latest".into(), "localhost/image2:v1".into()],
            },
        );
        config.insert(
            "host-2".into(),
            NodeConfig {
                state: NodeState::Stopping,
                images: vec!["localhost/image3:latest".into()],
            },
        );

        let bytes = to_json(&config).expect("serialize");
        let parsed = from_json(&bytes).expect("parse");

        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_non_object_json() {
        let content = r#"[{"name": "host-1", "state": "running", "container": []}]"#;

        assert!(from_json(content.as_bytes()).is_err());
    }

    #[test]
    fn starting_and_stopped_helpers() {
        let starting = for_starting_node("host-1");
        assert_eq!(starting["host-1"].state, NodeState::Starting);
        assert!(starting["host-1"].images.is_empty());

        let stopped = for_stopped_node("host-1");
        assert_eq!(stopped["host-1"].state, NodeState::Stopped);
        assert!(stopped["host-1"].images.is_empty());
    }
}
