//! Per-node reconciliation of desired vs. observed containers.
//!
//! On every desired deployment configuration the orchestrator looks up the
//! entry for its own host, diffs the declared image set against the
//! running managed containers, removes what is no longer wanted and
//! installs what is missing. Every successful change is announced upstream
//! through the service announcement channel.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, error};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::deployment::DeploymentConfig;
use crate::proto::service::v1::service_announcement::RegistrationState;
use crate::proto::service::v1::ServiceAnnouncement;
use crate::runtime::image::{extract_image_list, parse_fqin, parse_image_name};
use crate::runtime::{Container, Image, Manager};
use crate::sidecar::SIDECAR_IMAGE_NAME;

/// Name prefix of containers that are not managed by the orchestrator.
pub const UNMANAGED_CONTAINER_NAME_PREFIX: &str = "/carisma-keep-";

/// Drops unmanaged and non-running containers from a container list.
pub fn running_managed_containers(containers: Vec<Container>) -> Vec<Container> {
    containers
        .into_iter()
        .filter(|c| {
            !c.first_name.starts_with(UNMANAGED_CONTAINER_NAME_PREFIX)
                && c.status.starts_with("Up")
        })
        .collect()
}

// Returns the images of `b` that are missing from `a`, compared by
// (name, version).
fn diff(a: &[Image], b: &[Image]) -> Vec<Image> {
    let memory: std::collections::HashMap<&str, &str> = a
        .iter()
        .map(|image| (image.name.as_str(), image.version.as_str()))
        .collect();

    b.iter()
        .filter(|image| memory.get(image.name.as_str()) != Some(&image.version.as_str()))
        .cloned()
        .collect()
}

pub struct Orchestrator {
    cfg: Config,
    manager: Arc<dyn Manager>,
    tx_announcements: mpsc::Sender<ServiceAnnouncement>,
}

impl Orchestrator {
    pub fn new(
        cfg: Config,
        manager: Arc<dyn Manager>,
        tx_announcements: mpsc::Sender<ServiceAnnouncement>,
    ) -> Self {
        Self {
            cfg,
            manager,
            tx_announcements,
        }
    }

    async fn announce(&self, bundle_id: String, service_port: i32, state: RegistrationState) {
        let announcement = ServiceAnnouncement {
            bundle_id,
            local_port: service_port,
            registration_state: state as i32,
        };

        if self.tx_announcements.send(announcement).await.is_err() {
            error!("Service announcement channel is gone");
        }
    }

    /// Reconciles the local container set against a desired deployment
    /// configuration. Per-item failures never abort the batch.
    pub async fn process(&self, config: &DeploymentConfig) -> Result<()> {
        let Some(node) = config.get(&self.cfg.node) else {
            return Ok(());
        };

        let current = running_managed_containers(self.manager.containers().await?);
        let current_images = extract_image_list(&current);

        // Desired image names become fully qualified before comparison
        // with the observed deployment.
        let mut desired_images = Vec::with_capacity(node.images.len());
        for reference in &node.images {
            let mut image = parse_image_name(reference);
            image.name = parse_fqin(&image.name, &self.cfg.default_container_registry_domain)?;
            desired_images.push(image);
        }

        let sidecar_image = parse_image_name(SIDECAR_IMAGE_NAME);

        for image in diff(&desired_images, &current_images) {
            // do not remove communication middleware
            if image.name.ends_with(&sidecar_image.name) {
                continue;
            }

            let reference = format!("{}:{}", image.name, image.version);
            match self.manager.remove_image_and_container(&reference, true).await {
                Ok((bundle_id, service_port)) => {
                    self.announce(bundle_id, service_port, RegistrationState::Unregistered)
                        .await;
                }
                Err(e) => {
                    error!(
                        "Could not remove container image {}, retrying without bundle descriptor: {:#}",
                        reference, e
                    );

                    if let Err(e) = self
                        .manager
                        .remove_image_and_container(&reference, false)
                        .await
                    {
                        error!(
                            "Could not remove container image {}, still unsuccessful: {:#}",
                            reference, e
                        );
                    }
                }
            }
        }

        for image in diff(&current_images, &desired_images) {
            let reference = format!("{}:{}", image.name, image.version);
            match self
                .manager
                .pull_image_and_create_container(&reference, None, None, true)
                .await
            {
                Ok((bundle_id, service_port)) => {
                    debug!("Installed container image {}", reference);
                    self.announce(bundle_id, service_port, RegistrationState::Registered)
                        .await;
                }
                Err(e) => {
                    error!("Could not install container image {}: {:#}", reference, e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{NodeConfig, NodeState};
    use crate::runtime::EmulatedManager;

    fn image(name: &str, version: &str) -> Image {
        Image {
            name: name.into(),
            version: version.into(),
        }
    }

    fn desired(host: &str, images: &[&str]) -> DeploymentConfig {
        let mut config = DeploymentConfig::new();
        config.insert(
            host.into(),
            NodeConfig {
                state: NodeState::Running,
                images: images.iter().map(|i| i.to_string()).collect(),
            },
        );

        config
    }

    fn orchestrator(host: &str) -> (Orchestrator, mpsc::Receiver<ServiceAnnouncement>) {
        let cfg = Config {
            node: host.into(),
            ..Config::default()
        };
        let (tx, rx) = mpsc::channel(16);

        (
            Orchestrator::new(cfg, Arc::new(EmulatedManager::new()), tx),
            rx,
        )
    }

    #[test]
    fn diff_compares_by_name_and_version() {
        let current = vec![image("docker.io/library/alpine", "3"), image("docker.io/app", "v1")];
        let desired = vec![image("docker.io/library/alpine", "3"), image("docker.io/app", "v2")];

        assert_eq!(diff(&current, &desired), vec![image("docker.io/app", "v2")]);
        assert_eq!(diff(&desired, &current), vec![image("docker.io/app", "v1")]);
        assert!(diff(&current, &current).is_empty());
    }

    #[test]
    fn filters_unmanaged_and_stopped_containers() {
        let containers = vec![
            Container {
                id: "1".into(),
                first_name: "/app".into(),
                image: "docker.io/app:v1".into(),
                ports: String::new(),
                status: "Up 5 minutes".into(),
            },
            Container {
                id: "2".into(),
                first_name: "/carisma-keep-db".into(),
                image: "docker.io/db:v1".into(),
                ports: String::new(),
                status: "Up 5 minutes".into(),
            },
            Container {
                id: "3".into(),
                first_name: "/old".into(),
                image: "docker.io/old:v1".into(),
                ports: String::new(),
                status: "Exited (0)".into(),
            },
        ];

        let managed = running_managed_containers(containers);

        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].id, "1");
    }

    #[tokio::test]
    async fn installs_desired_images_and_announces_them() {
        let (orchestrator, mut rx) = orchestrator("h1");

        orchestrator
            .process(&desired("h1", &["alpine:3"]))
            .await
            .expect("process");

        let containers = orchestrator.manager.containers().await.expect("list");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].image, "docker.io/library/alpine:3");

        let announcement = rx.recv().await.expect("announcement");
        assert_eq!(announcement.bundle_id, "com.carisma.app_1");
        assert_eq!(announcement.local_port, 8080);
        assert_eq!(
            announcement.registration_state(),
            RegistrationState::Registered
        );
    }

    #[tokio::test]
    async fn removes_dropped_images_and_announces_them() {
        let (orchestrator, mut rx) = orchestrator("h1");

        orchestrator
            .process(&desired("h1", &["alpine:3"]))
            .await
            .expect("process");
        rx.recv().await.expect("registration");

        orchestrator
            .process(&desired("h1", &[]))
            .await
            .expect("process");

        let announcement = rx.recv().await.expect("announcement");
        assert_eq!(announcement.bundle_id, "com.carisma.app_1");
        assert_eq!(
            announcement.registration_state(),
            RegistrationState::Unregistered
        );

        assert!(orchestrator.manager.containers().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent_for_unchanged_state() {
        let (orchestrator, mut rx) = orchestrator("h1");

        orchestrator
            .process(&desired("h1", &["alpine:3"]))
            .await
            .expect("process");
        rx.recv().await.expect("registration");

        orchestrator
            .process(&desired("h1", &["alpine:3"]))
            .await
            .expect("process");

        assert!(rx.try_recv().is_err());
        assert_eq!(orchestrator.manager.containers().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn ignores_configs_without_an_entry_for_this_host() {
        let (orchestrator, mut rx) = orchestrator("h1");

        orchestrator
            .process(&desired("other-host", &["alpine:3"]))
            .await
            .expect("process");

        assert!(rx.try_recv().is_err());
        assert!(orchestrator.manager.containers().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn the_sidecar_is_exempt_from_removal() {
        let (orchestrator, mut rx) = orchestrator("h1");

        orchestrator
            .manager
            .pull_image_and_create_container(
                "docker.io/envoyproxy/envoy:distroless-v1.27-latest",
                None,
                None,
                false,
            )
            .await
            .expect("sidecar");

        orchestrator
            .process(&desired("h1", &[]))
            .await
            .expect("process");

        assert!(rx.try_recv().is_err());
        assert_eq!(orchestrator.manager.containers().await.expect("list").len(), 1);
    }
}
