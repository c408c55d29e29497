//! Docker-backed container manager.

use std::collections::HashMap;
use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, Port};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::debug;

use super::{
    BundleConfig, Container, Manager, PortBindings, BUNDLE_CONFIG_FILE_NAME, WILDCARD_IP,
};

// Containers run in a rootless-friendly network namespace; ports reach the
// host through explicit bindings and PublishAllPorts.
const CONTAINER_NETWORK_MODE: &str = "slirp4netns";

pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connects to the local Docker (compatible) engine and verifies it is
    /// reachable.
    pub async fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .context("failed to connect to the container engine")?;

        // check if a docker (compatible) engine is actually running
        client
            .info()
            .await
            .context("container engine is not responding")?;

        Ok(Self { client })
    }

    async fn bundle_configuration(&self, container_id: &str) -> Result<BundleConfig> {
        let options = bollard::container::DownloadFromContainerOptions {
            path: BUNDLE_CONFIG_FILE_NAME.to_string(),
        };

        let mut stream = self
            .client
            .download_from_container(container_id, Some(options));

        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive_bytes.extend_from_slice(&chunk?);
        }

        let mut archive = tar::Archive::new(archive_bytes.as_slice());
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?;

            if path.to_string_lossy() != BUNDLE_CONFIG_FILE_NAME {
                continue;
            }

            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;

            return Ok(serde_json::from_slice(&content)?);
        }

        Err(anyhow!(
            "cannot extract bundle descriptor from container {}",
            container_id
        ))
    }

    async fn container_service_port(&self, container_id: &str) -> Result<i32> {
        let inspection = self.client.inspect_container(container_id, None).await?;

        let bindings = inspection
            .host_config
            .and_then(|hc| hc.port_bindings)
            .unwrap_or_default();

        for (_, binding) in bindings {
            if let Some(binding) = binding.and_then(|b| b.into_iter().next()) {
                if let Some(host_port) = binding.host_port {
                    return Ok(host_port.parse()?);
                }
            }
        }

        Ok(-1)
    }
}

fn format_ports(ports: &[Port]) -> String {
    let mut formatted = Vec::with_capacity(ports.len());

    for port in ports {
        let ip = match port.ip.as_deref() {
            Some(ip) if !ip.is_empty() => ip,
            _ => WILDCARD_IP,
        };
        let proto = port
            .typ
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "tcp".into());

        match port.public_port {
            Some(public) => {
                formatted.push(format!("{}:{}->{}/{}", ip, public, port.private_port, proto))
            }
            None => formatted.push(format!("{}/{}", port.private_port, proto)),
        }
    }

    formatted.join(", ")
}

#[async_trait]
impl Manager for DockerManager {
    async fn containers(&self) -> Result<Vec<Container>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self.client.list_containers(Some(options)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            containers.push(Container {
                id: summary.id.unwrap_or_default(),
                first_name: summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .cloned()
                    .unwrap_or_default(),
                image: summary.image.unwrap_or_default(),
                ports: format_ports(summary.ports.as_deref().unwrap_or(&[])),
                status: summary.status.unwrap_or_default(),
            });
        }

        Ok(containers)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(Into::into)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.client
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .map_err(Into::into)
    }

    async fn pull_image_and_create_container(
        &self,
        name: &str,
        args: Option<Vec<String>>,
        port_bindings: Option<PortBindings>,
        verify_bundle_config: bool,
    ) -> Result<(String, i32)> {
        // download the image; the pull is complete once the progress
        // stream ends
        let options = CreateImageOptions {
            from_image: name.to_string(),
            ..Default::default()
        };
        let mut pull = self.client.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let info = progress?;
            if let Some(status) = info.status {
                debug!("Pulling {}: {}", name, status);
            }
        }

        let bindings = port_bindings.map(|bindings| {
            bindings
                .into_iter()
                .map(|(port, binding)| (port, Some(binding)))
                .collect::<HashMap<_, _>>()
        });

        let config = ContainerConfig {
            image: Some(name.to_string()),
            cmd: args,
            host_config: Some(HostConfig {
                network_mode: Some(CONTAINER_NETWORK_MODE.to_string()),
                publish_all_ports: Some(true),
                port_bindings: bindings,
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self.client.create_container::<String, _>(None, config).await?;

        self.client
            .start_container::<String>(&created.id, None)
            .await?;

        if verify_bundle_config {
            let bundle_config = self.bundle_configuration(&created.id).await?;
            let service_port = self.container_service_port(&created.id).await?;

            return Ok((bundle_config.bundle_id, service_port));
        }

        Ok((String::new(), -1))
    }

    async fn remove_image_and_container(
        &self,
        name: &str,
        verify_bundle_config: bool,
    ) -> Result<(String, i32)> {
        let options = ListContainersOptions {
            filters: HashMap::from([("ancestor".to_string(), vec![name.to_string()])]),
            ..Default::default()
        };
        let summaries = self.client.list_containers(Some(options)).await?;

        let Some(summary) = summaries.into_iter().next() else {
            bail!("cannot find container(s) running the supplied image");
        };
        let container_id = summary.id.unwrap_or_default();
        let image_id = summary.image_id.unwrap_or_default();

        let mut bundle_id = String::new();
        let mut service_port = -1;

        if verify_bundle_config {
            let bundle_config = self.bundle_configuration(&container_id).await?;
            bundle_id = bundle_config.bundle_id;
            service_port = self.container_service_port(&container_id).await?;
        }

        self.client
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;

        self.client
            .remove_image(
                &image_id,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await?;

        Ok((bundle_id, service_port))
    }

    async fn close(&self) -> Result<()> {
        // the bollard client tears its connections down on drop
        Ok(())
    }
}
