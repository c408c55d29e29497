//! Emulated container manager used in debug mode and in tests.
//!
//! Tracks virtual containers in memory, logs every operation, and hands
//! out deterministic bundle IDs and service ports.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use rand::Rng;

use super::{Container, Manager, PortBindings, WILDCARD_IP};

const STATUS_RUNNING: &str = "Up (emulated)";
const STATUS_EXITED: &str = "Exited (0)";
const BUNDLE_ID_FORMAT_BASE: &str = "com.carisma.app_";
const SERVICE_PORT_BASE: i32 = 8080;
const APP_IDX_BASE: i32 = 1;

struct VirtualContainer {
    app_idx: i32,
    container: Container,
}

struct Inner {
    containers: HashMap<String, VirtualContainer>,
    next_service_port: i32,
    next_app_idx: i32,
}

pub struct EmulatedManager {
    inner: Mutex<Inner>,
}

impl EmulatedManager {
    pub fn new() -> Self {
        debug!("Starting emulated container manager");

        Self {
            inner: Mutex::new(Inner {
                containers: HashMap::new(),
                next_service_port: SERVICE_PORT_BASE,
                next_app_idx: APP_IDX_BASE,
            }),
        }
    }
}

impl Default for EmulatedManager {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_random_container_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    let mut rng = rand::thread_rng();
    (0..64)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn format_port_bindings(port_bindings: &Option<PortBindings>) -> String {
    let Some(bindings) = port_bindings else {
        return String::new();
    };

    let mut formatted = Vec::new();
    for (container_port, host_ports) in bindings {
        for binding in host_ports {
            let ip = match binding.host_ip.as_deref() {
                Some(ip) if !ip.is_empty() => ip,
                _ => WILDCARD_IP,
            };
            let host_port = binding.host_port.as_deref().unwrap_or_default();

            formatted.push(format!("{}:{}->{}", ip, host_port, container_port));
        }
    }

    formatted.join(", ")
}

fn log_container_table(inner: &Inner) {
    debug!("currently deployed containers:");
    debug!(
        "|{:<64}|{:<64}|{:<16}|{:<16}",
        "id", "image", "status", "port(s)"
    );

    for (id, vc) in &inner.containers {
        debug!(
            "|{:<64}|{:<64}|{:<16}|{:<16}",
            id, vc.container.image, vc.container.status, vc.container.ports
        );
    }
}

#[async_trait]
impl Manager for EmulatedManager {
    async fn containers(&self) -> Result<Vec<Container>> {
        let inner = self.inner.lock().unwrap();

        Ok(inner
            .containers
            .values()
            .map(|vc| vc.container.clone())
            .collect())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.containers.get_mut(id) {
            Some(vc) => {
                vc.container.status = STATUS_RUNNING.into();
                debug!("starting container with ID {}", id);
                log_container_table(&inner);

                Ok(())
            }
            None => {
                log_container_table(&inner);

                Err(anyhow!("container not found: {}", id))
            }
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.containers.get_mut(id) {
            Some(vc) => {
                vc.container.status = STATUS_EXITED.into();
                debug!("stopping container with ID {}", id);
                log_container_table(&inner);

                Ok(())
            }
            None => {
                log_container_table(&inner);

                Err(anyhow!("container not found: {}", id))
            }
        }
    }

    async fn pull_image_and_create_container(
        &self,
        name: &str,
        _args: Option<Vec<String>>,
        port_bindings: Option<PortBindings>,
        _verify_bundle_config: bool,
    ) -> Result<(String, i32)> {
        let mut inner = self.inner.lock().unwrap();

        let id = generate_random_container_id();
        let app_idx = inner.next_app_idx;
        let service_port = inner.next_service_port;

        inner.containers.insert(
            id.clone(),
            VirtualContainer {
                app_idx,
                container: Container {
                    id: id.clone(),
                    first_name: id.clone(),
                    image: name.to_string(),
                    ports: format_port_bindings(&port_bindings),
                    status: STATUS_RUNNING.into(),
                },
            },
        );

        inner.next_service_port += 1;
        inner.next_app_idx += 1;

        debug!("deploying image {} into container with ID {}", name, id);
        log_container_table(&inner);

        Ok((format!("{}{}", BUNDLE_ID_FORMAT_BASE, app_idx), service_port))
    }

    async fn remove_image_and_container(
        &self,
        name: &str,
        _verify_bundle_config: bool,
    ) -> Result<(String, i32)> {
        let mut inner = self.inner.lock().unwrap();

        let found = inner
            .containers
            .iter()
            .find(|(_, vc)| vc.container.image == name)
            .map(|(id, vc)| (id.clone(), vc.app_idx));

        match found {
            Some((id, app_idx)) => {
                inner.containers.remove(&id);

                debug!(
                    "removing container with ID {} based on image with name {}",
                    id, name
                );
                log_container_table(&inner);

                Ok((
                    format!("{}{}", BUNDLE_ID_FORMAT_BASE, app_idx),
                    SERVICE_PORT_BASE - 1 + app_idx,
                ))
            }
            None => {
                log_container_table(&inner);

                Ok((String::new(), -1))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        debug!("shutting down emulated container manager");

        Ok(())
    }
}
